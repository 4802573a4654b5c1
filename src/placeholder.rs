//! Compact visual placeholders.
//!
//! Build time samples each source once and stores a [BlurHash] plus the
//! dominant color in the manifest. At delivery time [`decode`] turns the hash
//! back into a 32×32 RGB raster that can be painted immediately;
//! [`decode_or_fill`] never fails and falls back to a flat dominant-color fill.
//!
//! [BlurHash]: https://blurha.sh

use crate::imaging::RgbSample;
use crate::manifest::PlaceholderData;
use crate::registry::PlaceholderStrategy;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageEncoder;
use image::codecs::png::PngEncoder;
use std::f32::consts::PI;
use thiserror::Error;

/// Side of the decoded placeholder raster.
pub const PLACEHOLDER_SIZE: u32 = 32;

/// Components used when encoding at build time.
pub const COMPONENTS_X: u32 = 4;
pub const COMPONENTS_Y: u32 = 3;

/// Fill used when neither the hash nor the dominant color is usable.
pub const NEUTRAL_FILL: [u8; 3] = [128, 128, 128];

const BASE83: &[u8; 83] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz#$%*+,-.:;=?@[]^_{|}~";

#[derive(Error, Debug, PartialEq)]
pub enum PlaceholderError {
    #[error("hash too short")]
    TooShort,
    #[error("hash length {actual} does not match {expected} for its component count")]
    Length { expected: usize, actual: usize },
    #[error("invalid base83 character {0:?}")]
    InvalidCharacter(char),
    #[error("component count must be 1-9, got {0}x{1}")]
    Components(u32, u32),
    #[error("sample has no pixels")]
    EmptySample,
    #[error("invalid color {0:?}")]
    InvalidColor(String),
    #[error("PNG encode failed: {0}")]
    Png(String),
}

/// A small decoded RGB8 raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PlaceholderImage {
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            width,
            height,
            pixels: rgb.repeat((width * height) as usize),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * self.width + x) * 3) as usize;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    /// Encode as a `data:image/png;base64,...` URL for inline painting.
    pub fn to_png_data_url(&self) -> Result<String, PlaceholderError> {
        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(
                &self.pixels,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| PlaceholderError::Png(e.to_string()))?;
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
    }
}

fn srgb_to_linear(value: u8) -> f32 {
    let v = value as f32 / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f32) -> u8 {
    let v = value.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        (v * 12.92 * 255.0 + 0.5) as u8
    } else {
        ((1.055 * v.powf(1.0 / 2.4) - 0.055) * 255.0 + 0.5) as u8
    }
}

fn sign_pow(value: f32, exp: f32) -> f32 {
    value.abs().powf(exp).copysign(value)
}

fn encode_base83(value: u32, length: u32, out: &mut String) {
    for i in 1..=length {
        let digit = (value / 83u32.pow(length - i)) % 83;
        out.push(BASE83[digit as usize] as char);
    }
}

fn decode_base83(s: &str) -> Result<u32, PlaceholderError> {
    s.chars().try_fold(0u32, |acc, c| {
        let digit = BASE83
            .iter()
            .position(|&b| b as char == c)
            .ok_or(PlaceholderError::InvalidCharacter(c))?;
        Ok(acc * 83 + digit as u32)
    })
}

/// Encode an RGB8 sample into a BlurHash with `cx`×`cy` components.
pub fn encode(sample: &RgbSample, cx: u32, cy: u32) -> Result<String, PlaceholderError> {
    if !(1..=9).contains(&cx) || !(1..=9).contains(&cy) {
        return Err(PlaceholderError::Components(cx, cy));
    }
    let (width, height) = (sample.width, sample.height);
    if width == 0 || height == 0 || sample.pixels.len() < (width * height * 3) as usize {
        return Err(PlaceholderError::EmptySample);
    }

    let mut factors = Vec::with_capacity((cx * cy) as usize);
    for j in 0..cy {
        for i in 0..cx {
            let normalisation = if i == 0 && j == 0 { 1.0 } else { 2.0 };
            let mut sum = [0.0f32; 3];
            for y in 0..height {
                for x in 0..width {
                    let basis = (PI * i as f32 * x as f32 / width as f32).cos()
                        * (PI * j as f32 * y as f32 / height as f32).cos();
                    let p = ((y * width + x) * 3) as usize;
                    for (c, s) in sum.iter_mut().enumerate() {
                        *s += basis * srgb_to_linear(sample.pixels[p + c]);
                    }
                }
            }
            let scale = normalisation / (width * height) as f32;
            factors.push(sum.map(|s| s * scale));
        }
    }

    let (dc, ac) = factors.split_first().ok_or(PlaceholderError::EmptySample)?;
    let mut hash = String::with_capacity(4 + 2 * ac.len() + 2);
    encode_base83((cx - 1) + (cy - 1) * 9, 1, &mut hash);

    let max_value = if ac.is_empty() {
        encode_base83(0, 1, &mut hash);
        1.0
    } else {
        let actual_max = ac
            .iter()
            .flat_map(|f| f.iter())
            .fold(0.0f32, |m, v| m.max(v.abs()));
        let quantised = (actual_max * 166.0 - 0.5).floor().clamp(0.0, 82.0) as u32;
        encode_base83(quantised, 1, &mut hash);
        (quantised + 1) as f32 / 166.0
    };

    let dc_value = ((linear_to_srgb(dc[0]) as u32) << 16)
        | ((linear_to_srgb(dc[1]) as u32) << 8)
        | linear_to_srgb(dc[2]) as u32;
    encode_base83(dc_value, 4, &mut hash);

    for f in ac {
        let q = |v: f32| (sign_pow(v / max_value, 0.5) * 9.0 + 9.5).floor().clamp(0.0, 18.0) as u32;
        encode_base83(q(f[0]) * 19 * 19 + q(f[1]) * 19 + q(f[2]), 2, &mut hash);
    }
    Ok(hash)
}

/// Decode a BlurHash into a [`PLACEHOLDER_SIZE`]² raster.
pub fn decode(hash: &str) -> Result<PlaceholderImage, PlaceholderError> {
    decode_sized(hash, PLACEHOLDER_SIZE, PLACEHOLDER_SIZE)
}

pub fn decode_sized(hash: &str, width: u32, height: u32) -> Result<PlaceholderImage, PlaceholderError> {
    if hash.len() < 6 {
        return Err(PlaceholderError::TooShort);
    }
    if !hash.is_ascii() {
        let c = hash.chars().find(|c| !c.is_ascii()).unwrap_or('?');
        return Err(PlaceholderError::InvalidCharacter(c));
    }
    let size_flag = decode_base83(&hash[0..1])?;
    let ny = size_flag / 9 + 1;
    let nx = size_flag % 9 + 1;
    let expected = 4 + 2 * (nx * ny) as usize;
    if hash.len() != expected {
        return Err(PlaceholderError::Length {
            expected,
            actual: hash.len(),
        });
    }

    let max_value = (decode_base83(&hash[1..2])? + 1) as f32 / 166.0;
    let mut colors = Vec::with_capacity((nx * ny) as usize);
    let dc = decode_base83(&hash[2..6])?;
    colors.push([
        srgb_to_linear((dc >> 16) as u8),
        srgb_to_linear((dc >> 8) as u8),
        srgb_to_linear(dc as u8),
    ]);
    for i in 1..(nx * ny) as usize {
        let value = decode_base83(&hash[4 + i * 2..6 + i * 2])?;
        let channel = |q: u32| sign_pow((q as f32 - 9.0) / 9.0, 2.0) * max_value;
        colors.push([
            channel(value / (19 * 19)),
            channel((value / 19) % 19),
            channel(value % 19),
        ]);
    }

    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let mut rgb = [0.0f32; 3];
            for j in 0..ny {
                for i in 0..nx {
                    let basis = (PI * x as f32 * i as f32 / width as f32).cos()
                        * (PI * y as f32 * j as f32 / height as f32).cos();
                    let color = colors[(i + j * nx) as usize];
                    for c in 0..3 {
                        rgb[c] += color[c] * basis;
                    }
                }
            }
            pixels.extend(rgb.map(linear_to_srgb));
        }
    }
    Ok(PlaceholderImage {
        width,
        height,
        pixels,
    })
}

/// Decode `hash`, or fill with `dominant_color` (then neutral gray) when the
/// hash is missing or invalid.
pub fn decode_or_fill(hash: Option<&str>, dominant_color: Option<&str>) -> PlaceholderImage {
    if let Some(hash) = hash {
        match decode(hash) {
            Ok(img) => return img,
            Err(e) => tracing::debug!(hash, error = %e, "placeholder decode failed, using fill"),
        }
    }
    let fill = dominant_color
        .and_then(|c| parse_hex_color(c).ok())
        .unwrap_or(NEUTRAL_FILL);
    PlaceholderImage::solid(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, fill)
}

/// Average color of the sample as `#rrggbb`.
pub fn dominant_color(sample: &RgbSample) -> Option<String> {
    let count = sample.pixels.len() / 3;
    if count == 0 {
        return None;
    }
    let mut sum = [0u64; 3];
    for px in sample.pixels.chunks_exact(3) {
        for c in 0..3 {
            sum[c] += px[c] as u64;
        }
    }
    let [r, g, b] = sum.map(|s| (s / count as u64) as u8);
    Some(format!("#{r:02x}{g:02x}{b:02x}"))
}

pub fn parse_hex_color(value: &str) -> Result<[u8; 3], PlaceholderError> {
    let invalid = || PlaceholderError::InvalidColor(value.to_string());
    let hex = value.strip_prefix('#').ok_or_else(invalid)?;
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(invalid());
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

/// Placeholder data for a placement's strategy.
pub fn placeholder_for(strategy: PlaceholderStrategy, sample: &RgbSample) -> PlaceholderData {
    match strategy {
        PlaceholderStrategy::None => PlaceholderData::default(),
        PlaceholderStrategy::DominantColor => PlaceholderData {
            blurhash: None,
            dominant_color: dominant_color(sample),
        },
        PlaceholderStrategy::Blur => PlaceholderData {
            blurhash: encode(sample, COMPONENTS_X, COMPONENTS_Y)
                .inspect_err(|e| tracing::debug!(error = %e, "blurhash encode failed"))
                .ok(),
            dominant_color: dominant_color(sample),
        },
    }
}
