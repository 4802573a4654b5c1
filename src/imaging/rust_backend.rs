//! Pure Rust image processing backend.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, WebP) | `image` crate |
//! | Resize | `image::DynamicImage::resize_exact` with `Lanczos3` |
//! | Intermediate raster | lossless PNG |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |
//! | Encode → WebP | `image::codecs::webp::WebPEncoder` (lossless only) |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` |
//! | Encode → PNG | `image::codecs::png::PngEncoder` (best compression) |
//!
//! The `image` crate's WebP encoder is lossless, so quality does not apply to
//! WebP artifacts; the external compression stage is what shrinks them. The
//! manifest records no encoder quality for them.
//!
//! AVIF is only encoded. Without a native AV1 decoder AVIF files are not
//! accepted as sources.

use super::backend::{BackendError, Dimensions, ImageBackend, RgbSample};
use super::params::{EncodeParams, ResizeParams};
use crate::types::Format;
use image::codecs::png::{CompressionType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Whether `path` looks like a source image this backend can read.
pub fn is_supported_input(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(Format::from_extension)
        .is_some_and(|format| format != Format::Avif)
}

/// Backend built on the `image` crate ecosystem.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and decode an image from disk.
fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    ImageReader::open(path)
        .map_err(BackendError::Io)?
        .with_guessed_format()
        .map_err(BackendError::Io)?
        .decode()
        .map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
        })
}

/// Encode `img` as `format` into any writer.
pub(crate) fn encode_to<W: Write>(
    img: &DynamicImage,
    format: Format,
    quality: u32,
    writer: W,
) -> Result<(), BackendError> {
    let result = match format {
        Format::Avif => img.write_with_encoder(
            image::codecs::avif::AvifEncoder::new_with_speed_quality(writer, 6, quality as u8),
        ),
        Format::Webp => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(image::codecs::webp::WebPEncoder::new_lossless(writer))
        }
        Format::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(image::codecs::jpeg::JpegEncoder::new_with_quality(
                writer,
                quality as u8,
            ))
        }
        Format::Png => img.write_with_encoder(PngEncoder::new_with_quality(
            writer,
            CompressionType::Best,
            image::codecs::png::FilterType::Adaptive,
        )),
    };
    result.map_err(|e| BackendError::ProcessingFailed(format!("{} encode failed: {}", format, e)))
}

fn save_image(
    img: &DynamicImage,
    path: &Path,
    format: Format,
    quality: u32,
) -> Result<(), BackendError> {
    let file = std::fs::File::create(path).map_err(BackendError::Io)?;
    let mut writer = BufWriter::new(file);
    encode_to(img, format, quality, &mut writer)?;
    writer.flush().map_err(BackendError::Io)
}

impl ImageBackend for RustBackend {
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
        let (width, height) = image::image_dimensions(path).map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to read dimensions: {}", e))
        })?;
        Ok(Dimensions { width, height })
    }

    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError> {
        let img = load_image(&params.source)?;
        let resized = if img.width() == params.width && img.height() == params.height {
            img
        } else {
            img.resize_exact(params.width, params.height, FilterType::Lanczos3)
        };
        save_image(&resized, &params.output, Format::Png, 100)
    }

    fn encode(&self, params: &EncodeParams) -> Result<(), BackendError> {
        let img = load_image(&params.source)?;
        save_image(&img, &params.output, params.format, params.quality.value())
    }

    fn sample(&self, path: &Path, max_edge: u32) -> Result<RgbSample, BackendError> {
        let img = load_image(path)?;
        let small = img.thumbnail(max_edge, max_edge).to_rgb8();
        Ok(RgbSample {
            width: small.width(),
            height: small.height(),
            pixels: small.into_raw(),
        })
    }

    fn encodes_lossless(&self, format: Format) -> bool {
        matches!(format, Format::Webp | Format::Png)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Quality;
    use image::{ImageEncoder, RgbImage};

    /// Create a small valid PNG file with the given dimensions.
    fn create_test_png(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let file = std::fs::File::create(path).unwrap();
        PngEncoder::new(BufWriter::new(file))
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
    }

    #[test]
    fn supported_input_extensions() {
        assert!(is_supported_input(Path::new("a/b.PNG")));
        assert!(is_supported_input(Path::new("b.jpeg")));
        assert!(is_supported_input(Path::new("b.webp")));
        assert!(!is_supported_input(Path::new("b.avif")));
        assert!(!is_supported_input(Path::new("b.gif")));
        assert!(!is_supported_input(Path::new("noext")));
    }

    #[test]
    fn identify_synthetic_png() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("test.png");
        create_test_png(&path, 200, 150);

        let dims = RustBackend::new().identify(&path).unwrap();
        assert_eq!(dims, Dimensions { width: 200, height: 150 });
    }

    #[test]
    fn identify_nonexistent_file_errors() {
        let result = RustBackend::new().identify(Path::new("/nonexistent/image.jpg"));
        assert!(result.is_err());
    }

    #[test]
    fn resize_writes_exact_raster() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("source.png");
        create_test_png(&source, 400, 300);

        let output = tmp.path().join("raster.png");
        let backend = RustBackend::new();
        backend
            .resize(&ResizeParams {
                source,
                output: output.clone(),
                width: 200,
                height: 150,
            })
            .unwrap();

        assert_eq!(
            backend.identify(&output).unwrap(),
            Dimensions { width: 200, height: 150 }
        );
    }

    #[test]
    fn encode_every_format() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raster = tmp.path().join("raster.png");
        create_test_png(&raster, 64, 48);
        let backend = RustBackend::new();

        for format in Format::ALL {
            let output = tmp.path().join(format!("out.{}", format.extension()));
            backend
                .encode(&EncodeParams {
                    source: raster.clone(),
                    output: output.clone(),
                    format,
                    quality: Quality::new(75),
                })
                .unwrap();
            assert!(std::fs::metadata(&output).unwrap().len() > 0, "{format}");
        }

        let avif = std::fs::read(tmp.path().join("out.avif")).unwrap();
        assert!(crate::delivery::can_decode(Format::Avif, &avif));
        let jpg_dims = backend.identify(&tmp.path().join("out.jpg")).unwrap();
        assert_eq!(jpg_dims, Dimensions { width: 64, height: 48 });
    }

    #[test]
    fn quality_applies_to_lossy_formats_only() {
        let backend = RustBackend::new();
        assert!(backend.encodes_lossless(Format::Webp));
        assert!(backend.encodes_lossless(Format::Png));
        assert!(!backend.encodes_lossless(Format::Avif));
        assert!(!backend.encodes_lossless(Format::Jpeg));
    }

    #[test]
    fn encode_undecodable_raster_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raster = tmp.path().join("raster.png");
        std::fs::write(&raster, b"not an image").unwrap();

        let result = RustBackend::new().encode(&EncodeParams {
            source: raster,
            output: tmp.path().join("out.jpg"),
            format: Format::Jpeg,
            quality: Quality::new(75),
        });
        assert!(matches!(result, Err(BackendError::ProcessingFailed(_))));
    }

    #[test]
    fn sample_fits_within_max_edge() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("source.png");
        create_test_png(&source, 400, 200);

        let sample = RustBackend::new().sample(&source, 32).unwrap();
        assert_eq!(sample.width, 32);
        assert_eq!(sample.height, 16);
        assert_eq!(sample.pixels.len(), 32 * 16 * 3);
    }
}
