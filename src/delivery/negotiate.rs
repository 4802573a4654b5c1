//! Format negotiation.
//!
//! A client's format support comes from a [`CapabilityProbe`]. The negotiator
//! walks a placement's preferred formats in order and picks the first one the
//! probe accepts, defaulting to the universal format. At fetch time a format
//! that fails to decode steps on to the placement's later preferences, then
//! down the fixed [`fallback_for`] table, instead of surfacing an error.

use crate::imaging::rust_backend::encode_to;
use crate::types::Format;
use image::{DynamicImage, RgbImage};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Next format to try when `format` fails to decode.
///
/// AVIF → WebP → JPEG, PNG → JPEG. JPEG is the end of every chain.
pub fn fallback_for(format: Format) -> Option<Format> {
    match format {
        Format::Avif => Some(Format::Webp),
        Format::Webp => Some(Format::Jpeg),
        Format::Png => Some(Format::Jpeg),
        Format::Jpeg => None,
    }
}

/// `format` followed by every fallback below it.
pub fn fallback_chain(format: Format) -> Vec<Format> {
    std::iter::successors(Some(format), |f| fallback_for(*f)).collect()
}

/// Whether a client can decode a format.
pub trait CapabilityProbe: Send + Sync {
    fn supports(&self, format: Format) -> bool;
}

/// First preferred format the client supports, else the universal format.
pub fn select_format(preferred: &[Format], capabilities: &dyn CapabilityProbe) -> Format {
    preferred
        .iter()
        .copied()
        .find(|f| capabilities.supports(*f))
        .unwrap_or(Format::UNIVERSAL)
}

/// Fixed capability set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticCapabilities {
    supported: HashSet<Format>,
}

impl StaticCapabilities {
    pub fn new(formats: &[Format]) -> Self {
        Self {
            supported: formats.iter().copied().collect(),
        }
    }

    pub fn all() -> Self {
        Self::new(&Format::ALL)
    }
}

impl CapabilityProbe for StaticCapabilities {
    fn supports(&self, format: Format) -> bool {
        self.supported.contains(&format)
    }
}

/// Capabilities advertised by an HTTP `Accept` header.
///
/// JPEG and PNG are assumed everywhere; AVIF and WebP only when their MIME
/// type is listed explicitly with a non-zero `q`. Wildcards do not count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptCapabilities {
    avif: bool,
    webp: bool,
}

impl AcceptCapabilities {
    pub fn from_header(accept: &str) -> Self {
        let mut caps = Self {
            avif: false,
            webp: false,
        };
        for part in accept.split(',') {
            let mut params = part.split(';').map(str::trim);
            let mime = params.next().unwrap_or("").to_ascii_lowercase();
            let refused = params.any(|p| {
                p.strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            if refused {
                continue;
            }
            match Format::ALL.into_iter().find(|f| f.mime_type() == mime) {
                Some(Format::Avif) => caps.avif = true,
                Some(Format::Webp) => caps.webp = true,
                _ => {}
            }
        }
        caps
    }
}

impl CapabilityProbe for AcceptCapabilities {
    fn supports(&self, format: Format) -> bool {
        match format {
            Format::Avif => self.avif,
            Format::Webp => self.webp,
            Format::Jpeg | Format::Png => true,
        }
    }
}

/// Whether `bytes` decode as `format` with the codecs linked into this build.
///
/// AVIF is checked at the container level: the `image` crate only encodes
/// AVIF here, so a parseable primary item counts as decodable.
pub fn can_decode(format: Format, bytes: &[u8]) -> bool {
    match format {
        Format::Avif => avif_parse::read_avif(&mut std::io::Cursor::new(bytes))
            .and_then(|avif| avif.primary_item_metadata())
            .is_ok(),
        Format::Webp => image::load_from_memory_with_format(bytes, image::ImageFormat::WebP).is_ok(),
        Format::Jpeg => image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg).is_ok(),
        Format::Png => image::load_from_memory_with_format(bytes, image::ImageFormat::Png).is_ok(),
    }
}

/// Probes support by decoding a minimal sample image per format.
pub struct DecodeProbe {
    samples: HashMap<Format, Vec<u8>>,
}

impl DecodeProbe {
    /// Build samples with this crate's own encoders. A format whose sample
    /// cannot be encoded is reported unsupported.
    pub fn new() -> Self {
        let pixel = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255])));
        let mut samples = HashMap::new();
        for format in Format::ALL {
            let mut bytes = Vec::new();
            match encode_to(&pixel, format, 50, &mut bytes) {
                Ok(()) => {
                    samples.insert(format, bytes);
                }
                Err(e) => tracing::debug!(%format, error = %e, "cannot build probe sample"),
            }
        }
        Self { samples }
    }

    pub fn from_samples(samples: HashMap<Format, Vec<u8>>) -> Self {
        Self { samples }
    }
}

impl Default for DecodeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityProbe for DecodeProbe {
    fn supports(&self, format: Format) -> bool {
        self.samples
            .get(&format)
            .is_some_and(|bytes| can_decode(format, bytes))
    }
}

/// Memoizing negotiator over a probe.
pub struct FormatNegotiator {
    probe: Box<dyn CapabilityProbe>,
    memo: Mutex<HashMap<Format, bool>>,
}

impl FormatNegotiator {
    pub fn new(probe: impl CapabilityProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn supported(&self, format: Format) -> bool {
        if let Ok(memo) = self.memo.lock()
            && let Some(&known) = memo.get(&format)
        {
            return known;
        }
        let result = self.probe.supports(format);
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(format, result);
        }
        result
    }

    pub fn select(&self, preferred: &[Format]) -> Format {
        select_format(preferred, self)
    }

    /// Formats to try in order: the selected format, the preferences listed
    /// after it, then the rest of its fallback chain. Ends with the universal
    /// format.
    pub fn candidates(&self, preferred: &[Format]) -> Vec<Format> {
        let selected = self.select(preferred);
        let later = preferred.iter().copied().skip_while(|f| *f != selected);
        let mut out: Vec<Format> = Vec::new();
        for format in later.chain(fallback_chain(selected)) {
            if !out.contains(&format) {
                out.push(format);
            }
        }
        out
    }
}

impl CapabilityProbe for FormatNegotiator {
    fn supports(&self, format: Format) -> bool {
        self.supported(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PREFERRED: [Format; 3] = [Format::Avif, Format::Webp, Format::Jpeg];

    #[test]
    fn first_supported_format_wins() {
        assert_eq!(select_format(&PREFERRED, &StaticCapabilities::all()), Format::Avif);
        let no_avif = StaticCapabilities::new(&[Format::Webp, Format::Jpeg]);
        assert_eq!(select_format(&PREFERRED, &no_avif), Format::Webp);
        let jpeg_only = StaticCapabilities::new(&[Format::Jpeg]);
        assert_eq!(select_format(&PREFERRED, &jpeg_only), Format::Jpeg);
    }

    #[test]
    fn defaults_to_universal_when_nothing_supported() {
        let none = StaticCapabilities::new(&[]);
        assert_eq!(select_format(&[Format::Avif, Format::Webp], &none), Format::Jpeg);
    }

    #[test]
    fn fallback_table() {
        assert_eq!(fallback_chain(Format::Avif), vec![Format::Avif, Format::Webp, Format::Jpeg]);
        assert_eq!(fallback_chain(Format::Png), vec![Format::Png, Format::Jpeg]);
        assert_eq!(fallback_chain(Format::Jpeg), vec![Format::Jpeg]);
    }

    #[test]
    fn accept_header_parsing() {
        let chrome = AcceptCapabilities::from_header(
            "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8",
        );
        assert!(chrome.supports(Format::Avif));
        assert!(chrome.supports(Format::Webp));

        let old = AcceptCapabilities::from_header("image/webp, */*");
        assert!(!old.supports(Format::Avif));
        assert!(old.supports(Format::Webp));

        let refused = AcceptCapabilities::from_header("image/avif;q=0, image/*");
        assert!(!refused.supports(Format::Avif));
        assert!(refused.supports(Format::Jpeg));
    }

    #[test]
    fn decode_probe_supports_linked_codecs() {
        let probe = DecodeProbe::new();
        assert!(probe.supports(Format::Jpeg));
        assert!(probe.supports(Format::Png));
        assert!(probe.supports(Format::Webp));
        assert!(probe.supports(Format::Avif));
    }

    #[test]
    fn decode_probe_rejects_broken_sample() {
        let mut samples = HashMap::new();
        samples.insert(Format::Avif, b"not avif".to_vec());
        let probe = DecodeProbe::from_samples(samples);
        assert!(!probe.supports(Format::Avif));
        assert!(!probe.supports(Format::Webp));
        assert_eq!(select_format(&PREFERRED, &probe), Format::Jpeg);
    }

    struct CountingProbe(Arc<AtomicUsize>);

    impl CapabilityProbe for CountingProbe {
        fn supports(&self, format: Format) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            format == Format::Webp
        }
    }

    #[test]
    fn negotiator_memoizes_probe_results() {
        let calls = Arc::new(AtomicUsize::new(0));
        let negotiator = FormatNegotiator::new(CountingProbe(Arc::clone(&calls)));
        assert_eq!(negotiator.select(&PREFERRED), Format::Webp);
        assert_eq!(negotiator.select(&PREFERRED), Format::Webp);
        assert_eq!(negotiator.candidates(&PREFERRED), vec![Format::Webp, Format::Jpeg]);
        // avif and webp probed once each
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn candidates_follow_placement_preferences() {
        let negotiator = FormatNegotiator::new(StaticCapabilities::all());
        assert_eq!(
            negotiator.candidates(&[Format::Webp, Format::Png]),
            vec![Format::Webp, Format::Png, Format::Jpeg]
        );
        assert_eq!(negotiator.candidates(&PREFERRED), PREFERRED.to_vec());
        assert_eq!(negotiator.candidates(&[Format::Jpeg]), vec![Format::Jpeg]);

        let jpeg_only = FormatNegotiator::new(StaticCapabilities::new(&[Format::Jpeg]));
        assert_eq!(jpeg_only.candidates(&[Format::Webp]), vec![Format::Jpeg]);
    }
}
