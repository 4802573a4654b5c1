//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the codec operations the pipeline
//! needs: identify, resize to a lossless raster, encode into a delivery
//! format, and sample pixels for placeholder hashing.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), built on the `image`
//! crate. Tests use the recording `MockBackend` below.

use super::params::{EncodeParams, ResizeParams};
use crate::types::Format;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Result of an identify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Downscaled RGB8 pixels of a source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbSample {
    pub width: u32,
    pub height: u32,
    /// Interleaved RGB, `width * height * 3` bytes.
    pub pixels: Vec<u8>,
}

/// Trait for image processing backends.
///
/// `Sync` so one backend can be shared across rayon workers.
pub trait ImageBackend: Sync {
    /// Get image dimensions.
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError>;

    /// Resize to exact dimensions, writing a lossless intermediate raster.
    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError>;

    /// Encode a raster into a delivery format.
    fn encode(&self, params: &EncodeParams) -> Result<(), BackendError>;

    /// Decode and shrink so the longer edge is at most `max_edge`.
    fn sample(&self, path: &Path, max_edge: u32) -> Result<RgbSample, BackendError>;

    /// Whether `encode` ignores quality for `format`.
    fn encodes_lossless(&self, format: Format) -> bool;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Mock backend that records operations and writes placeholder bytes so
    /// filesystem checks behave as in a real build.
    /// Uses Mutex (not RefCell) so it is Sync and works with rayon's par_iter.
    #[derive(Default)]
    pub struct MockBackend {
        /// Dimensions by source file name; unknown files fail to identify.
        pub dimensions: Mutex<HashMap<String, Dimensions>>,
        pub failing_formats: Mutex<HashSet<Format>>,
        pub lossless_formats: Mutex<HashSet<Format>>,
        pub fail_resize: Mutex<bool>,
        pub operations: Mutex<Vec<RecordedOp>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Identify(String),
        Resize {
            source: String,
            width: u32,
            height: u32,
        },
        Encode {
            source: String,
            output: String,
            format: Format,
            quality: u32,
        },
        Sample(String),
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_dimensions(entries: &[(&str, u32, u32)]) -> Self {
            let backend = Self::new();
            {
                let mut dims = backend.dimensions.lock().unwrap();
                for (name, width, height) in entries {
                    dims.insert(
                        name.to_string(),
                        Dimensions {
                            width: *width,
                            height: *height,
                        },
                    );
                }
            }
            backend
        }

        pub fn fail_format(&self, format: Format) {
            self.failing_formats.lock().unwrap().insert(format);
        }

        pub fn encode_lossless(&self, format: Format) {
            self.lossless_formats.lock().unwrap().insert(format);
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        pub fn encode_count(&self) -> usize {
            self.get_operations()
                .iter()
                .filter(|op| matches!(op, RecordedOp::Encode { .. }))
                .count()
        }
    }

    impl ImageBackend for MockBackend {
        fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
            self.operations
                .lock()
                .unwrap()
                .push(RecordedOp::Identify(file_name(path)));
            self.dimensions
                .lock()
                .unwrap()
                .get(&file_name(path))
                .copied()
                .ok_or_else(|| BackendError::ProcessingFailed("No mock dimensions".to_string()))
        }

        fn resize(&self, params: &ResizeParams) -> Result<(), BackendError> {
            self.operations.lock().unwrap().push(RecordedOp::Resize {
                source: file_name(&params.source),
                width: params.width,
                height: params.height,
            });
            if *self.fail_resize.lock().unwrap() {
                return Err(BackendError::ProcessingFailed("mock resize failure".into()));
            }
            std::fs::write(&params.output, vec![0u8; 4096])?;
            Ok(())
        }

        fn encode(&self, params: &EncodeParams) -> Result<(), BackendError> {
            self.operations.lock().unwrap().push(RecordedOp::Encode {
                source: file_name(&params.source),
                output: params.output.to_string_lossy().to_string(),
                format: params.format,
                quality: params.quality.value(),
            });
            if self.failing_formats.lock().unwrap().contains(&params.format) {
                return Err(BackendError::ProcessingFailed(format!(
                    "mock {} encoder failure",
                    params.format
                )));
            }
            std::fs::write(&params.output, format!("mock-{}", params.format))?;
            Ok(())
        }

        fn sample(&self, path: &Path, max_edge: u32) -> Result<RgbSample, BackendError> {
            self.operations
                .lock()
                .unwrap()
                .push(RecordedOp::Sample(file_name(path)));
            let side = max_edge.min(4);
            Ok(RgbSample {
                width: side,
                height: side,
                pixels: vec![128; (side * side * 3) as usize],
            })
        }

        fn encodes_lossless(&self, format: Format) -> bool {
            self.lossless_formats.lock().unwrap().contains(&format)
        }
    }

    #[test]
    fn mock_records_identify() {
        let backend = MockBackend::with_dimensions(&[("image.jpg", 800, 600)]);

        let result = backend.identify(Path::new("/test/image.jpg")).unwrap();
        assert_eq!(result.width, 800);
        assert_eq!(result.height, 600);

        let ops = backend.get_operations();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], RecordedOp::Identify(p) if p == "image.jpg"));
    }

    #[test]
    fn mock_identify_unknown_fails() {
        let backend = MockBackend::new();
        assert!(backend.identify(Path::new("/x.jpg")).is_err());
    }

    #[test]
    fn mock_encode_failure_is_per_format() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = MockBackend::new();
        backend.fail_format(Format::Avif);

        let encode = |format: Format| {
            backend.encode(&EncodeParams {
                source: tmp.path().join("raster.png"),
                output: tmp.path().join(format!("out.{}", format.extension())),
                format,
                quality: crate::imaging::Quality::new(80),
            })
        };
        assert!(encode(Format::Avif).is_err());
        assert!(encode(Format::Webp).is_ok());
        assert!(tmp.path().join("out.webp").exists());
    }
}
