//! Image processing, pure Rust.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image::image_dimensions` |
//! | **Resize** | Lanczos3 into a lossless PNG raster |
//! | **Encode** | AVIF (rav1e), WebP (lossless), JPEG, PNG |
//! | **Sample** | thumbnail to RGB8 for placeholder hashing |
//!
//! The module is split into:
//! - **Calculations**: pure functions for dimension math (unit testable)
//! - **Parameters**: data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: per-viewport resize → compress → encode, with per-format
//!   failure isolation

pub mod backend;
mod calculations;
pub mod operations;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, Dimensions, ImageBackend, RgbSample};
pub use calculations::{PlannedSize, plan_sizes, target_height};
pub use operations::{
    ArtifactFailure, ProducedArtifact, ViewportJob, ViewportOutcome, artifact_file_name,
    produce_viewport,
};
pub use params::{EncodeParams, Quality, ResizeParams};
pub use rust_backend::{RustBackend, is_supported_input};
