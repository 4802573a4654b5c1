//! High-level image operations.
//!
//! [`produce_viewport`] runs the fixed stage order for one planned size:
//! resize the source into a lossless raster, pass the raster through the
//! compression chain, then encode every target format from the (possibly
//! compressed) raster. A failing format does not stop the others.

use super::backend::{BackendError, ImageBackend};
use super::calculations::PlannedSize;
use super::params::{EncodeParams, Quality, ResizeParams};
use crate::compress::CompressionChain;
use crate::types::{Format, Viewport};
use std::path::{Path, PathBuf};

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// `<stem>-<placement>-<viewport>.<ext>`
pub fn artifact_file_name(stem: &str, placement: &str, viewport: Viewport, format: Format) -> String {
    format!("{stem}-{placement}-{viewport}.{}", format.extension())
}

/// Everything needed to produce one viewport of one placement.
#[derive(Debug, Clone)]
pub struct ViewportJob<'a> {
    pub source: &'a Path,
    /// Directory the artifacts are written into.
    pub output_dir: &'a Path,
    pub stem: &'a str,
    pub placement: &'a str,
    pub size: PlannedSize,
    pub formats: &'a [Format],
    pub quality: Quality,
}

impl ViewportJob<'_> {
    pub fn artifact_path(&self, format: Format) -> PathBuf {
        self.output_dir.join(artifact_file_name(
            self.stem,
            self.placement,
            self.size.viewport,
            format,
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducedArtifact {
    pub format: Format,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub struct ArtifactFailure {
    pub format: Format,
    pub error: BackendError,
}

#[derive(Debug)]
pub struct ViewportOutcome {
    pub size: PlannedSize,
    /// Produced artifacts in target-format order.
    pub artifacts: Vec<ProducedArtifact>,
    pub failures: Vec<ArtifactFailure>,
    /// Whether the external compression stage succeeded for this raster.
    pub compressed: bool,
}

/// Resize → compress → encode for one planned size.
///
/// Returns `Err` only when the resize stage fails, since no format can be
/// produced without the raster. Encode failures are collected per format.
pub fn produce_viewport(
    backend: &impl ImageBackend,
    chain: &CompressionChain,
    job: &ViewportJob<'_>,
) -> Result<ViewportOutcome> {
    std::fs::create_dir_all(job.output_dir)?;

    let raster = tempfile::Builder::new()
        .prefix(".raster-")
        .suffix(".png")
        .tempfile_in(job.output_dir)?
        .into_temp_path();

    backend.resize(&ResizeParams {
        source: job.source.to_path_buf(),
        output: raster.to_path_buf(),
        width: job.size.width,
        height: job.size.height,
    })?;

    let compressed = chain.compress(&raster, job.output_dir);

    let mut artifacts = Vec::new();
    let mut failures = Vec::new();
    for &format in job.formats {
        let output = job.artifact_path(format);
        let encoded = backend
            .encode(&EncodeParams {
                source: compressed.path().to_path_buf(),
                output: output.clone(),
                format,
                quality: job.quality,
            })
            .and_then(|()| Ok(std::fs::metadata(&output)?.len()));
        match encoded {
            Ok(size) => artifacts.push(ProducedArtifact {
                format,
                path: output,
                size,
            }),
            Err(error) => {
                tracing::warn!(
                    source = %job.source.display(),
                    placement = job.placement,
                    viewport = %job.size.viewport,
                    %format,
                    %error,
                    "artifact encode failed"
                );
                // A half-written artifact must not look fresh to the next run.
                let _ = std::fs::remove_file(&output);
                failures.push(ArtifactFailure { format, error });
            }
        }
    }

    Ok(ViewportOutcome {
        size: job.size,
        artifacts,
        failures,
        compressed: compressed.is_compressed(),
    })
}
