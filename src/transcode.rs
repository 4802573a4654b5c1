//! Build-time transcoding pipeline.
//!
//! Walks the input directory, resolves every source image to its placements
//! and produces one artifact per (placement, viewport, format) under the
//! output directory, recording each one in the [`Manifest`].
//!
//! ## Skips
//!
//! Two independent checks keep re-runs cheap:
//!
//! - **Hash skip**: the source's [`ContentHash`](crate::cache::ContentHash) is
//!   in the [`OptimizationCache`] and every artifact the manifest lists for it
//!   exists. The whole image is skipped without identifying it.
//! - **Filesystem skip**: per (source, placement), every (viewport, format)
//!   artifact the placement would produce exists and is not older than the
//!   source. A format that failed on an earlier run is therefore retried.
//!
//! `force` bypasses both.
//!
//! ## Scanning
//!
//! Symlinks are followed; [`SeenPaths`] makes sure a file reachable under two
//! paths is processed once. An entry the walk cannot read is logged and
//! counted as an error. Manifest entries of sources that are no longer found
//! are dropped, but only after a scan without errors.
//!
//! ## Output Structure
//!
//! ```text
//! public/optimized/
//! ├── image-manifest.json
//! ├── .optimization-cache.json
//! └── hero/
//!     ├── hero-hero-main-mobile.avif
//!     ├── hero-hero-main-mobile.webp
//!     ├── hero-hero-main-mobile.jpg
//!     ├── ...
//!     └── hero-og-image-desktop.jpg
//! ```
//!
//! ## Parallel Processing
//!
//! Images are processed in parallel on the global rayon pool. The cache,
//! seen-path set and manifest are shared between workers; counters are
//! atomics. A content hash is recorded only when its image finished without a
//! single failed artifact.

use crate::cache::{self, OptimizationCache, OutputStats, RunStats, SeenPaths, StatsSnapshot};
use crate::compress::CompressionChain;
use crate::imaging::{
    ImageBackend, PlannedSize, Quality, ViewportJob, artifact_file_name, is_supported_input,
    plan_sizes, produce_viewport,
};
use crate::manifest::{Manifest, ManifestEntry, ManifestError, PlaceholderData};
use crate::placeholder;
use crate::registry::{LocationRegistry, PlaceholderStrategy, PlacementSpec};
use crate::types::{Format, Viewport};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::Sender;
use std::time::SystemTime;
use thiserror::Error;

/// Longer edge of the sample used for placeholder hashing.
const PLACEHOLDER_SAMPLE_EDGE: u32 = 64;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot scan input directory: {0}")]
    Scan(#[from] walkdir::Error),
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),
}

/// Stage switches for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOptions {
    /// Bypass both the hash skip and the filesystem skip.
    pub force: bool,
    /// Produce every viewport; when off only the desktop viewport is
    /// produced, at the source's native size.
    pub resize: bool,
    /// Keep WebP among target formats.
    pub webp: bool,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            force: false,
            resize: true,
            webp: true,
        }
    }
}

/// A source image found under the input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub path: PathBuf,
    /// Path relative to the input root, `/` separated. This is the
    /// manifest key.
    pub relative: String,
}

impl SourceImage {
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directory part of `relative`, empty for files at the root.
    pub fn relative_dir(&self) -> &str {
        self.relative
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("")
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Sources found under the input directory.
#[derive(Debug, Default)]
pub struct SourceScan {
    pub sources: Vec<SourceImage>,
    /// Entries that could not be read (broken symlinks, unreadable
    /// directories, link loops).
    pub errors: usize,
}

/// Find supported source images under `input`, sorted by relative path.
///
/// Hidden files and directories are ignored, as is `exclude` (the output
/// directory when it lives inside the input). Only an unreadable `input`
/// itself is an error; bad entries below it are logged and counted.
pub fn scan_sources(input: &Path, exclude: Option<&Path>) -> Result<SourceScan, TranscodeError> {
    let exclude = exclude.and_then(|p| std::fs::canonicalize(p).ok());
    let mut scan = SourceScan::default();
    let walker = walkdir::WalkDir::new(input)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !is_hidden(e)
                && !exclude
                    .as_ref()
                    .is_some_and(|ex| std::fs::canonicalize(e.path()).is_ok_and(|p| &p == ex))
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                scan.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_supported_input(entry.path()) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(input)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        scan.sources.push(SourceImage {
            path: entry.path().to_path_buf(),
            relative,
        });
    }
    scan.sources.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(scan)
}

// ============================================================================
// Progress events
// ============================================================================

/// Progress reported while the pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// Work was done for at least one placement.
    ImageProcessed {
        index: usize,
        source_path: String,
        placements: Vec<PlacementReport>,
    },
    /// Hash skip: nothing changed since the last run.
    ImageCached { index: usize, source_path: String },
    /// Source could not be hashed or identified.
    ImageFailed {
        index: usize,
        source_path: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacementReport {
    pub placement: String,
    pub status: PlacementStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlacementStatus {
    /// Filesystem skip: artifacts are newer than the source.
    Fresh,
    /// Source is narrower than every viewport of the placement.
    TooSmall,
    Produced(Vec<ViewportReport>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewportReport {
    pub viewport: Viewport,
    pub width: u32,
    pub height: u32,
    pub compressed: bool,
    pub variants: Vec<VariantInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantInfo {
    pub format: Format,
    pub status: VariantStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariantStatus {
    Encoded { bytes: u64 },
    Failed(String),
}

// ============================================================================
// Pipeline
// ============================================================================

/// Formats a placement produces under the run's options. Never empty: when
/// every preferred format is disabled the universal format is used.
pub fn target_formats(spec: &PlacementSpec, options: &TranscodeOptions) -> Vec<Format> {
    let formats: Vec<Format> = spec
        .preferred_formats
        .iter()
        .copied()
        .filter(|f| options.webp || *f != Format::Webp)
        .collect();
    if formats.is_empty() {
        vec![Format::UNIVERSAL]
    } else {
        formats
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Per-run state shared by the workers.
pub struct RunContext<'a> {
    pub cache: &'a OptimizationCache,
    pub seen: &'a SeenPaths,
    pub progress: Option<Sender<ProcessEvent>>,
}

/// Result of one pipeline run.
#[derive(Debug)]
pub struct TranscodeResult {
    pub manifest: Manifest,
    pub stats: StatsSnapshot,
}

/// The resize → compress → encode pipeline over a batch of sources.
pub struct Transcoder<'a, B: ImageBackend> {
    pub backend: &'a B,
    pub registry: &'a LocationRegistry,
    pub chain: &'a CompressionChain,
    pub output_dir: &'a Path,
    pub options: TranscodeOptions,
}

#[derive(Default)]
struct ImageTally {
    encoded: u32,
    bytes: u64,
    smallest: Option<u64>,
    failures: u32,
}

impl<B: ImageBackend> Transcoder<'_, B> {
    /// Process every source in parallel. Never fails as a whole: problems are
    /// counted in the returned stats.
    pub fn run(&self, sources: &[SourceImage], ctx: &RunContext<'_>, manifest: Manifest) -> TranscodeResult {
        let manifest = Mutex::new(manifest);
        let stats = RunStats::default();

        sources.par_iter().enumerate().for_each(|(i, source)| {
            if let Some(event) = self.process_image(i + 1, source, ctx, &manifest, &stats)
                && let Some(tx) = &ctx.progress
            {
                let _ = tx.send(event);
            }
        });

        TranscodeResult {
            manifest: manifest.into_inner().unwrap_or_else(|e| e.into_inner()),
            stats: stats.snapshot(),
        }
    }

    fn process_image(
        &self,
        index: usize,
        source: &SourceImage,
        ctx: &RunContext<'_>,
        manifest: &Mutex<Manifest>,
        stats: &RunStats,
    ) -> Option<ProcessEvent> {
        if !ctx.seen.first_visit(&source.path) {
            tracing::debug!(source = %source.relative, "already handled in this run");
            return None;
        }
        let failed = |error: String| {
            tracing::warn!(source = %source.relative, %error, "skipping unreadable source");
            stats.error();
            Some(ProcessEvent::ImageFailed {
                index,
                source_path: source.relative.clone(),
                error,
            })
        };

        let hash = match cache::content_hash(&source.path) {
            Ok(h) => h,
            Err(e) => return failed(e.to_string()),
        };

        if !self.options.force
            && ctx.cache.has(&hash)
            && lock(manifest).artifacts_exist(self.output_dir, &source.relative)
        {
            stats.skipped();
            return Some(ProcessEvent::ImageCached {
                index,
                source_path: source.relative.clone(),
            });
        }

        let dims = match self.backend.identify(&source.path) {
            Ok(d) => (d.width, d.height),
            Err(e) => return failed(e.to_string()),
        };

        let mut tally = ImageTally::default();
        let mut sample = None;
        let mut reports = Vec::new();
        for spec in self.registry.placements_for(&source.relative) {
            let status = self.process_placement(source, spec, dims, manifest, &mut tally);
            if spec.placeholder != PlaceholderStrategy::None
                && matches!(status, PlacementStatus::Produced(_) | PlacementStatus::Fresh)
            {
                let sample = sample.get_or_insert_with(|| {
                    self.backend
                        .sample(&source.path, PLACEHOLDER_SAMPLE_EDGE)
                        .inspect_err(|e| {
                            tracing::debug!(source = %source.relative, error = %e, "no placeholder sample")
                        })
                        .ok()
                });
                let data = match sample {
                    Some(s) => placeholder::placeholder_for(spec.placeholder, s),
                    None => PlaceholderData::default(),
                };
                lock(manifest).set_placeholder(&source.relative, &spec.id, &data);
            }
            reports.push(PlacementReport {
                placement: spec.id.clone(),
                status,
            });
        }

        for _ in 0..tally.failures {
            stats.error();
        }
        if tally.encoded > 0 {
            stats.processed();
            if let (Some(smallest), Ok(meta)) = (tally.smallest, std::fs::metadata(&source.path)) {
                stats.saved(meta.len().saturating_sub(smallest));
            }
        } else if tally.failures == 0 {
            stats.skipped();
        }
        if tally.failures == 0 {
            ctx.cache.record(
                hash,
                OutputStats {
                    artifacts: tally.encoded,
                    bytes: tally.bytes,
                },
            );
        }

        Some(ProcessEvent::ImageProcessed {
            index,
            source_path: source.relative.clone(),
            placements: reports,
        })
    }

    fn process_placement(
        &self,
        source: &SourceImage,
        spec: &PlacementSpec,
        dims: (u32, u32),
        manifest: &Mutex<Manifest>,
        tally: &mut ImageTally,
    ) -> PlacementStatus {
        let sizes = plan_sizes(dims, &spec.dimensions, self.options.resize);
        let formats = target_formats(spec, &self.options);
        let stem = source.stem();
        let rel_dir = source.relative_dir();
        let out_dir = self.output_dir.join(rel_dir);
        let relative_output = |name: String| {
            if rel_dir.is_empty() {
                name
            } else {
                format!("{rel_dir}/{name}")
            }
        };

        let Some(last) = sizes.last() else {
            lock(manifest).retain(&source.relative, &spec.id, &[]);
            return PlacementStatus::TooSmall;
        };

        if !self.options.force && artifacts_fresh(&source.path, &out_dir, &stem, &spec.id, &sizes, &formats) {
            self.adopt_existing(source, spec, &sizes, &formats, &out_dir, manifest, &relative_output);
            return PlacementStatus::Fresh;
        }

        let disabled = CompressionChain::disabled();
        let chain = if spec.compression.uses_external() {
            self.chain
        } else {
            &disabled
        };
        let mut viewports = Vec::new();
        let mut kept = Vec::new();
        for size in &sizes {
            let job = ViewportJob {
                source: &source.path,
                output_dir: &out_dir,
                stem: &stem,
                placement: &spec.id,
                size: *size,
                formats: &formats,
                quality: Quality::new(spec.quality),
            };
            let outcome = match produce_viewport(self.backend, chain, &job) {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(
                        source = %source.relative,
                        placement = %spec.id,
                        viewport = %size.viewport,
                        error = %e,
                        "resize failed"
                    );
                    tally.failures += formats.len() as u32;
                    viewports.push(ViewportReport {
                        viewport: size.viewport,
                        width: size.width,
                        height: size.height,
                        compressed: false,
                        variants: formats
                            .iter()
                            .map(|&format| VariantInfo {
                                format,
                                status: VariantStatus::Failed(e.to_string()),
                            })
                            .collect(),
                    });
                    continue;
                }
            };

            let mut variants = Vec::new();
            let mut produced = Vec::new();
            {
                let mut manifest = lock(manifest);
                for artifact in &outcome.artifacts {
                    let file_name = artifact
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    manifest.write(ManifestEntry {
                        source_path: source.relative.clone(),
                        placement_id: spec.id.clone(),
                        viewport: size.viewport,
                        format: artifact.format,
                        output_path: relative_output(file_name),
                        width: size.width,
                        height: size.height,
                        byte_size: artifact.size,
                        quality: spec.quality,
                        encoder_quality: self.encoder_quality(artifact.format, spec),
                    });
                    tally.encoded += 1;
                    tally.bytes += artifact.size;
                    if size.viewport == last.viewport {
                        tally.smallest = Some(tally.smallest.map_or(artifact.size, |s| s.min(artifact.size)));
                    }
                    produced.push(artifact.format);
                }
            }
            tally.failures += outcome.failures.len() as u32;
            for &format in &formats {
                let status = match outcome.artifacts.iter().find(|a| a.format == format) {
                    Some(a) => VariantStatus::Encoded { bytes: a.size },
                    None => VariantStatus::Failed(
                        outcome
                            .failures
                            .iter()
                            .find(|f| f.format == format)
                            .map(|f| f.error.to_string())
                            .unwrap_or_default(),
                    ),
                };
                variants.push(VariantInfo { format, status });
            }
            if !produced.is_empty() {
                kept.push((size.viewport, produced));
            }
            viewports.push(ViewportReport {
                viewport: size.viewport,
                width: size.width,
                height: size.height,
                compressed: outcome.compressed,
                variants,
            });
        }

        lock(manifest).retain(&source.relative, &spec.id, &kept);
        PlacementStatus::Produced(viewports)
    }

    /// Quality the encoder applied to `format`, `None` when it encodes that
    /// format losslessly.
    fn encoder_quality(&self, format: Format, spec: &PlacementSpec) -> Option<u32> {
        (!self.backend.encodes_lossless(format)).then_some(spec.quality)
    }

    /// Record already-present artifacts of a fresh placement so the manifest
    /// stays complete even when it was lost between runs.
    #[allow(clippy::too_many_arguments)]
    fn adopt_existing(
        &self,
        source: &SourceImage,
        spec: &PlacementSpec,
        sizes: &[PlannedSize],
        formats: &[Format],
        out_dir: &Path,
        manifest: &Mutex<Manifest>,
        relative_output: &dyn Fn(String) -> String,
    ) {
        let mut manifest = lock(manifest);
        for size in sizes {
            for &format in formats {
                let name = artifact_file_name(&source.stem(), &spec.id, size.viewport, format);
                let Ok(meta) = std::fs::metadata(out_dir.join(&name)) else {
                    continue;
                };
                manifest.write(ManifestEntry {
                    source_path: source.relative.clone(),
                    placement_id: spec.id.clone(),
                    viewport: size.viewport,
                    format,
                    output_path: relative_output(name),
                    width: size.width,
                    height: size.height,
                    byte_size: meta.len(),
                    quality: spec.quality,
                    encoder_quality: self.encoder_quality(format, spec),
                });
            }
        }
    }
}

/// Every (viewport, format) artifact exists and is not older than `source`.
fn artifacts_fresh(
    source: &Path,
    out_dir: &Path,
    stem: &str,
    placement: &str,
    sizes: &[PlannedSize],
    formats: &[Format],
) -> bool {
    let Some(src) = modified(source) else {
        return false;
    };
    sizes.iter().all(|size| {
        formats.iter().all(|&format| {
            modified(&out_dir.join(artifact_file_name(stem, placement, size.viewport, format)))
                .is_some_and(|artifact| artifact >= src)
        })
    })
}

fn lock(manifest: &Mutex<Manifest>) -> std::sync::MutexGuard<'_, Manifest> {
    manifest.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Whole build
// ============================================================================

/// Everything a build run needs besides the backend.
pub struct BuildRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub registry: &'a LocationRegistry,
    pub chain: &'a CompressionChain,
    pub options: TranscodeOptions,
    pub clear_cache: bool,
}

#[derive(Debug)]
pub struct BuildReport {
    pub sources: usize,
    pub stats: StatsSnapshot,
    pub manifest_written: bool,
    pub artifacts: usize,
}

/// Load persisted state, run the pipeline, persist the results.
///
/// Only failures to read the input directory or write the manifest/cache
/// files are errors; per-image problems end up in the stats.
pub fn build(
    backend: &impl ImageBackend,
    request: &BuildRequest<'_>,
    progress: Option<Sender<ProcessEvent>>,
) -> Result<BuildReport, TranscodeError> {
    std::fs::create_dir_all(request.output)?;
    if request.clear_cache && cache::clear(request.output)? {
        tracing::info!("cleared optimization cache");
    }
    let opt_cache = OptimizationCache::load(request.output);
    let manifest = Manifest::load(request.output);
    let scan = scan_sources(request.input, Some(request.output))?;
    tracing::debug!(count = scan.sources.len(), cached = opt_cache.len(), "starting build");

    let seen = SeenPaths::new();
    let transcoder = Transcoder {
        backend,
        registry: request.registry,
        chain: request.chain,
        output_dir: request.output,
        options: request.options,
    };
    let ctx = RunContext {
        cache: &opt_cache,
        seen: &seen,
        progress,
    };
    let TranscodeResult {
        mut manifest,
        mut stats,
    } = transcoder.run(&scan.sources, &ctx, manifest);
    drop(ctx);

    stats.errors += scan.errors as u64;
    if scan.errors == 0 {
        prune_removed_sources(&mut manifest, &scan.sources);
    }

    let manifest_written = manifest.save(request.output)?;
    opt_cache.save(request.output, stats)?;
    Ok(BuildReport {
        sources: scan.sources.len(),
        stats,
        manifest_written,
        artifacts: manifest.artifact_count(),
    })
}

/// Drop manifest entries of sources that no longer exist. Their artifact
/// files are left in place.
fn prune_removed_sources(manifest: &mut Manifest, sources: &[SourceImage]) {
    let present: HashSet<&str> = sources.iter().map(|s| s.relative.as_str()).collect();
    let removed: Vec<String> = manifest
        .sources()
        .filter(|source| !present.contains(source))
        .map(str::to_string)
        .collect();
    for source in removed {
        tracing::info!(%source, "source removed, dropping its manifest entries");
        manifest.remove_source(&source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::imaging::backend::tests::{MockBackend, RecordedOp};
    use crate::registry::{PlacementConfig, stock_placements};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn hero_registry() -> LocationRegistry {
        let mut placements = BTreeMap::new();
        let hero: PlacementConfig = stock_placements()["hero-main"].clone();
        placements.insert("hero-main".to_string(), hero);
        LocationRegistry::new(&placements, vec![], vec!["hero-main".to_string()], 80).unwrap()
    }

    fn write_source(root: &Path, relative: &str) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("source bytes of {relative}")).unwrap();
        path
    }

    struct Fixture {
        tmp: TempDir,
        registry: LocationRegistry,
        chain: CompressionChain,
    }

    impl Fixture {
        fn new(registry: LocationRegistry) -> Self {
            Self {
                tmp: TempDir::new().unwrap(),
                registry,
                chain: CompressionChain::disabled(),
            }
        }

        fn input(&self) -> PathBuf {
            self.tmp.path().join("assets")
        }

        fn output(&self) -> PathBuf {
            self.tmp.path().join("optimized")
        }

        fn build(&self, backend: &MockBackend, options: TranscodeOptions) -> BuildReport {
            let input = self.input();
            let output = self.output();
            build(
                backend,
                &BuildRequest {
                    input: &input,
                    output: &output,
                    registry: &self.registry,
                    chain: &self.chain,
                    options,
                    clear_cache: false,
                },
                None,
            )
            .unwrap()
        }
    }

    #[test]
    fn scan_finds_supported_images_with_relative_paths() {
        let tmp = TempDir::new().unwrap();
        write_source(tmp.path(), "hero/hero.png");
        write_source(tmp.path(), "a.jpg");
        write_source(tmp.path(), "notes.txt");
        write_source(tmp.path(), ".hidden/x.png");
        write_source(tmp.path(), "out/skip.png");

        let scan = scan_sources(tmp.path(), Some(&tmp.path().join("out"))).unwrap();
        assert_eq!(scan.errors, 0);
        let sources = scan.sources;
        let rel: Vec<&str> = sources.iter().map(|s| s.relative.as_str()).collect();
        assert_eq!(rel, vec!["a.jpg", "hero/hero.png"]);
        assert_eq!(sources[1].relative_dir(), "hero");
        assert_eq!(sources[1].stem(), "hero");
        assert_eq!(sources[0].relative_dir(), "");
    }

    #[test]
    fn target_formats_respects_webp_switch() {
        let registry = hero_registry();
        let spec = registry.get("hero-main").unwrap();
        assert_eq!(
            target_formats(spec, &TranscodeOptions::default()),
            vec![Format::Avif, Format::Webp, Format::Jpeg]
        );
        let no_webp = TranscodeOptions {
            webp: false,
            ..TranscodeOptions::default()
        };
        assert_eq!(target_formats(spec, &no_webp), vec![Format::Avif, Format::Jpeg]);
    }

    #[test]
    fn target_formats_never_empty() {
        let mut spec = hero_registry().get("hero-main").unwrap().clone();
        spec.preferred_formats = vec![Format::Webp];
        let no_webp = TranscodeOptions {
            webp: false,
            ..TranscodeOptions::default()
        };
        assert_eq!(target_formats(&spec, &no_webp), vec![Format::UNIVERSAL]);
    }

    #[test]
    fn hero_end_to_end_with_mock() {
        let fx = Fixture::new(hero_registry());
        let source = write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);

        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.stats.errors, 0);
        assert_eq!(report.artifacts, 9);
        assert!(report.manifest_written);

        let manifest = Manifest::load(&fx.output());
        let desktop = manifest
            .resolve("hero/hero.png", "hero-main", Viewport::Desktop)
            .unwrap();
        assert_eq!((desktop.width, desktop.height), (1920, 1080));
        assert_eq!(desktop.quality, 85);
        for format in [Format::Avif, Format::Webp, Format::Jpeg] {
            let artifact = desktop.format(format).unwrap();
            assert_eq!(
                artifact.path,
                format!("hero/hero-hero-main-desktop.{}", format.extension())
            );
            assert!(fx.output().join(&artifact.path).is_file());
        }
        assert!(desktop.placeholder.is_some());
        assert!(desktop.dominant_color.is_some());

        let cache = OptimizationCache::load(&fx.output());
        assert!(cache.has(&cache::content_hash(&source).unwrap()));
    }

    #[test]
    fn second_run_is_idempotent() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        write_source(&fx.input(), "tiny.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350), ("tiny.png", 100, 100)]);

        let first = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(first.stats.processed, 1);
        assert_eq!(first.stats.skipped, 1);
        let manifest_mtime = modified(&fx.output().join(crate::manifest::MANIFEST_FILENAME)).unwrap();
        let encodes = backend.encode_count();

        let second = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(second.stats.processed, 0);
        assert_eq!(second.stats.skipped, 2);
        assert!(!second.manifest_written);
        assert_eq!(backend.encode_count(), encodes);
        assert_eq!(
            modified(&fx.output().join(crate::manifest::MANIFEST_FILENAME)).unwrap(),
            manifest_mtime
        );
    }

    #[test]
    fn mtime_only_change_triggers_reprocessing() {
        let fx = Fixture::new(hero_registry());
        let source = write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);
        fx.build(&backend, TranscodeOptions::default());
        let old_hash = cache::content_hash(&source).unwrap();
        let encodes = backend.encode_count();

        let later = SystemTime::now() + Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(later)
            .unwrap();
        let new_hash = cache::content_hash(&source).unwrap();
        assert_ne!(old_hash, new_hash);

        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.stats.processed, 1);
        assert_eq!(backend.encode_count(), encodes * 2);
        assert!(OptimizationCache::load(&fx.output()).has(&new_hash));
    }

    #[test]
    fn force_bypasses_both_skips() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);
        fx.build(&backend, TranscodeOptions::default());
        let encodes = backend.encode_count();

        let forced = TranscodeOptions {
            force: true,
            ..TranscodeOptions::default()
        };
        let report = fx.build(&backend, forced);
        assert_eq!(report.stats.processed, 1);
        assert_eq!(backend.encode_count(), encodes * 2);
    }

    #[test]
    fn filesystem_skip_restores_lost_manifest() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);
        fx.build(&backend, TranscodeOptions::default());
        let encodes = backend.encode_count();

        std::fs::remove_file(fx.output().join(crate::manifest::MANIFEST_FILENAME)).unwrap();
        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.stats.processed, 0);
        assert_eq!(report.stats.skipped, 1);
        assert_eq!(backend.encode_count(), encodes);
        assert_eq!(report.artifacts, 9);
    }

    #[test]
    fn never_upscales() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 1000, 500)]);

        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.artifacts, 3);
        let manifest = Manifest::load(&fx.output());
        assert!(manifest.resolve("hero/hero.png", "hero-main", Viewport::Mobile).is_some());
        assert!(manifest.resolve("hero/hero.png", "hero-main", Viewport::Tablet).is_none());
        assert!(manifest.resolve("hero/hero.png", "hero-main", Viewport::Desktop).is_none());
        assert!(
            backend
                .get_operations()
                .iter()
                .all(|op| !matches!(op, RecordedOp::Resize { width, .. } if *width > 1000))
        );
    }

    #[test]
    fn failed_format_is_isolated_and_hash_not_recorded() {
        let fx = Fixture::new(hero_registry());
        let source = write_source(&fx.input(), "hero/hero.png");
        write_source(&fx.input(), "other.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350), ("other.png", 2400, 1350)]);
        backend.fail_format(Format::Avif);

        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.stats.errors, 6);
        assert_eq!(report.stats.processed, 2);
        assert_eq!(report.artifacts, 12);
        assert!(!OptimizationCache::load(&fx.output()).has(&cache::content_hash(&source).unwrap()));
    }

    #[test]
    fn failed_format_is_retried_next_run() {
        let fx = Fixture::new(hero_registry());
        let source = write_source(&fx.input(), "hero/hero.png");
        let failing = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);
        failing.fail_format(Format::Avif);
        let first = fx.build(&failing, TranscodeOptions::default());
        assert_eq!(first.stats.errors, 3);

        // JPEG and WebP are newer than the source, AVIF is missing.
        let healthy = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);
        let second = fx.build(&healthy, TranscodeOptions::default());
        assert_eq!(second.stats.processed, 1);
        assert_eq!(second.stats.errors, 0);
        assert!(healthy.encode_count() > 0);
        assert!(fx.output().join("hero/hero-hero-main-desktop.avif").is_file());

        let manifest = Manifest::load(&fx.output());
        let desktop = manifest
            .resolve("hero/hero.png", "hero-main", Viewport::Desktop)
            .unwrap();
        assert!(desktop.format(Format::Avif).is_some());
        assert!(OptimizationCache::load(&fx.output()).has(&cache::content_hash(&source).unwrap()));
    }

    #[test]
    fn deleted_source_is_dropped_from_manifest() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        let alt = write_source(&fx.input(), "hero/alt.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350), ("alt.png", 2400, 1350)]);
        fx.build(&backend, TranscodeOptions::default());
        assert!(Manifest::load(&fx.output()).contains_source("hero/alt.png"));

        std::fs::remove_file(alt).unwrap();
        let report = fx.build(&backend, TranscodeOptions::default());
        assert!(report.manifest_written);
        assert_eq!(report.artifacts, 9);
        let manifest = Manifest::load(&fx.output());
        assert!(!manifest.contains_source("hero/alt.png"));
        assert!(manifest.contains_source("hero/hero.png"));
    }

    #[test]
    fn lossless_formats_record_no_encoder_quality() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);
        backend.encode_lossless(Format::Webp);

        fx.build(&backend, TranscodeOptions::default());
        let manifest = Manifest::load(&fx.output());
        let desktop = manifest
            .resolve("hero/hero.png", "hero-main", Viewport::Desktop)
            .unwrap();
        assert_eq!(desktop.format(Format::Avif).unwrap().quality, Some(85));
        assert_eq!(desktop.format(Format::Jpeg).unwrap().quality, Some(85));
        assert_eq!(desktop.format(Format::Webp).unwrap().quality, None);
    }

    #[cfg(unix)]
    #[test]
    fn broken_entry_is_counted_and_build_continues() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        std::os::unix::fs::symlink(fx.input().join("gone.png"), fx.input().join("dangling.png")).unwrap();
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);

        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.sources, 1);
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.processed, 1);
    }

    #[cfg(unix)]
    #[test]
    fn scan_errors_keep_manifest_entries() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        let alt = write_source(&fx.input(), "hero/alt.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350), ("alt.png", 2400, 1350)]);
        fx.build(&backend, TranscodeOptions::default());

        std::fs::remove_file(alt).unwrap();
        std::os::unix::fs::symlink(fx.input().join("gone.png"), fx.input().join("dangling.png")).unwrap();
        fx.build(&backend, TranscodeOptions::default());
        assert!(Manifest::load(&fx.output()).contains_source("hero/alt.png"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_source_is_processed_once() {
        let fx = Fixture::new(hero_registry());
        let source = write_source(&fx.input(), "hero/hero.png");
        std::fs::create_dir_all(fx.input().join("mirror")).unwrap();
        std::os::unix::fs::symlink(&source, fx.input().join("mirror/hero.png")).unwrap();
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);

        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.sources, 2);
        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.stats.errors, 0);
        assert_eq!(backend.encode_count(), 9);
        assert_eq!(report.artifacts, 9);
    }

    #[test]
    fn unreadable_source_is_fatal_to_that_image_only() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "broken.png");
        write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);

        let report = fx.build(&backend, TranscodeOptions::default());
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.sources, 2);
    }

    #[test]
    fn no_sizes_produces_native_desktop_only() {
        let fx = Fixture::new(hero_registry());
        write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);

        let options = TranscodeOptions {
            resize: false,
            webp: false,
            ..TranscodeOptions::default()
        };
        let report = fx.build(&backend, options);
        assert_eq!(report.artifacts, 2);
        let manifest = Manifest::load(&fx.output());
        let desktop = manifest
            .resolve("hero/hero.png", "hero-main", Viewport::Desktop)
            .unwrap();
        assert_eq!((desktop.width, desktop.height), (2400, 1350));
        assert!(desktop.format(Format::Webp).is_none());
    }

    #[test]
    fn stock_rules_fan_out_to_several_placements() {
        let registry = OptimizerConfig::default().registry().unwrap();
        let fx = Fixture::new(registry);
        write_source(&fx.input(), "hero/hero.png");
        let backend = MockBackend::with_dimensions(&[("hero.png", 2400, 1350)]);

        let report = fx.build(&backend, TranscodeOptions::default());
        // hero-main: 3 viewports x 3 formats, og-image: 2 viewports x jpg
        assert_eq!(report.artifacts, 11);
        let manifest = Manifest::load(&fx.output());
        let og = manifest
            .resolve("hero/hero.png", "og-image", Viewport::Desktop)
            .unwrap();
        assert_eq!((og.width, og.height), (1200, 675));
        assert!(og.placeholder.is_none());
    }

    #[test]
    fn lossless_placement_skips_external_compression() {
        let mut placements = BTreeMap::new();
        let avatar = stock_placements()["team-avatar"].clone();
        placements.insert("team-avatar".to_string(), avatar);
        let registry =
            LocationRegistry::new(&placements, vec![], vec!["team-avatar".to_string()], 80).unwrap();
        let mut fx = Fixture::new(registry);
        fx.chain = CompressionChain::with(crate::compress::tests::FakeCompressor::ok());
        write_source(&fx.input(), "team/ada.png");
        let backend = MockBackend::with_dimensions(&[("ada.png", 400, 400)]);

        fx.build(&backend, TranscodeOptions::default());
        assert!(backend.get_operations().iter().all(|op| match op {
            RecordedOp::Encode { source, .. } => source.starts_with(".raster-"),
            _ => true,
        }));
    }
}
