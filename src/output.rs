//! CLI output formatting.
//!
//! # Information-First Display
//!
//! Every source image leads with its positional index and relative path;
//! per-placement and per-viewport results follow as indented context lines.
//! Byte counts are human readable.
//!
//! # Output Format
//!
//! ## Build
//!
//! ```text
//! 001 hero/hero.png
//!     hero-main
//!         mobile 768x432: avif 21.4 KB, webp 38.0 KB, jpg 45.2 KB
//!         desktop 1920x1080 (compressed): avif failed, webp 190.2 KB, jpg 201.7 KB
//!     og-image: fresh
//! 002 team/ada.png: cached
//! 003 broken.png: failed (Processing failed: ...)
//!
//! 3 images: 1 processed, 1 skipped, 2 errors, 1.2 MB saved
//! Manifest: updated (11 artifacts)
//! ```
//!
//! ## Check
//!
//! ```text
//! Placements
//!     hero-main: mobile 768x432, tablet 1280x720, desktop 1920x1080 | q85 | avif, webp, jpg | eager
//!
//! Sources
//!     hero/hero.png → hero-main, og-image
//! ```
//!
//! # Architecture
//!
//! Each output has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format functions
//! are pure: no I/O, no side effects.

use crate::cache::{OptimizationCache, format_bytes};
use crate::registry::{LocationRegistry, PlacementSpec, PreloadStrategy};
use crate::transcode::{
    BuildReport, PlacementStatus, ProcessEvent, SourceImage, VariantStatus, ViewportReport,
};

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn viewport_line(report: &ViewportReport) -> String {
    let variants: Vec<String> = report
        .variants
        .iter()
        .map(|v| match &v.status {
            VariantStatus::Encoded { bytes } => format!("{} {}", v.format, format_bytes(*bytes)),
            VariantStatus::Failed(_) => format!("{} failed", v.format),
        })
        .collect();
    format!(
        "{}{} {}x{}{}: {}",
        indent(2),
        report.viewport,
        report.width,
        report.height,
        if report.compressed { " (compressed)" } else { "" },
        variants.join(", ")
    )
}

// ============================================================================
// Build output
// ============================================================================

/// Format a single build progress event as display lines.
pub fn format_process_event(event: &ProcessEvent) -> Vec<String> {
    match event {
        ProcessEvent::ImageCached { index, source_path } => {
            vec![format!("{} {}: cached", format_index(*index), source_path)]
        }
        ProcessEvent::ImageFailed {
            index,
            source_path,
            error,
        } => vec![format!(
            "{} {}: failed ({})",
            format_index(*index),
            source_path,
            error
        )],
        ProcessEvent::ImageProcessed {
            index,
            source_path,
            placements,
        } => {
            let mut lines = vec![format!("{} {}", format_index(*index), source_path)];
            for placement in placements {
                match &placement.status {
                    PlacementStatus::Fresh => {
                        lines.push(format!("{}{}: fresh", indent(1), placement.placement))
                    }
                    PlacementStatus::TooSmall => lines.push(format!(
                        "{}{}: source smaller than every viewport",
                        indent(1),
                        placement.placement
                    )),
                    PlacementStatus::Produced(viewports) => {
                        lines.push(format!("{}{}", indent(1), placement.placement));
                        lines.extend(viewports.iter().map(viewport_line));
                    }
                }
            }
            lines
        }
    }
}

/// Format the end-of-build summary.
pub fn format_summary(report: &BuildReport) -> Vec<String> {
    let images = if report.sources == 1 { "image" } else { "images" };
    vec![
        format!("{} {}: {}", report.sources, images, report.stats),
        if report.manifest_written {
            format!("Manifest: updated ({} artifacts)", report.artifacts)
        } else {
            format!("Manifest: unchanged ({} artifacts)", report.artifacts)
        },
    ]
}

pub fn print_summary(report: &BuildReport) {
    for line in format_summary(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Check output
// ============================================================================

fn placement_line(spec: &PlacementSpec) -> String {
    let sizes: Vec<String> = spec
        .dimensions
        .viewports()
        .iter()
        .map(|(viewport, t)| format!("{} {}x{}", viewport, t.width, t.height))
        .collect();
    let formats: Vec<String> = spec.preferred_formats.iter().map(|f| f.to_string()).collect();
    let preload = match spec.preload {
        PreloadStrategy::Eager => "eager",
        PreloadStrategy::Lazy => "lazy",
    };
    format!(
        "{}{}: {} | q{} | {} | {}",
        indent(1),
        spec.id,
        sizes.join(", "),
        spec.quality,
        formats.join(", "),
        preload
    )
}

/// Format the registry and the placements each source resolves to.
pub fn format_check_output(registry: &LocationRegistry, sources: &[SourceImage]) -> Vec<String> {
    let mut lines = vec!["Placements".to_string()];
    lines.extend(registry.placements().map(placement_line));
    lines.push(String::new());
    lines.push("Sources".to_string());
    if sources.is_empty() {
        lines.push(format!("{}(no images found)", indent(1)));
    }
    for source in sources {
        let ids: Vec<&str> = registry
            .placements_for(&source.relative)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        lines.push(format!(
            "{}{} \u{2192} {}",
            indent(1),
            source.relative,
            ids.join(", ")
        ));
    }
    lines
}

pub fn print_check_output(registry: &LocationRegistry, sources: &[SourceImage]) {
    for line in format_check_output(registry, sources) {
        println!("{}", line);
    }
}

// ============================================================================
// Stats output
// ============================================================================

/// Format the persisted cache state of the last run.
pub fn format_stats_output(cache: &OptimizationCache) -> Vec<String> {
    match cache.last_run() {
        None => vec!["No build recorded yet".to_string()],
        Some(when) => {
            let totals = cache.output_totals();
            vec![
                format!("Last run: {}", when.to_rfc3339()),
                format!("Cached images: {}", cache.len()),
                format!(
                    "Recorded output: {} artifacts, {}",
                    totals.artifacts,
                    format_bytes(totals.bytes)
                ),
                format!("Stats: {}", cache.last_stats()),
            ]
        }
    }
}

pub fn print_stats_output(cache: &OptimizationCache) {
    for line in format_stats_output(cache) {
        println!("{}", line);
    }
}
