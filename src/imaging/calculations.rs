//! Pure calculation functions for artifact dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

use crate::registry::PlacementDimensions;
use crate::types::Viewport;

/// Output height for `width`, preserving the source aspect ratio:
/// `round(width / (source_w / source_h))`.
///
/// ```
/// # use optipix::imaging::target_height;
/// assert_eq!(target_height((1920, 1080), 768), 432);
/// ```
pub fn target_height(source: (u32, u32), width: u32) -> u32 {
    let (src_w, src_h) = source;
    let aspect = src_w as f64 / src_h as f64;
    ((width as f64 / aspect).round() as u32).max(1)
}

/// One concrete size to produce for a placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSize {
    pub viewport: Viewport,
    pub width: u32,
    pub height: u32,
}

/// Sizes to produce for a placement given the source dimensions.
///
/// Viewports whose target width exceeds the source width are dropped (never
/// upscale). With `resize` disabled only the desktop viewport is produced, at
/// the source's native size.
pub fn plan_sizes(
    source: (u32, u32),
    dimensions: &PlacementDimensions,
    resize: bool,
) -> Vec<PlannedSize> {
    if source.0 == 0 || source.1 == 0 {
        return Vec::new();
    }
    if !resize {
        return vec![PlannedSize {
            viewport: Viewport::Desktop,
            width: source.0,
            height: source.1,
        }];
    }
    dimensions
        .viewports()
        .into_iter()
        .filter(|(_, target)| target.width <= source.0)
        .map(|(viewport, target)| PlannedSize {
            viewport,
            width: target.width,
            height: target_height(source, target.width),
        })
        .collect()
}
