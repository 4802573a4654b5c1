//! Location registry: named placements and how images are assigned to them.
//!
//! A *placement* is a usage context for an image ("hero-main",
//! "gallery-thumbnail", ...). Each one fixes target dimensions per viewport,
//! a quality default, the preferred delivery formats, and optionally an
//! adaptive-quality table keyed by connection type.
//!
//! The registry is plain data. It is built once from the merged config
//! (see [`crate::config`]) and never mutated afterwards; the build pipeline
//! reads it to know what to produce and the delivery layer reads it to know
//! how to choose among what was produced.
//!
//! ## Assignment
//!
//! Source images are matched against `[[assign]]` rules by their path relative
//! to the input directory. Patterns are `globset` globs compiled once when the
//! registry is built: `*` matches any run of characters including `/`, `?`
//! exactly one, and `{a,b}` / `[ab]` work as usual. Every matching rule
//! contributes its placements, in rule order, without duplicates. Images no
//! rule matches use `default_placements`.

use crate::types::{EffectiveType, Format, Viewport};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("unknown placement '{0}'")]
    UnknownPlacement(String),
    #[error("placement '{id}': {reason}")]
    InvalidPlacement { id: String, reason: String },
    #[error("assign pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Target box for one viewport. Only `width` drives resizing; `height` is the
/// nominal layout height used to reserve space before the image loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementDimensions {
    pub mobile: TargetSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tablet: Option<TargetSize>,
    pub desktop: TargetSize,
}

impl PlacementDimensions {
    /// Defined viewports in ascending order.
    pub fn viewports(&self) -> Vec<(Viewport, TargetSize)> {
        let mut out = vec![(Viewport::Mobile, self.mobile)];
        if let Some(tablet) = self.tablet {
            out.push((Viewport::Tablet, tablet));
        }
        out.push((Viewport::Desktop, self.desktop));
        out
    }

    pub fn get(&self, viewport: Viewport) -> Option<TargetSize> {
        match viewport {
            Viewport::Mobile => Some(self.mobile),
            Viewport::Tablet => self.tablet,
            Viewport::Desktop => Some(self.desktop),
        }
    }
}

/// Quality per effective connection type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveQuality {
    #[serde(rename = "slow2g", alias = "slow-2g")]
    pub slow_2g: u32,
    #[serde(rename = "2g")]
    pub two_g: u32,
    #[serde(rename = "3g")]
    pub three_g: u32,
    #[serde(rename = "4g")]
    pub four_g: u32,
}

impl AdaptiveQuality {
    pub fn for_type(&self, effective: EffectiveType) -> u32 {
        match effective {
            EffectiveType::Slow2g => self.slow_2g,
            EffectiveType::TwoG => self.two_g,
            EffectiveType::ThreeG => self.three_g,
            EffectiveType::FourG => self.four_g,
        }
    }

    /// Lowest defined tier, used in save-data mode.
    pub fn lowest(&self) -> u32 {
        self.slow_2g
            .min(self.two_g)
            .min(self.three_g)
            .min(self.four_g)
    }

    fn values(&self) -> [u32; 4] {
        [self.slow_2g, self.two_g, self.three_g, self.four_g]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaceholderStrategy {
    /// Decoded BlurHash raster.
    #[default]
    Blur,
    /// Flat fill with the dominant color.
    DominantColor,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreloadStrategy {
    /// High priority: fetched immediately, never deferred.
    Eager,
    #[default]
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    #[default]
    Photo,
    Illustration,
    Screenshot,
    Logo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionStrategy {
    /// External compression when available, then lossy encode.
    Aggressive,
    #[default]
    Balanced,
    /// Never sent to the external compressor.
    Lossless,
}

impl CompressionStrategy {
    pub fn uses_external(self) -> bool {
        !matches!(self, CompressionStrategy::Lossless)
    }
}

/// Placement as written in config. `quality` may be omitted and is then
/// resolved from `build.quality`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementConfig {
    pub dimensions: PlacementDimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    pub preferred_formats: Vec<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_quality: Option<AdaptiveQuality>,
    #[serde(default)]
    pub placeholder: PlaceholderStrategy,
    #[serde(default)]
    pub preload: PreloadStrategy,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub compression: CompressionStrategy,
}

/// Fully resolved placement.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementSpec {
    pub id: String,
    pub dimensions: PlacementDimensions,
    pub quality: u32,
    pub preferred_formats: Vec<Format>,
    pub adaptive_quality: Option<AdaptiveQuality>,
    pub placeholder: PlaceholderStrategy,
    pub preload: PreloadStrategy,
    pub content_type: ContentType,
    pub compression: CompressionStrategy,
}

impl PlacementSpec {
    pub fn is_high_priority(&self) -> bool {
        self.preload == PreloadStrategy::Eager
    }
}

/// Maps a path pattern to the placements it uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignRule {
    pub pattern: String,
    pub placements: Vec<String>,
}

/// Stock placements shipped with the tool.
pub fn stock_placements() -> BTreeMap<String, PlacementConfig> {
    use Format::*;
    let mut map = BTreeMap::new();
    map.insert(
        "hero-main".to_string(),
        PlacementConfig {
            dimensions: PlacementDimensions {
                mobile: TargetSize::new(768, 432),
                tablet: Some(TargetSize::new(1280, 720)),
                desktop: TargetSize::new(1920, 1080),
            },
            quality: Some(85),
            preferred_formats: vec![Avif, Webp, Jpeg],
            adaptive_quality: Some(AdaptiveQuality {
                slow_2g: 40,
                two_g: 50,
                three_g: 70,
                four_g: 85,
            }),
            placeholder: PlaceholderStrategy::Blur,
            preload: PreloadStrategy::Eager,
            content_type: ContentType::Photo,
            compression: CompressionStrategy::Aggressive,
        },
    );
    map.insert(
        "gallery-thumbnail".to_string(),
        PlacementConfig {
            dimensions: PlacementDimensions {
                mobile: TargetSize::new(320, 240),
                tablet: None,
                desktop: TargetSize::new(480, 360),
            },
            quality: Some(75),
            preferred_formats: vec![Avif, Webp, Jpeg],
            adaptive_quality: Some(AdaptiveQuality {
                slow_2g: 25,
                two_g: 35,
                three_g: 60,
                four_g: 75,
            }),
            placeholder: PlaceholderStrategy::Blur,
            preload: PreloadStrategy::Lazy,
            content_type: ContentType::Photo,
            compression: CompressionStrategy::Balanced,
        },
    );
    map.insert(
        "project-card".to_string(),
        PlacementConfig {
            dimensions: PlacementDimensions {
                mobile: TargetSize::new(400, 300),
                tablet: Some(TargetSize::new(600, 450)),
                desktop: TargetSize::new(800, 600),
            },
            quality: Some(80),
            preferred_formats: vec![Webp, Jpeg],
            adaptive_quality: None,
            placeholder: PlaceholderStrategy::DominantColor,
            preload: PreloadStrategy::Lazy,
            content_type: ContentType::Photo,
            compression: CompressionStrategy::Balanced,
        },
    );
    map.insert(
        "og-image".to_string(),
        PlacementConfig {
            dimensions: PlacementDimensions {
                mobile: TargetSize::new(1200, 630),
                tablet: None,
                desktop: TargetSize::new(1200, 630),
            },
            quality: Some(85),
            preferred_formats: vec![Jpeg],
            adaptive_quality: None,
            placeholder: PlaceholderStrategy::None,
            preload: PreloadStrategy::Lazy,
            content_type: ContentType::Photo,
            compression: CompressionStrategy::Balanced,
        },
    );
    map.insert(
        "team-avatar".to_string(),
        PlacementConfig {
            dimensions: PlacementDimensions {
                mobile: TargetSize::new(96, 96),
                tablet: None,
                desktop: TargetSize::new(192, 192),
            },
            quality: Some(80),
            preferred_formats: vec![Webp, Png],
            adaptive_quality: None,
            placeholder: PlaceholderStrategy::DominantColor,
            preload: PreloadStrategy::Lazy,
            content_type: ContentType::Photo,
            compression: CompressionStrategy::Lossless,
        },
    );
    map.insert(
        "content-inline".to_string(),
        PlacementConfig {
            dimensions: PlacementDimensions {
                mobile: TargetSize::new(640, 480),
                tablet: Some(TargetSize::new(960, 720)),
                desktop: TargetSize::new(1280, 960),
            },
            quality: None,
            preferred_formats: vec![Avif, Webp, Jpeg],
            adaptive_quality: None,
            placeholder: PlaceholderStrategy::Blur,
            preload: PreloadStrategy::Lazy,
            content_type: ContentType::Photo,
            compression: CompressionStrategy::Balanced,
        },
    );
    map
}

pub fn stock_assign_rules() -> Vec<AssignRule> {
    vec![
        AssignRule {
            pattern: "hero/*".to_string(),
            placements: vec!["hero-main".to_string(), "og-image".to_string()],
        },
        AssignRule {
            pattern: "gallery/*".to_string(),
            placements: vec!["gallery-thumbnail".to_string()],
        },
        AssignRule {
            pattern: "projects/*".to_string(),
            placements: vec!["project-card".to_string()],
        },
        AssignRule {
            pattern: "team/*".to_string(),
            placements: vec!["team-avatar".to_string()],
        },
    ]
}

/// An `[[assign]]` rule with its pattern compiled.
#[derive(Debug, Clone)]
struct CompiledRule {
    matcher: GlobMatcher,
    placements: Vec<String>,
}

impl CompiledRule {
    fn compile(rule: AssignRule) -> Result<Self, RegistryError> {
        let glob = Glob::new(&rule.pattern).map_err(|e| RegistryError::InvalidPattern {
            pattern: rule.pattern.clone(),
            reason: e.kind().to_string(),
        })?;
        Ok(Self {
            matcher: glob.compile_matcher(),
            placements: rule.placements,
        })
    }
}

/// Immutable placement lookup.
#[derive(Debug, Clone)]
pub struct LocationRegistry {
    placements: BTreeMap<String, PlacementSpec>,
    rules: Vec<CompiledRule>,
    default_placements: Vec<String>,
}

impl LocationRegistry {
    /// Resolve and validate placements. `default_quality` fills placements
    /// that don't set their own.
    pub fn new(
        placements: &BTreeMap<String, PlacementConfig>,
        rules: Vec<AssignRule>,
        default_placements: Vec<String>,
        default_quality: u32,
    ) -> Result<Self, RegistryError> {
        let mut resolved = BTreeMap::new();
        for (id, cfg) in placements {
            let spec = PlacementSpec {
                id: id.clone(),
                dimensions: cfg.dimensions,
                quality: cfg.quality.unwrap_or(default_quality),
                preferred_formats: cfg.preferred_formats.clone(),
                adaptive_quality: cfg.adaptive_quality,
                placeholder: cfg.placeholder,
                preload: cfg.preload,
                content_type: cfg.content_type,
                compression: cfg.compression,
            };
            validate_placement(&spec)?;
            resolved.insert(id.clone(), spec);
        }

        let registry = Self {
            placements: resolved,
            rules: rules
                .into_iter()
                .map(CompiledRule::compile)
                .collect::<Result<_, _>>()?,
            default_placements,
        };
        for id in registry
            .rules
            .iter()
            .flat_map(|r| r.placements.iter())
            .chain(registry.default_placements.iter())
        {
            if !registry.placements.contains_key(id) {
                return Err(RegistryError::UnknownPlacement(id.clone()));
            }
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&PlacementSpec> {
        self.placements.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&PlacementSpec, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::UnknownPlacement(id.to_string()))
    }

    pub fn placements(&self) -> impl Iterator<Item = &PlacementSpec> {
        self.placements.values()
    }

    /// Placements a source image (path relative to the input root, `/`
    /// separated) is produced for.
    pub fn placements_for(&self, relative_path: &str) -> Vec<&PlacementSpec> {
        let mut ids: Vec<&str> = Vec::new();
        for rule in &self.rules {
            if rule.matcher.is_match(relative_path) {
                for id in &rule.placements {
                    if !ids.contains(&id.as_str()) {
                        ids.push(id);
                    }
                }
            }
        }
        if ids.is_empty() {
            ids = self.default_placements.iter().map(String::as_str).collect();
        }
        ids.into_iter()
            .filter_map(|id| self.placements.get(id))
            .collect()
    }
}

fn validate_placement(spec: &PlacementSpec) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidPlacement {
        id: spec.id.clone(),
        reason: reason.to_string(),
    };
    if !(1..=100).contains(&spec.quality) {
        return Err(invalid("quality must be 1-100"));
    }
    if spec.preferred_formats.is_empty() {
        return Err(invalid("preferred_formats must not be empty"));
    }
    if spec
        .dimensions
        .viewports()
        .iter()
        .any(|(_, t)| t.width == 0 || t.height == 0)
    {
        return Err(invalid("dimensions must be non-zero"));
    }
    if let Some(adaptive) = spec.adaptive_quality
        && adaptive.values().iter().any(|q| !(1..=100).contains(q))
    {
        return Err(invalid("adaptive_quality values must be 1-100"));
    }
    Ok(())
}
