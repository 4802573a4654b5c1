//! Build output manifest: the contract between build time and delivery.
//!
//! Stored as `<output>/image-manifest.json`, nested by source path, placement
//! id and viewport:
//!
//! ```json
//! {
//!   "hero/hero.png": {
//!     "hero-main": {
//!       "desktop": {
//!         "path": "hero/hero-hero-main-desktop.jpg",
//!         "width": 1920, "height": 1080, "size": 182311, "quality": 85,
//!         "formats": {
//!           "avif": { "path": "hero/hero-hero-main-desktop.avif", "size": 61200, "quality": 85 },
//!           "webp": { "path": "hero/hero-hero-main-desktop.webp", "size": 90122 },
//!           "jpg":  { "path": "hero/hero-hero-main-desktop.jpg",  "size": 182311, "quality": 85 }
//!         },
//!         "placeholder": "LEHV6nWB2yk8pyo0adR*.7kCMdnj",
//!         "dominantColor": "#7a8c99"
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! The top-level `path`/`size` of a viewport entry name the universal (JPEG)
//! artifact when one was produced, otherwise the first format written.
//! Paths are relative to the output directory and always use `/`.
//!
//! The viewport `quality` is the placement's setting. A format's own
//! `quality` is what its encoder actually used and is absent for lossless
//! encodes (WebP and PNG with the `image`-crate backend).
//!
//! [`Manifest::write`] is idempotent per (source, placement, viewport,
//! format) and [`Manifest::save`] only touches the file when the serialized
//! contents differ, so an unchanged build leaves the file alone.

use crate::cache::write_atomic;
use crate::types::{Format, Viewport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_FILENAME: &str = "image-manifest.json";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatArtifact {
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportEntry {
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub quality: u32,
    /// Keyed by file extension (`avif`, `webp`, `jpg`, `png`).
    pub formats: BTreeMap<String, FormatArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_color: Option<String>,
}

impl ViewportEntry {
    pub fn format(&self, format: Format) -> Option<&FormatArtifact> {
        self.formats.get(format.extension())
    }
}

/// One produced artifact, as reported by the transcoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub source_path: String,
    pub placement_id: String,
    pub viewport: Viewport,
    pub format: Format,
    pub output_path: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    /// Placement quality.
    pub quality: u32,
    /// Quality passed to the encoder; `None` for a lossless encode.
    pub encoder_quality: Option<u32>,
}

/// Placeholder data attached to every viewport of a placement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderData {
    pub blurhash: Option<String>,
    pub dominant_color: Option<String>,
}

type Placements = BTreeMap<String, BTreeMap<String, ViewportEntry>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    sources: BTreeMap<String, Placements>,
}

pub fn manifest_path(output_dir: &Path) -> PathBuf {
    output_dir.join(MANIFEST_FILENAME)
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load the manifest from `output_dir`.
    ///
    /// A missing file is an empty manifest. An unreadable or corrupt file is
    /// logged and treated as empty; the build regenerates it.
    pub fn load(output_dir: &Path) -> Self {
        let path = manifest_path(output_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read manifest");
                return Self::new();
            }
        };
        match Self::from_json(&content) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt manifest, starting fresh");
                Self::new()
            }
        }
    }

    /// Write the manifest atomically if its contents changed.
    ///
    /// Returns whether the file was written.
    pub fn save(&self, output_dir: &Path) -> Result<bool, ManifestError> {
        let path = manifest_path(output_dir);
        let json = serde_json::to_string_pretty(self)?;
        match std::fs::read_to_string(&path) {
            Ok(existing) if existing == json => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(output_dir)?;
        write_atomic(&path, json.as_bytes())?;
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn contains_source(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Number of artifact files the manifest references.
    pub fn artifact_count(&self) -> usize {
        self.viewport_entries().map(|(_, _, _, e)| e.formats.len()).sum()
    }

    fn viewport_entries(&self) -> impl Iterator<Item = (&str, &str, &str, &ViewportEntry)> {
        self.sources.iter().flat_map(|(source, placements)| {
            placements.iter().flat_map(move |(placement, viewports)| {
                viewports.iter().map(move |(viewport, entry)| {
                    (source.as_str(), placement.as_str(), viewport.as_str(), entry)
                })
            })
        })
    }

    /// Record one artifact, replacing any prior record for the same key.
    ///
    /// Returns whether anything changed.
    pub fn write(&mut self, entry: ManifestEntry) -> bool {
        let artifact = FormatArtifact {
            path: entry.output_path,
            size: entry.byte_size,
            quality: entry.encoder_quality,
        };
        let viewports = self
            .sources
            .entry(entry.source_path)
            .or_default()
            .entry(entry.placement_id)
            .or_default();

        let Some(existing) = viewports.get_mut(entry.viewport.as_str()) else {
            let mut formats = BTreeMap::new();
            formats.insert(entry.format.extension().to_string(), artifact.clone());
            viewports.insert(
                entry.viewport.as_str().to_string(),
                ViewportEntry {
                    path: artifact.path,
                    width: entry.width,
                    height: entry.height,
                    size: artifact.size,
                    quality: entry.quality,
                    formats,
                    placeholder: None,
                    dominant_color: None,
                },
            );
            return true;
        };

        let before = existing.clone();
        let key = entry.format.extension().to_string();
        let was_primary = existing
            .formats
            .get(&key)
            .is_some_and(|old| old.path == existing.path);
        existing.width = entry.width;
        existing.height = entry.height;
        existing.quality = entry.quality;
        if was_primary || entry.format == Format::UNIVERSAL || existing.formats.is_empty() {
            existing.path = artifact.path.clone();
            existing.size = artifact.size;
        }
        existing.formats.insert(key, artifact);
        *existing != before
    }

    /// Attach placeholder data to every viewport of a placement.
    pub fn set_placeholder(&mut self, source: &str, placement: &str, data: &PlaceholderData) -> bool {
        let Some(viewports) = self
            .sources
            .get_mut(source)
            .and_then(|p| p.get_mut(placement))
        else {
            return false;
        };
        let mut changed = false;
        for entry in viewports.values_mut() {
            if entry.placeholder != data.blurhash || entry.dominant_color != data.dominant_color {
                entry.placeholder = data.blurhash.clone();
                entry.dominant_color = data.dominant_color.clone();
                changed = true;
            }
        }
        changed
    }

    /// Drop viewports and formats of a placement that the latest build did
    /// not produce. Returns whether anything was removed.
    pub fn retain(
        &mut self,
        source: &str,
        placement: &str,
        keep: &[(Viewport, Vec<Format>)],
    ) -> bool {
        let Some(placements) = self.sources.get_mut(source) else {
            return false;
        };
        let Some(viewports) = placements.get_mut(placement) else {
            return false;
        };
        let before = viewports.clone();
        viewports.retain(|viewport, entry| {
            let Some((_, formats)) = keep.iter().find(|(v, _)| v.as_str() == viewport.as_str()) else {
                return false;
            };
            entry
                .formats
                .retain(|ext, _| formats.iter().any(|f| f.extension() == ext.as_str()));
            if !entry.formats.values().any(|a| a.path == entry.path)
                && let Some(first) = formats
                    .iter()
                    .find_map(|f| entry.formats.get(f.extension()))
            {
                entry.path = first.path.clone();
                entry.size = first.size;
            }
            !entry.formats.is_empty()
        });
        let changed = *viewports != before;
        if viewports.is_empty() {
            placements.remove(placement);
        }
        if placements.is_empty() {
            self.sources.remove(source);
        }
        changed
    }

    pub fn remove_source(&mut self, source: &str) -> bool {
        self.sources.remove(source).is_some()
    }

    /// Whether the manifest knows `source` and every artifact it lists for
    /// it exists under `output_dir`.
    pub fn artifacts_exist(&self, output_dir: &Path, source: &str) -> bool {
        let Some(placements) = self.sources.get(source) else {
            return false;
        };
        placements
            .values()
            .flat_map(|viewports| viewports.values())
            .flat_map(|entry| entry.formats.values())
            .all(|artifact| output_dir.join(&artifact.path).is_file())
    }

    pub fn resolve(&self, source: &str, placement: &str, viewport: Viewport) -> Option<&ViewportEntry> {
        self.sources
            .get(source)?
            .get(placement)?
            .get(viewport.as_str())
    }

    /// Path of the best artifact for the request.
    ///
    /// With `format` given, that format's artifact; otherwise the entry's
    /// primary artifact. Any miss resolves to the original `source` path.
    pub fn resolve_path(
        &self,
        source: &str,
        placement: &str,
        viewport: Viewport,
        format: Option<Format>,
    ) -> ResolvedPath {
        let found = self.resolve(source, placement, viewport).and_then(|entry| match format {
            Some(f) => entry.format(f).map(|a| a.path.clone()),
            None => Some(entry.path.clone()),
        });
        match found {
            Some(path) => ResolvedPath::Artifact(path),
            None => {
                tracing::debug!(source, placement, %viewport, ?format, "manifest miss, using original asset");
                ResolvedPath::Original(source.to_string())
            }
        }
    }
}

/// Outcome of [`Manifest::resolve_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    /// Relative to the output directory.
    Artifact(String),
    /// The source path, relative to the input directory.
    Original(String),
}

impl ResolvedPath {
    pub fn as_str(&self) -> &str {
        match self {
            ResolvedPath::Artifact(path) | ResolvedPath::Original(path) => path,
        }
    }

    pub fn artifact(self) -> Option<String> {
        match self {
            ResolvedPath::Artifact(path) => Some(path),
            ResolvedPath::Original(_) => None,
        }
    }
}
