//! Content hashing and the optimization cache for idempotent builds.
//!
//! Encoding every placement of every image in three formats is the expensive
//! part of a build. This module lets the transcoder skip images whose content
//! hash was already processed in an earlier run.
//!
//! # Content hash
//!
//! [`content_hash`] is SHA-256 over the file bytes, the byte length and the
//! modification time (nanoseconds since the epoch). Touching a file without
//! changing its bytes therefore yields a new hash and the image is
//! re-optimized; the tool errs toward redoing work rather than serving stale
//! output.
//!
//! # Ledger
//!
//! [`OptimizationCache`] is an append-only set of processed hashes. It is
//! loaded once before the build, shared between the rayon workers behind a
//! lock, and written once at the end by atomic replace (temp file + rename)
//! so concurrent readers never observe a half-written file. Hashes are never
//! removed: an image that changes simply gets a new hash.
//!
//! The file lives at `<output_dir>/.optimization-cache.json`:
//!
//! ```json
//! {
//!   "processedHashes": ["9f2c…", "41ab…"],
//!   "entries": {
//!     "9f2c…": {
//!       "processedAt": "2026-10-19T08:12:40Z",
//!       "outputStats": { "artifacts": 9, "bytes": 1048576 }
//!     }
//!   },
//!   "lastRun": "2026-10-19T08:12:44Z",
//!   "stats": { "processed": 2, "skipped": 10, "errors": 0, "totalSaved": 5123456 }
//! }
//! ```
//!
//! `entries` is keyed by hash and says when each image was processed and what
//! it produced. Hashes recorded before entries existed simply have none.
//!
//! [`SeenPaths`] complements the ledger inside a single run: it prevents the
//! same canonical path from being processed twice when a directory listing
//! yields duplicates (symlinks, overlapping inputs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Name of the cache file within the output directory.
pub const CACHE_FILENAME: &str = ".optimization-cache.json";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable identity of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 over `bytes ‖ size ‖ mtime`, hex encoded.
pub fn content_hash(path: &Path) -> io::Result<ContentHash> {
    let bytes = std::fs::read(path)?;
    let meta = std::fs::metadata(path)?;
    let mtime_nanos = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.update(b"\0size\0");
    hasher.update(meta.len().to_le_bytes());
    hasher.update(b"\0mtime\0");
    hasher.update(mtime_nanos.to_le_bytes());
    Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Summary counters of a build run. Shared across workers, so every field
/// is atomic.
#[derive(Debug, Default)]
pub struct RunStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    total_saved: AtomicU64,
}

impl RunStats {
    pub fn processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn saved(&self, bytes: u64) {
        self.total_saved.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_saved: self.total_saved.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`RunStats`], as persisted in the cache file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub total_saved: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} skipped, {} errors, {} saved",
            self.processed,
            self.skipped,
            self.errors,
            format_bytes(self.total_saved)
        )
    }
}

/// Human-readable byte count (`1.5 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Artifacts written for one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStats {
    pub artifacts: u32,
    pub bytes: u64,
}

/// When a hash was recorded and what its image produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub processed_at: DateTime<Utc>,
    pub output_stats: OutputStats,
}

/// On-disk representation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    processed_hashes: Vec<ContentHash>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    entries: BTreeMap<ContentHash, CacheEntry>,
    last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    stats: StatsSnapshot,
}

/// Append-only ledger of processed content hashes.
#[derive(Debug, Default)]
pub struct OptimizationCache {
    hashes: RwLock<HashSet<ContentHash>>,
    entries: Mutex<BTreeMap<ContentHash, CacheEntry>>,
    last_run: Option<DateTime<Utc>>,
    last_stats: StatsSnapshot,
}

impl OptimizationCache {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from the output directory. A missing or unreadable file yields an
    /// empty cache; the build then simply redoes the work.
    pub fn load(output_dir: &Path) -> Self {
        let path = cache_path(output_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Self::empty(),
        };
        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) => Self {
                hashes: RwLock::new(file.processed_hashes.into_iter().collect()),
                entries: Mutex::new(file.entries),
                last_run: file.last_run,
                last_stats: file.stats,
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt optimization cache");
                Self::empty()
            }
        }
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.hashes
            .read()
            .map(|set| set.contains(hash))
            .unwrap_or(false)
    }

    /// Record a hash. Recording an already-known hash is a no-op.
    pub fn record(&self, hash: ContentHash, output_stats: OutputStats) {
        let inserted = self
            .hashes
            .write()
            .map(|mut set| set.insert(hash.clone()))
            .unwrap_or(false);
        if inserted && let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                hash,
                CacheEntry {
                    processed_at: Utc::now(),
                    output_stats,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.read().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, hash: &ContentHash) -> Option<CacheEntry> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(hash).cloned())
    }

    /// Output of every image with a recorded entry.
    pub fn output_totals(&self) -> OutputStats {
        self.entries
            .lock()
            .map(|entries| {
                entries.values().fold(OutputStats::default(), |acc, e| OutputStats {
                    artifacts: acc.artifacts + e.output_stats.artifacts,
                    bytes: acc.bytes + e.output_stats.bytes,
                })
            })
            .unwrap_or_default()
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn last_stats(&self) -> StatsSnapshot {
        self.last_stats
    }

    /// Write the ledger with the stats of the run that just finished.
    pub fn save(&self, output_dir: &Path, stats: StatsSnapshot) -> Result<(), CacheError> {
        let mut processed_hashes: Vec<ContentHash> = self
            .hashes
            .read()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        processed_hashes.sort();
        let entries = self
            .entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default();
        let file = CacheFile {
            processed_hashes,
            entries,
            last_run: Some(Utc::now()),
            stats,
        };
        let json = serde_json::to_string_pretty(&file)?;
        write_atomic(&cache_path(output_dir), json.as_bytes())?;
        Ok(())
    }
}

/// Delete the persisted cache (`--clear-cache`). Missing file is fine.
pub fn clear(output_dir: &Path) -> io::Result<bool> {
    match std::fs::remove_file(cache_path(output_dir)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn cache_path(output_dir: &Path) -> PathBuf {
    output_dir.join(CACHE_FILENAME)
}

/// Canonical paths already handled in this run.
#[derive(Debug, Default)]
pub struct SeenPaths {
    seen: Mutex<HashSet<PathBuf>>,
}

impl SeenPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a path (after canonicalization) is
    /// offered, `false` afterwards.
    pub fn first_visit(&self, path: &Path) -> bool {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.seen
            .lock()
            .map(|mut seen| seen.insert(key))
            .unwrap_or(true)
    }
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
