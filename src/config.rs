//! Tool configuration.
//!
//! Handles loading, validating, and merging `optipix.toml`. Stock defaults
//! (including the stock placements) are the base layer; a user file only
//! needs the values it wants to override.
//!
//! ## Config File Location
//!
//! By default the file is read from the input directory
//! (`public/assets/optipix.toml`). `--config <file>` points elsewhere. A
//! missing file is not an error: the stock config applies.
//!
//! ## Configuration Options
//!
//! ```toml
//! default_placements = ["content-inline"]
//!
//! [build]
//! quality = 80              # Quality for placements that don't set one (1-100)
//!
//! [processing]
//! max_processes = 4         # Max parallel workers (omit for auto = CPU cores)
//!
//! [compression]
//! api_key_env = "TINYPNG_API_KEY"
//! endpoint = "https://api.tinify.com/shrink"
//! timeout_secs = 30
//!
//! [placements.hero-main]
//! quality = 85
//! preferred_formats = ["avif", "webp", "jpg"]
//! preload = "eager"
//! dimensions.mobile = { width = 768, height = 432 }
//! dimensions.desktop = { width = 1920, height = 1080 }
//! adaptive_quality = { slow2g = 40, 2g = 50, 3g = 70, 4g = 85 }
//!
//! [[assign]]
//! pattern = "hero/*"
//! placements = ["hero-main", "og-image"]
//! ```
//!
//! Tables merge key by key, so overriding `placements.hero-main.quality`
//! keeps every other stock field of `hero-main`. Arrays (including
//! `[[assign]]`) replace the stock value wholesale. Unknown keys are
//! rejected to catch typos early.

use crate::registry::{
    AssignRule, LocationRegistry, PlacementConfig, RegistryError, stock_assign_rules,
    stock_placements,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default config file name looked up in the input directory.
pub const CONFIG_FILENAME: &str = "optipix.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Placements for images no `[[assign]]` rule matches.
    pub default_placements: Vec<String>,
    pub build: BuildConfig,
    pub processing: ProcessingConfig,
    pub compression: CompressionConfig,
    pub placements: BTreeMap<String, PlacementConfig>,
    pub assign: Vec<AssignRule>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            default_placements: vec!["content-inline".to_string()],
            build: BuildConfig::default(),
            processing: ProcessingConfig::default(),
            compression: CompressionConfig::default(),
            placements: stock_placements(),
            assign: stock_assign_rules(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.build.quality) {
            return Err(ConfigError::Validation("build.quality must be 1-100".into()));
        }
        if self.placements.is_empty() {
            return Err(ConfigError::Validation(
                "at least one placement must be defined".into(),
            ));
        }
        if self.compression.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "compression.timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Build the immutable registry from this config.
    pub fn registry(&self) -> Result<LocationRegistry, ConfigError> {
        Ok(LocationRegistry::new(
            &self.placements,
            self.assign.clone(),
            self.default_placements.clone(),
            self.build.quality,
        )?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Quality for placements without an explicit one.
    pub quality: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self { quality: 80 }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel image workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_processes
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

/// External compression service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfig {
    /// Environment variable holding the API credential.
    pub api_key_env: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            api_key_env: "TINYPNG_API_KEY".to_string(),
            endpoint: "https://api.tinify.com/shrink".to_string(),
            timeout_secs: 30,
        }
    }
}

// =============================================================================
// Loading and merging
// =============================================================================

/// Stock config as a TOML table, the base layer for merging.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(OptimizerConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Parse a config from TOML text layered over the stock defaults.
pub fn parse_config(content: &str) -> Result<OptimizerConfig, ConfigError> {
    let overlay: toml::Value = toml::from_str(content)?;
    let merged = merge_toml(stock_defaults_value(), overlay);
    let config: OptimizerConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a file. A missing file yields the stock config.
pub fn load_config(path: &Path) -> Result<OptimizerConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using stock defaults");
        return Ok(OptimizerConfig::default());
    }
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// The stock config rendered as documented TOML, for `optipix gen-config`.
pub fn stock_config_toml() -> String {
    let body = toml::to_string_pretty(&OptimizerConfig::default())
        .expect("default config must serialize");
    format!(
        "# optipix configuration\n\
         #\n\
         # Every value below is the stock default. Keep only what you change:\n\
         # tables merge key by key over these defaults, arrays replace them.\n\
         #\n\
         # Placement fields:\n\
         #   dimensions.{{mobile,tablet,desktop}} = {{ width, height }}  (tablet optional)\n\
         #   quality            1-100, falls back to build.quality\n\
         #   preferred_formats  ordered list of avif | webp | jpg | png\n\
         #   adaptive_quality   {{ slow2g, 2g, 3g, 4g }} per connection type\n\
         #   placeholder        blur | dominant-color | none\n\
         #   preload            eager | lazy\n\
         #   content_type       photo | illustration | screenshot | logo\n\
         #   compression        aggressive | balanced | lossless\n\
         \n{body}"
    )
}
