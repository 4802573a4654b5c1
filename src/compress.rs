//! Optional external compression with a fallback to the plain raster.
//!
//! The transcoder hands every resized raster to [`CompressionChain::compress`]
//! before format conversion. When a compressor is configured and succeeds,
//! format conversion reads the compressed raster; otherwise it reads the
//! uncompressed one. The chain never fails: a missing credential disables the
//! stage up front and a service error degrades to the raster for that call.
//!
//! The production compressor talks to a TinyPNG-compatible HTTP API
//! (`POST /shrink` with the image body, then `GET` the returned output URL).
//! It is enabled only when the credential environment variable is set.
//!
//! Intermediate files are [`tempfile::TempPath`]s owned by the returned
//! [`CompressedRaster`], so they are deleted both when compression fails and
//! once the caller is done with the result.

use crate::config::CompressionConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Unexpected service response: {0}")]
    Response(String),
}

impl From<ureq::Error> for CompressError {
    fn from(e: ureq::Error) -> Self {
        CompressError::Http(e.to_string())
    }
}

/// A compression step from one raster file to another.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    fn compress(&self, input: &Path, output: &Path) -> Result<(), CompressError>;
}

/// Client for a TinyPNG-compatible `shrink` endpoint.
pub struct TinifyCompressor {
    agent: ureq::Agent,
    endpoint: String,
    authorization: String,
}

#[derive(Deserialize)]
struct ShrinkResponse {
    output: ShrinkOutput,
}

#[derive(Deserialize)]
struct ShrinkOutput {
    url: String,
}

impl TinifyCompressor {
    pub fn new(api_key: &str, endpoint: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let token = STANDARD.encode(format!("api:{api_key}"));
        Self {
            agent,
            endpoint: endpoint.to_string(),
            authorization: format!("Basic {token}"),
        }
    }

    /// Build from config, reading the credential from the configured
    /// environment variable. `None` when the variable is unset or empty.
    pub fn from_env(config: &CompressionConfig) -> Option<Self> {
        let key = std::env::var(&config.api_key_env).ok()?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self::new(
            key,
            &config.endpoint,
            Duration::from_secs(config.timeout_secs),
        ))
    }
}

impl Compressor for TinifyCompressor {
    fn name(&self) -> &str {
        "tinypng"
    }

    fn compress(&self, input: &Path, output: &Path) -> Result<(), CompressError> {
        let body = std::fs::read(input)?;
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &self.authorization)
            .send_bytes(&body)?;
        let text = response
            .into_string()
            .map_err(|e| CompressError::Response(e.to_string()))?;
        let shrink: ShrinkResponse =
            serde_json::from_str(&text).map_err(|e| CompressError::Response(e.to_string()))?;

        let download = self
            .agent
            .get(&shrink.output.url)
            .set("Authorization", &self.authorization)
            .call()?;
        let mut bytes = Vec::new();
        download.into_reader().read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Err(CompressError::Response("empty download".into()));
        }
        std::fs::write(output, bytes)?;
        Ok(())
    }
}

/// Raster handed to format conversion.
#[derive(Debug)]
pub struct CompressedRaster {
    path: PathBuf,
    compressed: bool,
    _temp: Option<TempPath>,
}

impl CompressedRaster {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the external step actually ran and succeeded.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }
}

/// Compression stage with its fallback.
#[derive(Default)]
pub struct CompressionChain {
    compressor: Option<Box<dyn Compressor>>,
}

impl CompressionChain {
    pub fn disabled() -> Self {
        Self { compressor: None }
    }

    pub fn with(compressor: impl Compressor + 'static) -> Self {
        Self {
            compressor: Some(Box::new(compressor)),
        }
    }

    /// Chain for a build run: the external service when enabled and its
    /// credential is present, otherwise disabled.
    pub fn from_config(config: &CompressionConfig, enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }
        match TinifyCompressor::from_env(config) {
            Some(c) => Self::with(c),
            None => {
                tracing::debug!(
                    env = %config.api_key_env,
                    "compression credential not set, skipping external compression"
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.compressor.is_some()
    }

    /// Compress `raster` into a temp file inside `workdir`, falling back to
    /// `raster` itself on any failure.
    pub fn compress(&self, raster: &Path, workdir: &Path) -> CompressedRaster {
        let fallback = || CompressedRaster {
            path: raster.to_path_buf(),
            compressed: false,
            _temp: None,
        };
        let Some(compressor) = &self.compressor else {
            return fallback();
        };

        let temp = match tempfile::Builder::new()
            .prefix("compressed-")
            .suffix(".png")
            .tempfile_in(workdir)
        {
            Ok(file) => file.into_temp_path(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot create compression temp file");
                return fallback();
            }
        };

        match compressor.compress(raster, &temp) {
            Ok(()) => CompressedRaster {
                path: temp.to_path_buf(),
                compressed: true,
                _temp: Some(temp),
            },
            Err(e) => {
                tracing::warn!(
                    compressor = compressor.name(),
                    raster = %raster.display(),
                    error = %e,
                    "external compression failed, using uncompressed raster"
                );
                fallback()
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Compressor that halves the file or fails on demand.
    pub struct FakeCompressor {
        pub fail: bool,
        pub calls: Mutex<u32>,
    }

    impl FakeCompressor {
        pub fn ok() -> Self {
            Self {
                fail: false,
                calls: Mutex::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                calls: Mutex::new(0),
            }
        }
    }

    impl Compressor for FakeCompressor {
        fn name(&self) -> &str {
            "fake"
        }

        fn compress(&self, input: &Path, output: &Path) -> Result<(), CompressError> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                std::fs::write(output, b"partial")?;
                return Err(CompressError::Http("503 Service Unavailable".into()));
            }
            let bytes = std::fs::read(input)?;
            std::fs::write(output, &bytes[..bytes.len() / 2])?;
            Ok(())
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn disabled_chain_returns_raster() {
        let tmp = TempDir::new().unwrap();
        let raster = tmp.path().join("raster.png");
        std::fs::write(&raster, b"raster").unwrap();

        let out = CompressionChain::disabled().compress(&raster, tmp.path());
        assert_eq!(out.path(), raster);
        assert!(!out.is_compressed());
    }

    #[test]
    fn success_uses_compressed_file_and_cleans_up_after_drop() {
        let tmp = TempDir::new().unwrap();
        let raster = tmp.path().join("raster.png");
        std::fs::write(&raster, b"12345678").unwrap();

        let chain = CompressionChain::with(FakeCompressor::ok());
        let out = chain.compress(&raster, tmp.path());
        assert!(out.is_compressed());
        assert_eq!(std::fs::read(out.path()).unwrap(), b"1234");
        assert_eq!(files_in(tmp.path()).len(), 2);

        drop(out);
        assert_eq!(files_in(tmp.path()), vec!["raster.png".to_string()]);
    }

    #[test]
    fn failure_falls_back_and_removes_partial_output() {
        let tmp = TempDir::new().unwrap();
        let raster = tmp.path().join("raster.png");
        std::fs::write(&raster, b"12345678").unwrap();

        let chain = CompressionChain::with(FakeCompressor::failing());
        let out = chain.compress(&raster, tmp.path());
        assert!(!out.is_compressed());
        assert_eq!(out.path(), raster);
        assert_eq!(files_in(tmp.path()), vec!["raster.png".to_string()]);
    }

    #[test]
    fn missing_credential_disables_chain() {
        let config = CompressionConfig {
            api_key_env: "OPTIPIX_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..CompressionConfig::default()
        };
        assert!(!CompressionChain::from_config(&config, true).is_enabled());
    }

    #[test]
    fn disabled_flag_wins_over_credential() {
        let config = CompressionConfig {
            api_key_env: "PATH".into(),
            ..CompressionConfig::default()
        };
        assert!(!CompressionChain::from_config(&config, false).is_enabled());
        assert!(CompressionChain::from_config(&config, true).is_enabled());
    }

    #[test]
    fn unreachable_service_falls_back() {
        let tmp = TempDir::new().unwrap();
        let raster = tmp.path().join("raster.png");
        std::fs::write(&raster, b"raster").unwrap();

        let compressor =
            TinifyCompressor::new("key", "http://127.0.0.1:9/shrink", Duration::from_secs(2));
        let out = CompressionChain::with(compressor).compress(&raster, tmp.path());
        assert!(!out.is_compressed());
        assert_eq!(files_in(tmp.path()), vec!["raster.png".to_string()]);
    }
}
