//! # optipix
//!
//! Build-time image optimization plus the runtime logic that picks which
//! optimized artifact a client should receive.
//!
//! # Architecture: Build, Then Deliver
//!
//! ```text
//! build     public/assets/  →  public/optimized/ + image-manifest.json
//! deliver   manifest + client capabilities  →  URL, quality, placeholder
//! ```
//!
//! The build side resizes every source for each placement it is assigned to,
//! encodes the preferred formats, and records the results in a manifest. The
//! delivery side never touches source images: it reads the manifest and
//! decides per client, falling back step by step until something renders.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | Formats, viewports and connection types shared by both sides |
//! | [`registry`] | Named placements and the `[[assign]]` rules mapping sources to them |
//! | [`config`] | `optipix.toml` loading, merging over stock defaults, validation |
//! | [`cache`] | Content hashes and the optimization cache behind idempotent builds |
//! | [`imaging`] | `ImageBackend` trait, the `image`-crate backend, size planning |
//! | [`compress`] | Optional external compression with fallback to the raw raster |
//! | [`placeholder`] | BlurHash / dominant-color placeholders, encode and decode |
//! | [`manifest`] | The build → delivery contract, `image-manifest.json` |
//! | [`transcode`] | Parallel build pipeline over all sources |
//! | [`delivery`] | Format negotiation, adaptive quality, lazy reveal, delivery cache, vitals |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Keyed on Content, Not Config
//!
//! The optimization cache records a hash of each source's bytes, size and
//! mtime. Changing the registry does not invalidate it; run with `--force`
//! after editing placements.
//!
//! ## Everything Degrades, Nothing Aborts
//!
//! A missing compression credential disables that stage. A failed artifact
//! is counted and the rest of the image continues. At delivery time an
//! undecodable format steps down AVIF → WebP → JPEG, then to the original
//! asset, then to the placeholder. Only an invalid config stops the CLI.
//!
//! ## Platform Capabilities Are Traits
//!
//! Connection info, element visibility, performance entries and format
//! support each sit behind a small trait with a manual implementation, so
//! the delivery logic runs and is tested without a browser.

pub mod cache;
pub mod compress;
pub mod config;
pub mod delivery;
pub mod imaging;
pub mod manifest;
pub mod output;
pub mod placeholder;
pub mod registry;
pub mod transcode;
pub mod types;
