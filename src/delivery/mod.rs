//! Runtime adaptive delivery.
//!
//! The build writes artifacts and a [`Manifest`]; this layer decides which of
//! them a particular client gets and loads it without ever failing to render:
//!
//! 1. [`negotiate`] picks a format from the placement's preference list and
//!    the client's capabilities; the remaining preferences and the fixed
//!    fallback chain follow it.
//! 2. [`network`] picks a quality tier from the connection.
//! 3. [`reveal`] defers loading of lazy placements until they near the
//!    viewport.
//! 4. [`cache`] serves repeat requests from disk and answers stats queries.
//! 5. [`perf`] scores the page from Core Web Vitals.
//!
//! [`DeliveryPlanner`] ties the first two together into a [`DeliveryPlan`];
//! [`load`] walks a plan's candidates, then the original asset, and finally
//! falls back to the decoded placeholder.
//!
//! Every platform capability is a trait with a manual implementation, and
//! every registration returns a [`Subscription`].

pub mod cache;
pub mod negotiate;
pub mod network;
pub mod perf;
pub mod reveal;
pub mod subscription;

pub use cache::{
    CacheReply, CacheRequest, CacheStats, CacheWorker, DeliveryCache, DeliveryCacheChannel,
    DirectChannel, FetchError, Fetcher, UreqFetcher, WorkerChannel,
};
pub use negotiate::{
    AcceptCapabilities, CapabilityProbe, DecodeProbe, FormatNegotiator, StaticCapabilities,
    can_decode, fallback_chain, fallback_for, select_format,
};
pub use network::{
    ManualNetworkInfo, NetworkInfoSource, NetworkQualitySelector, NetworkSample, select_quality,
};
pub use perf::{
    ManualPerformance, Metric, MetricsSnapshot, PerformanceEntry, PerformanceMonitor,
    PerformanceReport, PerformanceSource,
};
pub use reveal::{
    ElementId, IntersectionEntry, LazyReveal, ManualVisibility, Rect, RevealState,
    VisibilityObserver,
};
pub use subscription::{Listeners, Subscription};

use crate::manifest::Manifest;
use crate::placeholder::{PlaceholderImage, decode_or_fill};
use crate::registry::{LocationRegistry, RegistryError};
use crate::types::{Format, Viewport};
use std::sync::Arc;

/// How to deliver one image for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryPlan {
    /// Artifacts to try, best first.
    pub candidates: Vec<(Format, String)>,
    pub original_url: String,
    pub quality: u32,
    /// Fetch immediately instead of waiting for the element to near the viewport.
    pub eager: bool,
    pub width: u32,
    pub height: u32,
    pub placeholder_hash: Option<String>,
    pub dominant_color: Option<String>,
}

impl DeliveryPlan {
    /// Preferred URL, or the original when nothing was built.
    pub fn primary_url(&self) -> &str {
        self.candidates
            .first()
            .map(|(_, url)| url.as_str())
            .unwrap_or(&self.original_url)
    }

    /// Raster painted until the real image arrives.
    pub fn placeholder(&self) -> PlaceholderImage {
        decode_or_fill(self.placeholder_hash.as_deref(), self.dominant_color.as_deref())
    }
}

fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Resolves requests against the manifest for one client.
pub struct DeliveryPlanner {
    manifest: Manifest,
    registry: LocationRegistry,
    negotiator: FormatNegotiator,
    artifact_base: String,
    original_base: String,
}

impl DeliveryPlanner {
    /// `artifact_base` prefixes manifest paths; `original_base` prefixes
    /// source paths for the last-resort original asset.
    pub fn new(
        manifest: Manifest,
        registry: LocationRegistry,
        negotiator: FormatNegotiator,
        artifact_base: &str,
        original_base: &str,
    ) -> Self {
        Self {
            manifest,
            registry,
            negotiator,
            artifact_base: artifact_base.to_string(),
            original_base: original_base.to_string(),
        }
    }

    pub fn plan(
        &self,
        source: &str,
        placement: &str,
        viewport: Viewport,
        network: Option<&NetworkSample>,
    ) -> Result<DeliveryPlan, RegistryError> {
        let spec = self.registry.require(placement)?;
        let entry = self.manifest.resolve(source, placement, viewport);
        let candidates = match entry {
            Some(_) => self
                .negotiator
                .candidates(&spec.preferred_formats)
                .into_iter()
                .filter(|f| *f == Format::UNIVERSAL || self.negotiator.supports(*f))
                .filter_map(|f| {
                    self.manifest
                        .resolve_path(source, placement, viewport, Some(f))
                        .artifact()
                        .map(|path| (f, join_url(&self.artifact_base, &path)))
                })
                .collect(),
            None => {
                tracing::debug!(source, placement, %viewport, "no artifacts, planning original");
                Vec::new()
            }
        };
        let target = spec.dimensions.get(viewport).unwrap_or(spec.dimensions.desktop);

        Ok(DeliveryPlan {
            candidates,
            original_url: join_url(&self.original_base, source),
            quality: select_quality(spec, network),
            eager: spec.is_high_priority(),
            width: entry.map_or(target.width, |e| e.width),
            height: entry.map_or(target.height, |e| e.height),
            placeholder_hash: entry.and_then(|e| e.placeholder.clone()),
            dominant_color: entry.and_then(|e| e.dominant_color.clone()),
        })
    }

    /// Prefetch message for the preferred artifact of each plan.
    pub fn prefetch_request(plans: &[DeliveryPlan]) -> CacheRequest {
        CacheRequest::PrefetchImages {
            urls: plans
                .iter()
                .filter(|p| !p.candidates.is_empty())
                .map(|p| p.primary_url().to_string())
                .collect(),
        }
    }
}

/// What ended up on screen.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Artifact { format: Format, body: Vec<u8> },
    Original { body: Vec<u8> },
    Placeholder(PlaceholderImage),
}

/// Fetch the first candidate that arrives and decodes, then the original
/// asset, then settle for the placeholder.
pub fn load(plan: &DeliveryPlan, fetcher: &dyn Fetcher) -> LoadOutcome {
    for (format, url) in &plan.candidates {
        match fetcher.fetch(url) {
            Ok(body) if can_decode(*format, &body) => {
                return LoadOutcome::Artifact {
                    format: *format,
                    body,
                };
            }
            Ok(_) => tracing::debug!(%url, %format, "artifact failed to decode, falling back"),
            Err(e) => tracing::debug!(%url, error = %e, "artifact fetch failed, falling back"),
        }
    }
    match fetcher.fetch(&plan.original_url) {
        Ok(body) if !body.is_empty() => return LoadOutcome::Original { body },
        Ok(_) => tracing::warn!(url = %plan.original_url, "original asset is empty"),
        Err(e) => tracing::warn!(url = %plan.original_url, error = %e, "original asset unavailable"),
    }
    LoadOutcome::Placeholder(plan.placeholder())
}

/// Load `plan` once its element nears the viewport (immediately when the
/// plan is eager) and hand the outcome to `on_loaded`.
pub fn load_when_visible(
    plan: DeliveryPlan,
    element: ElementId,
    observer: &dyn VisibilityObserver,
    fetcher: Arc<dyn Fetcher>,
    on_loaded: impl FnOnce(LoadOutcome) + Send + 'static,
) -> LazyReveal {
    let eager = plan.eager;
    LazyReveal::new(element, eager, observer, move || {
        on_loaded(load(&plan, fetcher.as_ref()));
    })
}
