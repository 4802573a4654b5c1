//! Connection-aware quality selection.
//!
//! A [`NetworkSample`] describes the client's connection the way the Network
//! Information API (or the `ECT` / `Save-Data` / `Downlink` client hints) does.
//! [`select_quality`] maps a sample onto a placement's adaptive-quality table.
//! [`NetworkQualitySelector`] keeps that mapping current by re-evaluating on
//! every change a [`NetworkInfoSource`] reports.

use super::subscription::{Listeners, Subscription};
use crate::registry::PlacementSpec;
use crate::types::EffectiveType;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    pub effective_type: EffectiveType,
    pub save_data: bool,
    pub downlink_mbps: f64,
}

impl NetworkSample {
    pub fn new(effective_type: EffectiveType) -> Self {
        Self {
            effective_type,
            save_data: false,
            downlink_mbps: 0.0,
        }
    }

    pub fn with_save_data(mut self, save_data: bool) -> Self {
        self.save_data = save_data;
        self
    }

    /// Build a sample from client-hint header values.
    ///
    /// Returns `None` without a recognizable `ECT` value. `Save-Data` counts
    /// only when it is `on`; an unparseable `Downlink` is treated as 0.
    pub fn from_client_hints(
        ect: Option<&str>,
        save_data: Option<&str>,
        downlink: Option<&str>,
    ) -> Option<Self> {
        let effective_type = EffectiveType::parse(ect?)?;
        Some(Self {
            effective_type,
            save_data: save_data.is_some_and(|v| v.trim().eq_ignore_ascii_case("on")),
            downlink_mbps: downlink
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(0.0),
        })
    }
}

/// Quality for `placement` under the given connection.
///
/// * no sample: the placement's static quality
/// * save-data: the lowest adaptive tier (static quality without a table)
/// * otherwise: the tier for the effective type, or the static quality when
///   the placement has no adaptive table
pub fn select_quality(placement: &PlacementSpec, network: Option<&NetworkSample>) -> u32 {
    let Some(sample) = network else {
        return placement.quality;
    };
    let Some(table) = placement.adaptive_quality else {
        return placement.quality;
    };
    if sample.save_data {
        table.lowest()
    } else {
        table.for_type(sample.effective_type)
    }
}

/// Source of connection information with change notification.
pub trait NetworkInfoSource: Send + Sync {
    /// Current sample, if the platform exposes one.
    fn current(&self) -> Option<NetworkSample>;

    fn subscribe(&self, handler: Box<dyn Fn(&NetworkSample) + Send + Sync>) -> Subscription;
}

/// Network information pushed in by the host (tests, header parsing, an
/// embedding runtime).
#[derive(Default)]
pub struct ManualNetworkInfo {
    current: Mutex<Option<NetworkSample>>,
    listeners: Listeners<NetworkSample>,
}

impl ManualNetworkInfo {
    pub fn new(initial: Option<NetworkSample>) -> Self {
        Self {
            current: Mutex::new(initial),
            listeners: Listeners::new(),
        }
    }

    /// Replace the current sample and notify subscribers.
    pub fn set(&self, sample: NetworkSample) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(sample);
        }
        self.listeners.emit(&sample);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

impl NetworkInfoSource for ManualNetworkInfo {
    fn current(&self) -> Option<NetworkSample> {
        self.current.lock().ok().and_then(|c| *c)
    }

    fn subscribe(&self, handler: Box<dyn Fn(&NetworkSample) + Send + Sync>) -> Subscription {
        self.listeners.subscribe(move |s| handler(s))
    }
}

/// Live quality for one placement, re-evaluated on every network change.
///
/// Dropping the selector unsubscribes from the source.
pub struct NetworkQualitySelector {
    quality: Arc<AtomicU32>,
    _subscription: Subscription,
}

impl NetworkQualitySelector {
    pub fn new(placement: &PlacementSpec, source: &dyn NetworkInfoSource) -> Self {
        let initial = select_quality(placement, source.current().as_ref());
        let quality = Arc::new(AtomicU32::new(initial));
        let shared = Arc::clone(&quality);
        let spec = placement.clone();
        let subscription = source.subscribe(Box::new(move |sample| {
            let q = select_quality(&spec, Some(sample));
            let previous = shared.swap(q, Ordering::SeqCst);
            if previous != q {
                tracing::debug!(placement = %spec.id, from = previous, to = q, "quality changed");
            }
        }));
        Self {
            quality,
            _subscription: subscription,
        }
    }

    pub fn quality(&self) -> u32 {
        self.quality.load(Ordering::SeqCst)
    }
}
