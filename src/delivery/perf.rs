//! Core Web Vitals aggregation and scoring.
//!
//! A [`PerformanceMonitor`] subscribes to a [`PerformanceSource`] and folds
//! each [`PerformanceEntry`] into a [`MetricsSnapshot`]:
//!
//! | Entry | Metric | Rule |
//! |---|---|---|
//! | largest-contentful-paint | LCP | latest entry wins |
//! | interaction | INP | worst (max) duration |
//! | layout-shift | CLS | sum of shifts without recent input |
//! | paint `first-contentful-paint` | FCP | first value |
//! | navigation | TTFB | response start |
//! | resource with `img` initiator | image timings | appended |
//!
//! The score starts at 100 and subtracts a fixed penalty per metric rated
//! "needs improvement" or "poor":
//!
//! | Metric | NI above | Poor above | NI penalty | Poor penalty |
//! |---|---|---|---|---|
//! | LCP | 2500 ms | 4000 ms | 10 | 25 |
//! | INP | 200 ms | 500 ms | 10 | 25 |
//! | CLS | 0.1 | 0.25 | 10 | 25 |
//! | FCP | 1800 ms | 3000 ms | 5 | 15 |
//! | TTFB | 800 ms | 1800 ms | 5 | 10 |
//!
//! Metrics not observed yet cost nothing. Nothing here feeds back into
//! negotiation or quality selection; the report is advisory.

use super::cache::CacheStats;
use super::subscription::{Listeners, Subscription};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Average image load above which images are flagged as slow.
pub const SLOW_IMAGE_MS: f64 = 1000.0;
/// Cache efficiency (percent) below which the cache is flagged.
pub const LOW_CACHE_EFFICIENCY: f64 = 50.0;
/// Requests needed before cache efficiency is judged.
pub const MIN_CACHE_REQUESTS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Metric {
    Lcp,
    Inp,
    Cls,
    Fcp,
    Ttfb,
}

impl Metric {
    pub const ALL: [Metric; 5] = [Metric::Lcp, Metric::Inp, Metric::Cls, Metric::Fcp, Metric::Ttfb];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Lcp => "LCP",
            Metric::Inp => "INP",
            Metric::Cls => "CLS",
            Metric::Fcp => "FCP",
            Metric::Ttfb => "TTFB",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub needs_improvement: f64,
    pub poor: f64,
    pub needs_improvement_penalty: u32,
    pub poor_penalty: u32,
}

pub fn thresholds(metric: Metric) -> Thresholds {
    let (needs_improvement, poor, needs_improvement_penalty, poor_penalty) = match metric {
        Metric::Lcp => (2500.0, 4000.0, 10, 25),
        Metric::Inp => (200.0, 500.0, 10, 25),
        Metric::Cls => (0.1, 0.25, 10, 25),
        Metric::Fcp => (1800.0, 3000.0, 5, 15),
        Metric::Ttfb => (800.0, 1800.0, 5, 10),
    };
    Thresholds {
        needs_improvement,
        poor,
        needs_improvement_penalty,
        poor_penalty,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rating {
    Good,
    NeedsImprovement,
    Poor,
}

pub fn rate(metric: Metric, value: f64) -> Rating {
    let t = thresholds(metric);
    if value > t.poor {
        Rating::Poor
    } else if value > t.needs_improvement {
        Rating::NeedsImprovement
    } else {
        Rating::Good
    }
}

fn penalty(metric: Metric, value: f64) -> u32 {
    let t = thresholds(metric);
    match rate(metric, value) {
        Rating::Good => 0,
        Rating::NeedsImprovement => t.needs_improvement_penalty,
        Rating::Poor => t.poor_penalty,
    }
}

/// A raw performance observation.
#[derive(Debug, Clone, PartialEq)]
pub enum PerformanceEntry {
    LargestContentfulPaint { start_ms: f64 },
    Interaction { duration_ms: f64 },
    LayoutShift { value: f64, had_recent_input: bool },
    Paint { name: String, start_ms: f64 },
    Navigation { ttfb_ms: f64 },
    Resource {
        name: String,
        initiator: String,
        duration_ms: f64,
        transfer_size: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTiming {
    pub url: String,
    pub duration_ms: f64,
    pub transfer_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub lcp: Option<f64>,
    pub inp: Option<f64>,
    pub cls: Option<f64>,
    pub fcp: Option<f64>,
    pub ttfb: Option<f64>,
    pub images: Vec<ImageTiming>,
    pub cache: Option<CacheStats>,
}

impl MetricsSnapshot {
    pub fn record(&mut self, entry: &PerformanceEntry) {
        match entry {
            PerformanceEntry::LargestContentfulPaint { start_ms } => self.lcp = Some(*start_ms),
            PerformanceEntry::Interaction { duration_ms } => {
                self.inp = Some(self.inp.map_or(*duration_ms, |v| v.max(*duration_ms)));
            }
            PerformanceEntry::LayoutShift {
                value,
                had_recent_input,
            } => {
                if !had_recent_input {
                    self.cls = Some(self.cls.unwrap_or(0.0) + value);
                }
            }
            PerformanceEntry::Paint { name, start_ms } => {
                if name == "first-contentful-paint" && self.fcp.is_none() {
                    self.fcp = Some(*start_ms);
                }
            }
            PerformanceEntry::Navigation { ttfb_ms } => self.ttfb = Some(*ttfb_ms),
            PerformanceEntry::Resource {
                name,
                initiator,
                duration_ms,
                transfer_size,
            } => {
                if initiator == "img" {
                    self.images.push(ImageTiming {
                        url: name.clone(),
                        duration_ms: *duration_ms,
                        transfer_size: *transfer_size,
                    });
                }
            }
        }
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Lcp => self.lcp,
            Metric::Inp => self.inp,
            Metric::Cls => self.cls,
            Metric::Fcp => self.fcp,
            Metric::Ttfb => self.ttfb,
        }
    }

    /// 100 minus the penalties of every observed metric.
    pub fn score(&self) -> u32 {
        let total: u32 = Metric::ALL
            .iter()
            .filter_map(|m| self.value(*m).map(|v| penalty(*m, v)))
            .sum();
        100u32.saturating_sub(total)
    }

    pub fn average_image_ms(&self) -> Option<f64> {
        if self.images.is_empty() {
            return None;
        }
        let sum: f64 = self.images.iter().map(|i| i.duration_ms).sum();
        Some(sum / self.images.len() as f64)
    }

    /// Advice for every metric not rated good, plus image and cache checks.
    pub fn recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();
        for metric in Metric::ALL {
            let Some(value) = self.value(metric) else {
                continue;
            };
            if rate(metric, value) == Rating::Good {
                continue;
            }
            out.push(
                match metric {
                    Metric::Lcp => "Preload the hero image and serve it in AVIF or WebP",
                    Metric::Inp => "Break up long tasks that block input handling",
                    Metric::Cls => "Reserve space for images with explicit width and height",
                    Metric::Fcp => "Inline critical CSS and defer non-critical scripts",
                    Metric::Ttfb => "Serve optimized assets from a CDN edge cache",
                }
                .to_string(),
            );
        }
        if let Some(avg) = self.average_image_ms()
            && avg > SLOW_IMAGE_MS
        {
            out.push(format!(
                "Images average {:.0} ms to load; lower quality on slow connections",
                avg
            ));
        }
        if let Some(cache) = self.cache
            && cache.requests() >= MIN_CACHE_REQUESTS
            && cache.efficiency < LOW_CACHE_EFFICIENCY
        {
            out.push(format!(
                "Cache efficiency is {:.0}%; prefetch images likely to be viewed",
                cache.efficiency
            ));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub metrics: MetricsSnapshot,
    pub score: u32,
    pub recommendations: Vec<String>,
}

/// Stream of performance entries.
pub trait PerformanceSource: Send + Sync {
    fn subscribe(&self, handler: Box<dyn Fn(&PerformanceEntry) + Send + Sync>) -> Subscription;
}

/// Source fed by explicit [`ManualPerformance::push`] calls.
#[derive(Default)]
pub struct ManualPerformance {
    listeners: Listeners<PerformanceEntry>,
}

impl ManualPerformance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: PerformanceEntry) {
        self.listeners.emit(&entry);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

impl PerformanceSource for ManualPerformance {
    fn subscribe(&self, handler: Box<dyn Fn(&PerformanceEntry) + Send + Sync>) -> Subscription {
        self.listeners.subscribe(move |e| handler(e))
    }
}

/// Live aggregation of one page's entries. Dropping it unsubscribes.
pub struct PerformanceMonitor {
    state: Arc<Mutex<MetricsSnapshot>>,
    _subscription: Subscription,
}

impl PerformanceMonitor {
    pub fn new(source: &dyn PerformanceSource) -> Self {
        let state = Arc::new(Mutex::new(MetricsSnapshot::default()));
        let shared = Arc::clone(&state);
        let subscription = source.subscribe(Box::new(move |entry| {
            if let Ok(mut snapshot) = shared.lock() {
                snapshot.record(entry);
            }
        }));
        Self {
            state,
            _subscription: subscription,
        }
    }

    pub fn record_cache_stats(&self, stats: CacheStats) {
        if let Ok(mut snapshot) = self.state.lock() {
            snapshot.cache = Some(stats);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn report(&self) -> PerformanceReport {
        let metrics = self.snapshot();
        let report = PerformanceReport {
            score: metrics.score(),
            recommendations: metrics.recommendations(),
            metrics,
        };
        tracing::debug!(score = report.score, "performance report");
        report
    }
}
