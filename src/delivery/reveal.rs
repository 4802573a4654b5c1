//! Lazy reveal: defer fetching an image until it nears the viewport.
//!
//! Each [`LazyReveal`] moves through `Pending → Visible` exactly once. The
//! transition fires when the observed element comes within
//! [`REVEAL_MARGIN_PX`] of the viewport, or immediately for high-priority
//! placements. Dropping the reveal before it fires releases the observation,
//! so a torn-down element never triggers a fetch.

use super::subscription::{Listeners, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Distance outside the viewport at which loading starts.
pub const REVEAL_MARGIN_PX: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealState {
    Pending,
    Visible,
}

const PENDING: u8 = 0;
const VISIBLE: u8 = 1;

/// Axis-aligned box in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}

impl Rect {
    pub fn new(top: f64, left: f64, bottom: f64, right: f64) -> Self {
        Self {
            top,
            left,
            bottom,
            right,
        }
    }

    /// Viewport of the given size anchored at the origin.
    pub fn viewport(width: f64, height: f64) -> Self {
        Self::new(0.0, 0.0, height, width)
    }

    fn expand(&self, margin: f64) -> Self {
        Self::new(
            self.top - margin,
            self.left - margin,
            self.bottom + margin,
            self.right + margin,
        )
    }

    fn intersects(&self, other: &Rect) -> bool {
        self.top <= other.bottom
            && other.top <= self.bottom
            && self.left <= other.right
            && other.left <= self.right
    }
}

/// Whether `element` lies within `margin` pixels of `viewport`.
pub fn within_margin(element: &Rect, viewport: &Rect, margin: f64) -> bool {
    viewport.expand(margin).intersects(element)
}

/// One observation report for an element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntersectionEntry {
    pub bounds: Rect,
    pub viewport: Rect,
}

impl IntersectionEntry {
    pub fn is_near(&self) -> bool {
        within_margin(&self.bounds, &self.viewport, REVEAL_MARGIN_PX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(pub u64);

type IntersectionHandler = Box<dyn Fn(&IntersectionEntry) + Send + Sync>;

/// Reports element geometry to interested parties.
pub trait VisibilityObserver: Send + Sync {
    fn observe(&self, element: ElementId, handler: IntersectionHandler) -> Subscription;
}

type ElementMap = HashMap<ElementId, Listeners<IntersectionEntry>>;

/// Observer driven by explicit [`ManualVisibility::report`] calls.
///
/// An element is tracked while at least one observation of it is live.
#[derive(Default)]
pub struct ManualVisibility {
    elements: Arc<Mutex<ElementMap>>,
}

impl ManualVisibility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, element: ElementId, entry: IntersectionEntry) {
        let listeners = self
            .elements
            .lock()
            .ok()
            .and_then(|map| map.get(&element).cloned());
        if let Some(listeners) = listeners {
            listeners.emit(&entry);
        }
    }

    /// Number of live observations across all elements.
    pub fn observed_count(&self) -> usize {
        self.elements
            .lock()
            .map(|map| map.values().map(Listeners::len).sum())
            .unwrap_or(0)
    }

    /// Number of elements with at least one live observation.
    pub fn tracked_elements(&self) -> usize {
        self.elements.lock().map(|map| map.len()).unwrap_or(0)
    }
}

impl VisibilityObserver for ManualVisibility {
    fn observe(&self, element: ElementId, handler: IntersectionHandler) -> Subscription {
        let listeners = match self.elements.lock() {
            Ok(mut map) => map.entry(element).or_default().clone(),
            Err(_) => return Subscription::noop(),
        };
        let registration = listeners.subscribe(move |entry| handler(entry));
        let elements = Arc::downgrade(&self.elements);
        Subscription::new(move || {
            drop(registration);
            if let Some(elements) = elements.upgrade() {
                let mut map = elements.lock().unwrap_or_else(|e| e.into_inner());
                if map.get(&element).is_some_and(Listeners::is_empty) {
                    map.remove(&element);
                }
            }
        })
    }
}

type RevealCallback = Box<dyn FnOnce() + Send>;

struct RevealInner {
    state: AtomicU8,
    on_visible: Mutex<Option<RevealCallback>>,
    subscription: Mutex<Option<Subscription>>,
}

impl RevealInner {
    /// Move to `Visible` if still pending; runs the callback at most once.
    fn reveal(&self) {
        if self
            .state
            .compare_exchange(PENDING, VISIBLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let subscription = self.subscription.lock().ok().and_then(|mut s| s.take());
        drop(subscription);
        let callback = self.on_visible.lock().ok().and_then(|mut c| c.take());
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Deferred load of one element.
pub struct LazyReveal {
    inner: Arc<RevealInner>,
}

impl LazyReveal {
    /// Start observing `element`. `on_visible` runs once, when the element
    /// first comes near the viewport. With `high_priority` it runs before
    /// this returns and nothing is observed.
    pub fn new(
        element: ElementId,
        high_priority: bool,
        observer: &dyn VisibilityObserver,
        on_visible: impl FnOnce() + Send + 'static,
    ) -> Self {
        let inner = Arc::new(RevealInner {
            state: AtomicU8::new(PENDING),
            on_visible: Mutex::new(Some(Box::new(on_visible))),
            subscription: Mutex::new(None),
        });
        if high_priority {
            inner.reveal();
            return Self { inner };
        }

        let weak = Arc::downgrade(&inner);
        let subscription = observer.observe(
            element,
            Box::new(move |entry| {
                if entry.is_near()
                    && let Some(inner) = weak.upgrade()
                {
                    inner.reveal();
                }
            }),
        );
        // A report may have revealed the element during `observe`.
        if inner.state.load(Ordering::SeqCst) == PENDING
            && let Ok(mut slot) = inner.subscription.lock()
        {
            *slot = Some(subscription);
        }
        Self { inner }
    }

    pub fn state(&self) -> RevealState {
        match self.inner.state.load(Ordering::SeqCst) {
            PENDING => RevealState::Pending,
            _ => RevealState::Visible,
        }
    }

    pub fn is_observing(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }
}

impl Drop for LazyReveal {
    fn drop(&mut self) {
        let subscription = self.inner.subscription.lock().ok().and_then(|mut s| s.take());
        drop(subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn entry(top: f64) -> IntersectionEntry {
        IntersectionEntry {
            bounds: Rect::new(top, 0.0, top + 200.0, 300.0),
            viewport: Rect::viewport(1024.0, 768.0),
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn margin_geometry() {
        let viewport = Rect::viewport(1024.0, 768.0);
        assert!(within_margin(&Rect::new(100.0, 0.0, 200.0, 100.0), &viewport, 50.0));
        assert!(within_margin(&Rect::new(810.0, 0.0, 900.0, 100.0), &viewport, 50.0));
        assert!(!within_margin(&Rect::new(830.0, 0.0, 900.0, 100.0), &viewport, 50.0));
        assert!(!within_margin(&Rect::new(-300.0, 0.0, -60.0, 100.0), &viewport, 50.0));
    }

    #[test]
    fn reveals_once_when_near() {
        let observer = ManualVisibility::new();
        let (count, on_visible) = counter();
        let reveal = LazyReveal::new(ElementId(1), false, &observer, on_visible);
        assert_eq!(reveal.state(), RevealState::Pending);

        observer.report(ElementId(1), entry(2000.0));
        assert_eq!(reveal.state(), RevealState::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        observer.report(ElementId(1), entry(790.0));
        assert_eq!(reveal.state(), RevealState::Visible);
        assert!(!reveal.is_observing());

        observer.report(ElementId(1), entry(0.0));
        observer.report(ElementId(1), entry(3000.0));
        assert_eq!(reveal.state(), RevealState::Visible);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(observer.observed_count(), 0);
        assert_eq!(observer.tracked_elements(), 0);
    }

    #[test]
    fn released_elements_are_forgotten() {
        let observer = ManualVisibility::new();
        let reveals: Vec<LazyReveal> = (0..5)
            .map(|i| LazyReveal::new(ElementId(i), false, &observer, || {}))
            .collect();
        let (_, on_visible) = counter();
        let shared = LazyReveal::new(ElementId(0), false, &observer, on_visible);
        assert_eq!(observer.tracked_elements(), 5);

        drop(reveals);
        // ElementId(0) is still observed by `shared`.
        assert_eq!(observer.tracked_elements(), 1);
        observer.report(ElementId(0), entry(0.0));
        assert_eq!(shared.state(), RevealState::Visible);
        assert_eq!(observer.tracked_elements(), 0);
    }

    #[test]
    fn high_priority_is_visible_immediately() {
        let observer = ManualVisibility::new();
        let (count, on_visible) = counter();
        let reveal = LazyReveal::new(ElementId(7), true, &observer, on_visible);
        assert_eq!(reveal.state(), RevealState::Visible);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(observer.observed_count(), 0);
    }

    #[test]
    fn teardown_before_visible_never_fetches() {
        let observer = ManualVisibility::new();
        let (count, on_visible) = counter();
        let reveal = LazyReveal::new(ElementId(3), false, &observer, on_visible);
        assert_eq!(observer.observed_count(), 1);

        drop(reveal);
        assert_eq!(observer.observed_count(), 0);
        observer.report(ElementId(3), entry(0.0));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reports_for_other_elements_are_ignored() {
        let observer = ManualVisibility::new();
        let (count, on_visible) = counter();
        let reveal = LazyReveal::new(ElementId(1), false, &observer, on_visible);
        observer.report(ElementId(2), entry(0.0));
        assert_eq!(reveal.state(), RevealState::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
