//! Listener registrations with explicit release.
//!
//! Every event source in the delivery layer hands out a [`Subscription`].
//! Dropping it (or calling [`Subscription::cancel`]) removes the handler, so a
//! torn-down component can never be called back.

use std::sync::{Arc, Mutex, Weak};

/// Registration handle. Releases on drop.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    pub fn cancel(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct HandlerSet<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// A set of handlers for events of type `T`.
///
/// Handlers are invoked outside the internal lock, so a handler may drop its
/// own subscription (or subscribe others) while being called.
pub struct Listeners<T> {
    inner: Arc<Mutex<HandlerSet<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandlerSet {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = set.next_id;
            set.next_id += 1;
            set.handlers.push((id, Arc::new(handler)));
            id
        };
        let weak: Weak<Mutex<HandlerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut set = inner.lock().unwrap_or_else(|e| e.into_inner());
                set.handlers.retain(|(h, _)| *h != id);
            }
        })
    }

    /// Call every current handler with `value`.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = {
            let set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            set.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|set| set.handlers.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
