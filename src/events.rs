//! Event bus — per-widget, per-event subscriber registry and dispatch engine.
//!
//! DESIGN
//! ======
//! Subscriptions are keyed by `(widget_id, event_name)` and created lazily on
//! first registration. Dispatch is synchronous, single-threaded from the
//! caller's point of view, and strictly ordered by subscription order.
//! The subscriber list is snapshotted before iteration, so a handler that
//! subscribes or unsubscribes mid-dispatch affects subsequent dispatches
//! only, never the one in flight.
//!
//! ERROR HANDLING
//! ==============
//! A handler that panics is contained and logged; the remaining handlers of
//! the same dispatch still run. Script handlers surface their errors as
//! `Result`s inside their wrapper and never reach the containment path.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error};

/// Callback invoked with the event payload on dispatch.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Closure that removes a subscription. Safe to call more than once.
pub type Unsubscribe = Box<dyn Fn() + Send + Sync>;

// =============================================================================
// REGISTRY
// =============================================================================

struct SubEntry {
    id: u64,
    callback: EventCallback,
}

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<(String, String), Vec<SubEntry>>,
    next_id: u64,
}

impl BusInner {
    fn remove_by_id(&mut self, widget_id: &str, event: &str, id: u64) {
        let key = (widget_id.to_owned(), event.to_owned());
        if let Some(entries) = self.subscribers.get_mut(&key) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }
}

/// The runtime's event bus. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(BusInner::default())) }
    }

    /// Subscribe to an event on a widget. Returns an unsubscribe closure.
    pub fn on(
        &self,
        widget_id: impl Into<String>,
        event: impl Into<String>,
        callback: EventCallback,
    ) -> Unsubscribe {
        let (widget_id, event) = (widget_id.into(), event.into());
        let id = self.insert(widget_id.clone(), event.clone(), callback);
        self.unsubscriber(widget_id, event, id)
    }

    /// Subscribe to the next occurrence of an event only. The callback is
    /// registered as a self-removing wrapper, so dispatch never needs to
    /// know about "once"-ness.
    pub fn once(
        &self,
        widget_id: impl Into<String>,
        event: impl Into<String>,
        callback: EventCallback,
    ) -> Unsubscribe {
        let (widget_id, event) = (widget_id.into(), event.into());
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            inner.next_id
        };

        let weak = Arc::downgrade(&self.inner);
        let (wid, evt) = (widget_id.clone(), event.clone());
        let wrapper: EventCallback = Arc::new(move |value| {
            if let Some(inner) = weak.upgrade() {
                inner.lock().remove_by_id(&wid, &evt, id);
            }
            callback(value);
        });

        {
            let mut inner = self.inner.lock();
            inner
                .subscribers
                .entry((widget_id.clone(), event.clone()))
                .or_default()
                .push(SubEntry { id, callback: wrapper });
        }
        self.unsubscriber(widget_id, event, id)
    }

    /// Remove all subscriptions for a widget.
    pub fn off_widget(&self, widget_id: &str) {
        self.inner
            .lock()
            .subscribers
            .retain(|(wid, _), _| wid != widget_id);
    }

    /// Remove all subscriptions for one event on a widget.
    pub fn off_event(&self, widget_id: &str, event: &str) {
        self.inner
            .lock()
            .subscribers
            .remove(&(widget_id.to_owned(), event.to_owned()));
    }

    /// Dispatch an event to all current subscribers, in subscription order.
    ///
    /// An empty subscriber set is a diagnostic, not an error: inbound
    /// telemetry routinely targets widgets no script has hooked.
    pub fn trigger(&self, widget_id: &str, event: &str, value: &Value) {
        let snapshot: Vec<EventCallback> = {
            let inner = self.inner.lock();
            match inner
                .subscribers
                .get(&(widget_id.to_owned(), event.to_owned()))
            {
                Some(entries) => entries.iter().map(|e| e.callback.clone()).collect(),
                None => {
                    debug!(widget_id, event, "no subscribers for event");
                    return;
                }
            }
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                error!(widget_id, event, "event handler panicked; continuing dispatch");
            }
        }
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// Number of live subscriptions across all widgets.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscribers.values().map(Vec::len).sum()
    }

    fn insert(&self, widget_id: String, event: String, callback: EventCallback) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .subscribers
            .entry((widget_id, event))
            .or_default()
            .push(SubEntry { id, callback });
        id
    }

    fn unsubscriber(&self, widget_id: String, event: String, id: u64) -> Unsubscribe {
        let weak: Weak<Mutex<BusInner>> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().remove_by_id(&widget_id, &event, id);
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
