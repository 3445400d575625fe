//! Event fan-out to registered listeners

use super::metrics;
use crate::domain::SipEvent;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::debug;

/// Observer of agent events.
///
/// Called on the thread that produced the event; implementations should
/// hand off anything slow.
pub trait SipEventListener: Send + Sync {
    fn on_sip_event(&self, event: &SipEvent);
}

type ListenerSet = Vec<Arc<dyn SipEventListener>>;

/// Copy-on-write listener set.
///
/// Registration swaps in a new vector; dispatch works on whichever vector
/// was current when it started, so it never sees a half-updated set.
pub struct EventDispatcher {
    listeners: ArcSwap<ListenerSet>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Add `listener` unless it is already present. Returns whether it was added.
    pub fn add(&self, listener: Arc<dyn SipEventListener>) -> bool {
        let mut added = false;
        self.listeners.rcu(|current| {
            if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                added = false;
                Arc::clone(current)
            } else {
                added = true;
                let mut next = ListenerSet::clone(current);
                next.push(listener.clone());
                Arc::new(next)
            }
        });
        metrics::update_listeners(self.len());
        added
    }

    /// Remove `listener` if present. Returns whether it was removed.
    pub fn remove(&self, listener: &Arc<dyn SipEventListener>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            if current.iter().any(|l| Arc::ptr_eq(l, listener)) {
                removed = true;
                Arc::new(
                    current
                        .iter()
                        .filter(|l| !Arc::ptr_eq(l, listener))
                        .cloned()
                        .collect(),
                )
            } else {
                removed = false;
                Arc::clone(current)
            }
        });
        metrics::update_listeners(self.len());
        removed
    }

    /// Deliver `event` to every listener of the current snapshot
    pub fn dispatch(&self, event: &SipEvent) {
        let snapshot = self.listeners.load_full();
        if snapshot.is_empty() {
            return;
        }

        debug!(
            "Dispatching {} to {} listener(s)",
            event.event_type.as_str(),
            snapshot.len()
        );
        for listener in snapshot.iter() {
            listener.on_sip_event(event);
        }
        metrics::record_event_dispatched(event.event_type.as_str());
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.load().is_empty()
    }
}
