//! Event router
//!
//! Fans decoded events out to every registered listener and keeps the
//! session's liveness in step with what actually arrived.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use devsession_core::router::EventRouter;
//!
//! let router = EventRouter::new(EmptyEventPolicy::Reject);
//! let id = router.subscribe(Arc::new(MeterListener::default()));
//!
//! match router.route(&event, &mut session) {
//!     RouteOutcome::Dispatched { invocations, .. } => debug!("{invocations} callbacks"),
//!     RouteOutcome::Rejected { reason } => warn!("{reason}"),
//! }
//!
//! router.unsubscribe(id);
//! ```
//!
//! ## Thread Safety
//!
//! The listener set sits behind an `RwLock`. Routing takes a snapshot of
//! the set and releases the lock before calling listeners, so a listener
//! may (un)subscribe from inside its callback.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};

use crate::config::EmptyEventPolicy;
use crate::session::Session;
use crate::traits::{Event, EventListener};

/// Handle identifying one listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Result of routing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Liveness refreshed and listeners called
    Dispatched {
        /// Entries in the event
        entries: usize,
        /// Listeners that received it
        listeners: usize,
        /// Callbacks made (`entries * listeners`)
        invocations: usize,
    },
    /// The event was refused; liveness untouched
    Rejected {
        /// Human-readable reason, used as status detail
        reason: String,
    },
}

/// Listener registry and dispatcher for one session
pub struct EventRouter {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_id: AtomicU64,
    empty_policy: EmptyEventPolicy,
}

impl EventRouter {
    /// Create a router with the given empty-event policy
    pub fn new(empty_policy: EmptyEventPolicy) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            empty_policy,
        }
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.push((id, listener));
        debug!(listener = id.0, total = listeners.len(), "Listener registered");
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Empty-event policy in effect
    pub fn empty_policy(&self) -> EmptyEventPolicy {
        self.empty_policy
    }

    /// Route one event
    ///
    /// A non-empty event refreshes liveness first and is then delivered:
    /// every listener gets one `on_entry` call per entry. An empty event
    /// follows the configured policy; under `Reject` liveness is left alone
    /// and listeners are told through `on_rejected`.
    pub fn route(&self, event: &Event, session: &mut Session) -> RouteOutcome {
        let listeners = self.snapshot();

        if event.is_empty() {
            match self.empty_policy {
                EmptyEventPolicy::Accept => {
                    session.mark_alive();
                    debug!(device = event.device_id(), "Empty event accepted as keep-alive");
                    return RouteOutcome::Dispatched {
                        entries: 0,
                        listeners: listeners.len(),
                        invocations: 0,
                    };
                }
                EmptyEventPolicy::Reject => {
                    let reason = format!("Empty event received from {}", event.device_id());
                    warn!(device = event.device_id(), "Rejecting event without entries");
                    for (id, listener) in &listeners {
                        if catch_unwind(AssertUnwindSafe(|| listener.on_rejected(&reason))).is_err() {
                            error!(listener = id.0, "Listener panicked in on_rejected");
                        }
                    }
                    return RouteOutcome::Rejected { reason };
                }
            }
        }

        session.mark_alive();

        let mut invocations = 0;
        for (id, listener) in &listeners {
            for entry in event.entries() {
                let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_entry(event, entry)));
                if delivered.is_err() {
                    error!(
                        listener = id.0,
                        channel = %entry.channel,
                        "Listener panicked while handling entry"
                    );
                }
                invocations += 1;
            }
        }

        RouteOutcome::Dispatched {
            entries: event.entries().len(),
            listeners: listeners.len(),
            invocations,
        }
    }

    fn snapshot(&self) -> Vec<(ListenerId, Arc<dyn EventListener>)> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(EmptyEventPolicy::default())
    }
}
