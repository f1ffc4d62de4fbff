// # Session State
//
// Authentication material and liveness of one device link.
//
// ## Ownership
//
// A `Session` is owned by exactly one engine task and is never shared
// across devices. The engine task is its only writer; everything else
// observes it through the published `StatusSnapshot`. The hot field is
// `last_alive`, written by every accepted event, heartbeat and successful
// command, and read by every supervisor tick.
//
// ## Liveness cycle
//
// Staleness is measured from the last successful exchange, or from the
// start of the current cycle when nothing arrived yet. `reset_liveness()`
// starts a new cycle, which the engine does when it declares the device
// offline so the next reconnect is not judged against stale history.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::traits::{Clock, Credentials};

/// Authentication and liveness state of one device link
pub struct Session {
    endpoint: String,
    credentials: Option<Credentials>,
    last_alive: Option<Instant>,
    cycle_started: Instant,
    clock: Arc<dyn Clock>,
}

impl Session {
    /// Create a session for `endpoint`, starting a liveness cycle now
    pub fn new(endpoint: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let cycle_started = clock.now();
        Self {
            endpoint: endpoint.into(),
            credentials: None,
            last_alive: None,
            cycle_started,
            clock,
        }
    }

    /// Endpoint this session talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Record a successful exchange at the current instant
    pub fn mark_alive(&mut self) {
        self.last_alive = Some(self.clock.now());
    }

    /// Last successful exchange in this cycle, if any
    pub fn last_alive(&self) -> Option<Instant> {
        self.last_alive
    }

    /// Time since the last successful exchange (or since the cycle began)
    pub fn elapsed_since_alive(&self) -> Duration {
        let anchor = self.last_alive.unwrap_or(self.cycle_started);
        self.clock.now().saturating_duration_since(anchor)
    }

    /// Whether more than `window` passed without a successful exchange
    pub fn is_stale(&self, window: Duration) -> bool {
        self.elapsed_since_alive() > window
    }

    /// Start a fresh liveness cycle
    pub fn reset_liveness(&mut self) {
        self.last_alive = None;
        self.cycle_started = self.clock.now();
    }

    /// Current credentials, if paired/authenticated
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Store credentials after a successful pairing or connect
    pub fn store_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    /// Clear credentials and pairing code, forcing re-pairing
    pub fn invalidate(&mut self) {
        self.credentials = None;
    }

    /// Whether credentials are present
    pub fn is_paired(&self) -> bool {
        self.credentials.is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("last_alive", &self.last_alive)
            .field("cycle_started", &self.cycle_started)
            .finish()
    }
}
