//! Reconnect supervisor
//!
//! Decides, once per check period, whether a session needs a reconnect
//! attempt or must be declared offline.
//!
//! ## State machine
//!
//! ```text
//!            connect ok                 elapsed > w
//! UNKNOWN ──────────────▶ ONLINE ─────────────────────▶ RECONNECTING
//!    │                      ▲                                │
//!    │ elapsed > w          │ data / reconnect ok            │ elapsed > w * k
//!    └──────────────▶ RECONNECTING                           ▼
//!                           ▲                             OFFLINE
//!                           └──── (status stays OFFLINE while retrying;
//!                                  data / reconnect / wake → ONLINE)
//! ```
//!
//! The supervisor itself never touches the network. It only answers
//! [`Decision`]s; the engine turns a `Reconnect` into a connect job on
//! another task and feeds the outcome back through
//! [`Supervisor::on_attempt_failed`] / [`Supervisor::on_recovered`].
//!
//! ## Backoff
//!
//! Failed attempts are spaced with exponential backoff plus deterministic
//! jitter: `min(initial * 2^n, max) * (1 + 0.25 * sin(7.3 * n))`.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{LivenessConfig, ReconnectConfig};

/// Externally visible device status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceStatus {
    /// Not yet connected
    #[default]
    Unknown,
    /// Data is flowing
    Online,
    /// Data stopped; reconnect attempts are running
    Reconnecting,
    /// No data for `window * offline_factor`
    Offline,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceStatus::Unknown => "UNKNOWN",
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Reconnecting => "RECONNECTING",
            DeviceStatus::Offline => "OFFLINE",
        };
        f.write_str(name)
    }
}

/// What the engine should do after a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do this cycle
    Idle,
    /// Start reconnect attempt number `attempt` (1-based)
    Reconnect { attempt: u32 },
    /// Declare the device offline and reset the liveness clock
    GoOffline,
}

/// Inputs of one supervisor check
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// Current status
    pub status: DeviceStatus,
    /// Time since the last successful exchange (or cycle start)
    pub elapsed: Duration,
    /// A connect job is already running
    pub in_flight: bool,
    /// The event link closed on its own
    pub link_lost: bool,
}

/// Reconnect decision logic for one session
#[derive(Debug, Clone)]
pub struct Supervisor {
    window: Duration,
    offline_after: Duration,
    backoff: ReconnectConfig,
    failures: u32,
    next_attempt_at: Option<Instant>,
    suspended: bool,
}

impl Supervisor {
    /// Create a supervisor from liveness and backoff settings
    pub fn new(liveness: &LivenessConfig, backoff: ReconnectConfig) -> Self {
        Self {
            window: liveness.window(),
            offline_after: liveness.offline_after(),
            backoff,
            failures: 0,
            next_attempt_at: None,
            suspended: false,
        }
    }

    /// Reconnect threshold
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Offline threshold
    pub fn offline_after(&self) -> Duration {
        self.offline_after
    }

    /// Consecutive failed attempts since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Evaluate one check cycle
    pub fn evaluate(&self, now: Instant, obs: Observation) -> Decision {
        if obs.status != DeviceStatus::Offline && obs.elapsed > self.offline_after {
            return Decision::GoOffline;
        }

        let wants_reconnect = obs.link_lost || obs.elapsed > self.window;
        if !wants_reconnect || obs.in_flight || self.suspended {
            return Decision::Idle;
        }

        if let Some(at) = self.next_attempt_at
            && now < at
        {
            trace!(wait_ms = (at - now).as_millis() as u64, "Reconnect backoff pending");
            return Decision::Idle;
        }

        Decision::Reconnect {
            attempt: self.failures + 1,
        }
    }

    /// Record a failed attempt and schedule the next one
    pub fn on_attempt_failed(&mut self, now: Instant) {
        let delay = calculate_backoff(self.failures, &self.backoff);
        debug!(
            failures = self.failures + 1,
            delay_ms = delay.as_millis() as u64,
            "Reconnect attempt failed, backing off"
        );
        self.failures = self.failures.saturating_add(1);
        self.next_attempt_at = Some(now + delay);
    }

    /// Record a successful exchange after trouble; clears backoff and suspension
    pub fn on_recovered(&mut self) {
        self.failures = 0;
        self.next_attempt_at = None;
        self.suspended = false;
    }

    /// Stop automatic attempts until [`Supervisor::resume`] or recovery
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Allow automatic attempts again without waiting for backoff
    pub fn resume(&mut self) {
        self.suspended = false;
        self.next_attempt_at = None;
    }

    /// Whether automatic attempts are suspended
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

/// Exponential backoff with deterministic jitter.
///
/// The jitter is seeded from the attempt number, not random, so schedules
/// are reproducible under paused test time.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay().as_secs_f64() * 2.0_f64.powi(attempt.min(30) as i32);
    let capped = base.min(config.max_delay().as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * ((attempt as f64 * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

/// Spawn the fixed-period check task
///
/// Every `period` it posts `make()` into `tx` without waiting: if the queue
/// is full the tick is skipped, so the ticker can never be starved by a busy
/// engine. The task exits on cancellation or when the receiver is gone.
pub fn spawn_ticker<M, F>(
    period: Duration,
    tx: mpsc::Sender<M>,
    make: F,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    M: Send + 'static,
    F: Fn() -> M + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match tx.try_send(make()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("Engine queue full, skipping supervisor tick");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
        }

        trace!("Supervisor ticker exiting");
    })
}
