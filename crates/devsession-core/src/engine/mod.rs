//! Device session engine
//!
//! The DeviceSession is responsible for:
//! - Connecting (and pairing) through a Transport
//! - Reading pushed or polled data through an EventSource
//! - Keeping liveness and status up to date
//! - Fanning events out to registered listeners
//! - Reconnecting, and declaring the device offline, under supervisor control
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Inbound   ┌──────────────┐   Tick    ┌──────────────┐
//! │ reader task  │───────────▶│              │◀──────────│ ticker task  │
//! └──────────────┘            │              │           └──────────────┘
//! ┌──────────────┐  outcome   │ engine task  │  request  ┌──────────────┐
//! │ connect job  │───────────▶│ (single      │◀──────────│ DeviceSession│
//! └──────────────┘            │  writer)     │           │   handle     │
//!                             └──────────────┘           └──────────────┘
//!                                │        │
//!                 ┌──────────────┘        └─────────────┐
//!                 ▼                                     ▼
//!         ┌──────────────┐                      ┌──────────────┐
//!         │ EventRouter  │                      │ status watch │
//!         │ (listeners)  │                      │ + events     │
//!         └──────────────┘                      └──────────────┘
//! ```
//!
//! ## Single writer
//!
//! Every mutation of session state (liveness, credentials, status) happens
//! on the engine task, in the order messages arrive on its queue. Polling
//! results, pushed frames, supervisor ticks, connect outcomes and command
//! outcomes all go through that one queue. The ticker never blocks and
//! never does I/O; network calls run on reader tasks, connect jobs, or the
//! caller's task for commands.
//!
//! ## Lifecycle
//!
//! 1. Create with [`DeviceSession::new()`] (configuration is validated here)
//! 2. Start with [`DeviceSession::start()`]
//! 3. Issue commands, register listeners, watch status
//! 4. Stop with [`DeviceSession::dispose()`]; once it returns nothing
//!    touches the session any more

mod task;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::router::{EventRouter, ListenerId};
use crate::session::Session;
use crate::supervisor::{DeviceStatus, Supervisor};
use crate::traits::{Clock, Command, CommandResponse, Credentials, EventListener, EventSource, TokioClock, Transport};

use task::{EngineTask, Message};

/// Detail accompanying the status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusDetail {
    /// Nothing to report
    #[default]
    None,
    /// Network failure, timeout, or missing data
    CommunicationError,
    /// Malformed or empty data
    ProtocolError,
    /// Credentials or pairing rejected
    AuthError,
    /// Invalid configuration
    ConfigurationError,
}

impl From<ErrorKind> for StatusDetail {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Transport => StatusDetail::CommunicationError,
            ErrorKind::Protocol => StatusDetail::ProtocolError,
            ErrorKind::Auth => StatusDetail::AuthError,
            ErrorKind::Configuration => StatusDetail::ConfigurationError,
        }
    }
}

/// Everything a consumer can observe about a session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusSnapshot {
    /// Current status
    pub status: DeviceStatus,
    /// Detail of the last problem (cleared when the device comes back)
    pub detail: StatusDetail,
    /// Last error message, if any
    pub message: Option<String>,
    /// Consecutive failed reconnect attempts
    pub reconnect_failures: u32,
    /// Whether the session holds credentials
    pub paired: bool,
    /// Last successful exchange in the current liveness cycle
    pub last_alive: Option<Instant>,
}

/// Notifications emitted by the DeviceSession
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Engine task started
    Started {
        device_id: String,
    },

    /// Status transition
    StatusChanged {
        from: DeviceStatus,
        to: DeviceStatus,
        detail: StatusDetail,
        message: Option<String>,
    },

    /// Reconnect attempt started by the supervisor
    ReconnectStarted {
        attempt: u32,
    },

    /// Connect or reconnect attempt failed
    ReconnectFailed {
        attempt: u32,
        error: String,
    },

    /// Event delivered to listeners
    EventDispatched {
        device_id: String,
        entries: usize,
        listeners: usize,
    },

    /// Event refused (e.g. empty telegram)
    EventRejected {
        reason: String,
    },

    /// Engine task stopped
    Stopped {
        reason: String,
    },
}

/// State handed to the engine task on start
struct Pending {
    rx: mpsc::Receiver<Message>,
    status_tx: watch::Sender<StatusSnapshot>,
    session: Session,
}

/// Supervised session with one device
///
/// The handle is cheap to share behind an `Arc`; all methods take `&self`.
pub struct DeviceSession {
    device_id: String,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    source: Arc<dyn EventSource>,
    router: Arc<EventRouter>,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<Message>,
    event_tx: mpsc::Sender<SessionEvent>,
    status_rx: watch::Receiver<StatusSnapshot>,
    pending: Mutex<Option<Pending>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DeviceSession {
    /// Create a new device session
    ///
    /// # Parameters
    ///
    /// - `transport`: Request/response transport
    /// - `source`: Event source for pushed or polled data
    /// - `config`: Session configuration
    ///
    /// # Returns
    ///
    /// A tuple of (session, event_receiver) where event_receiver yields
    /// session notifications. Invalid configuration is reported here and no
    /// task is started.
    pub fn new(
        transport: Arc<dyn Transport>,
        source: Arc<dyn EventSource>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        Self::with_clock(transport, source, config, Arc::new(TokioClock))
    }

    /// Like [`DeviceSession::new`] with an explicit clock
    pub fn with_clock(
        transport: Arc<dyn Transport>,
        source: Arc<dyn EventSource>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;

        let capacity = config.engine.event_channel_capacity;
        let (tx, rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let mut session = Session::new(config.transport.endpoint(), clock.clone());
        if let Some(credentials) = &config.credentials {
            session.store_credentials(Credentials::from(credentials));
        }

        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            paired: session.is_paired(),
            ..StatusSnapshot::default()
        });

        let engine = Self {
            device_id: config.device_id.clone(),
            router: Arc::new(EventRouter::new(config.engine.empty_event_policy)),
            config,
            transport,
            source,
            clock,
            tx,
            event_tx,
            status_rx,
            pending: Mutex::new(Some(Pending { rx, status_tx, session })),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        };

        Ok((engine, event_rx))
    }

    /// Device identity
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Address of the device's transport
    pub fn endpoint(&self) -> &str {
        self.config.transport.endpoint()
    }

    /// Start the engine and supervisor tasks and queue the initial connect
    ///
    /// Must be called from within a tokio runtime. Calling it twice is an
    /// error; calling it after [`DeviceSession::dispose`] returns
    /// [`Error::Disposed`].
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Disposed);
        }

        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Other(format!("Session {} already started", self.device_id)))?;

        let supervisor = Supervisor::new(&self.config.liveness, self.config.reconnect.clone());
        let task = EngineTask::new(
            self.device_id.clone(),
            pending.session,
            supervisor,
            self.router.clone(),
            self.transport.clone(),
            self.source.clone(),
            self.clock.clone(),
            self.tx.clone(),
            self.event_tx.clone(),
            pending.status_tx,
            self.config.engine.request_timeout(),
            self.cancel.clone(),
        );

        let engine_handle = tokio::spawn(task.run(pending.rx));
        let ticker_handle = crate::supervisor::spawn_ticker(
            self.config.liveness.check_interval(),
            self.tx.clone(),
            || Message::Tick,
            self.cancel.clone(),
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(engine_handle);
        tasks.push(ticker_handle);

        info!(
            device = %self.device_id,
            transport = self.transport.transport_name(),
            source = self.source.source_name(),
            window_secs = self.config.liveness.window_secs,
            offline_factor = self.config.liveness.offline_factor,
            metadata = ?self.config.engine.metadata,
            "Device session started"
        );
        Ok(())
    }

    /// Connect now and wait for the outcome
    ///
    /// Joins an attempt already in flight instead of starting a second one.
    /// Also serves as the external wake signal: it lifts a suspension caused
    /// by a rejected pairing and skips any pending backoff.
    pub async fn connect(&self) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.request(Message::Connect { reply }).await?;
        outcome.await.map_err(|_| Error::Disposed)?
    }

    /// Execute a command on the device
    ///
    /// The network call runs on the caller's task under the configured
    /// request timeout. Success refreshes liveness; an authentication
    /// rejection invalidates the session and starts re-pairing.
    pub async fn send_command(&self, command: Command) -> Result<CommandResponse> {
        let (reply, credentials) = oneshot::channel();
        self.request(Message::Credentials { reply }).await?;
        let credentials = credentials.await.map_err(|_| Error::Disposed)??;

        let timeout = self.config.engine.request_timeout();
        let result = with_timeout(timeout, self.transport.send(&credentials, &command)).await;

        let outcome = match &result {
            Ok(_) => Ok(()),
            Err(err) => Err((err.kind(), err.to_string())),
        };
        if self.tx.send(Message::CommandFinished { outcome }).await.is_err() {
            debug!(device = %self.device_id, "Command finished after the engine stopped");
        }

        match &result {
            Ok(_) => debug!(device = %self.device_id, op = %command.op, "Command succeeded"),
            Err(err) => debug!(device = %self.device_id, op = %command.op, error = %err, "Command failed"),
        }
        result
    }

    /// Register an event listener
    pub fn on_event(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.router.subscribe(listener)
    }

    /// Remove an event listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.router.unsubscribe(id)
    }

    /// Current status
    pub fn current_status(&self) -> DeviceStatus {
        self.status_rx.borrow().status
    }

    /// Current status with details
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    /// Stop all tasks and wait until they are gone
    ///
    /// Cancels the ticker, the reader and any in-flight connect attempt.
    /// When this returns no task touches session state or the published
    /// snapshot any more. Safe to call more than once.
    pub async fn dispose(&self) {
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await
                && err.is_panic()
            {
                tracing::error!(device = %self.device_id, "Session task panicked: {}", err);
            }
        }

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(device = %self.device_id, "Device session disposed");
    }

    /// Whether [`DeviceSession::dispose`] was called
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn request(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Disposed);
        }
        if self.pending.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return Err(Error::Other(format!("Session {} not started", self.device_id)));
        }
        self.tx.send(message).await.map_err(|_| Error::Disposed)
    }
}

/// Run one transport call under a deadline
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(limit)),
    }
}
