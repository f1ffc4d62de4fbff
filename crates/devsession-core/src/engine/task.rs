//! Engine task: the single writer of session state

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{SessionEvent, StatusDetail, StatusSnapshot, with_timeout};
use crate::error::{Error, ErrorKind, Result};
use crate::router::{EventRouter, RouteOutcome};
use crate::session::Session;
use crate::supervisor::{Decision, DeviceStatus, Observation, Supervisor};
use crate::traits::{Clock, Credentials, EventSource, Inbound, InboundStream, Transport};

/// Longest raw frame excerpt written to the log
const MALFORMED_LOG_LIMIT: usize = 256;

/// Messages on the engine queue
pub(crate) enum Message {
    /// Supervisor period elapsed
    Tick,
    /// Item from the reader of link `generation`
    Inbound { generation: u64, item: Inbound },
    /// Stream of link `generation` ended
    LinkClosed { generation: u64 },
    /// Connect job `job` finished
    ConnectFinished {
        job: u64,
        result: std::result::Result<Link, ConnectFailure>,
    },
    /// Explicit connect / wake request
    Connect { reply: oneshot::Sender<Result<()>> },
    /// Credentials snapshot for a command
    Credentials { reply: oneshot::Sender<Result<Credentials>> },
    /// A command ran on the caller's task
    CommandFinished {
        outcome: std::result::Result<(), (ErrorKind, String)>,
    },
}

/// A freshly established link
pub(crate) struct Link {
    credentials: Credentials,
    stream: InboundStream,
}

/// Why a connect job failed
pub(crate) struct ConnectFailure {
    error: Error,
    /// The failure happened in or after a pairing handshake of this job
    paired: bool,
}

struct ConnectJob {
    id: u64,
    attempt: u32,
    handle: JoinHandle<()>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

struct Reader {
    generation: u64,
    handle: JoinHandle<()>,
}

pub(crate) struct EngineTask {
    device_id: String,
    session: Session,
    supervisor: Supervisor,
    router: Arc<EventRouter>,
    transport: Arc<dyn Transport>,
    source: Arc<dyn EventSource>,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<Message>,
    events: mpsc::Sender<SessionEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    request_timeout: Duration,
    cancel: CancellationToken,
    status: DeviceStatus,
    detail: StatusDetail,
    message: Option<String>,
    reader: Option<Reader>,
    next_generation: u64,
    job: Option<ConnectJob>,
    next_job: u64,
    link_lost: bool,
    /// Credential rejections since data last confirmed the credentials
    auth_strikes: u32,
}

impl EngineTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device_id: String,
        session: Session,
        supervisor: Supervisor,
        router: Arc<EventRouter>,
        transport: Arc<dyn Transport>,
        source: Arc<dyn EventSource>,
        clock: Arc<dyn Clock>,
        tx: mpsc::Sender<Message>,
        events: mpsc::Sender<SessionEvent>,
        status_tx: watch::Sender<StatusSnapshot>,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device_id,
            session,
            supervisor,
            router,
            transport,
            source,
            clock,
            tx,
            events,
            status_tx,
            request_timeout,
            cancel,
            status: DeviceStatus::Unknown,
            detail: StatusDetail::None,
            message: None,
            reader: None,
            next_generation: 0,
            job: None,
            next_job: 0,
            link_lost: false,
            auth_strikes: 0,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        self.emit(SessionEvent::Started {
            device_id: self.device_id.clone(),
        });
        self.start_connect(0);
        self.publish();

        let cancel = self.cancel.clone();
        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break "Disposed",
                message = rx.recv() => match message {
                    Some(message) => {
                        self.handle(message);
                        self.publish();
                    }
                    None => break "Queue closed",
                },
            }
        };

        self.shutdown().await;
        self.emit(SessionEvent::Stopped {
            reason: reason.to_string(),
        });
        info!(device = %self.device_id, reason, "Device session stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Tick => self.on_tick(),
            Message::Inbound { generation, item } => {
                if self.is_current(generation) {
                    self.on_inbound(item);
                } else {
                    trace!(device = %self.device_id, generation, "Dropping item from superseded link");
                }
            }
            Message::LinkClosed { generation } => {
                if self.is_current(generation) {
                    self.on_link_closed();
                }
            }
            Message::ConnectFinished { job, result } => self.on_connect_finished(job, result),
            Message::Connect { reply } => self.on_connect_request(reply),
            Message::Credentials { reply } => {
                let credentials = self.session.credentials().cloned().ok_or(Error::NotConnected);
                let _ = reply.send(credentials);
            }
            Message::CommandFinished { outcome } => self.on_command_finished(outcome),
        }
    }

    fn on_tick(&mut self) {
        let now = self.clock.now();
        let observation = Observation {
            status: self.status,
            elapsed: self.session.elapsed_since_alive(),
            in_flight: self.job.is_some(),
            link_lost: self.link_lost,
        };

        match self.supervisor.evaluate(now, observation) {
            Decision::Idle => {}
            Decision::Reconnect { attempt } => {
                let message = if self.link_lost {
                    "Event link closed".to_string()
                } else {
                    format!("No data received for {}s", observation.elapsed.as_secs())
                };
                if self.status == DeviceStatus::Offline {
                    self.set_detail(StatusDetail::CommunicationError, message);
                } else {
                    self.set_status(DeviceStatus::Reconnecting, StatusDetail::CommunicationError, Some(message));
                }
                info!(device = %self.device_id, attempt, "Attempting reconnect");
                self.emit(SessionEvent::ReconnectStarted { attempt });
                self.start_connect(attempt);
            }
            Decision::GoOffline => {
                let message = format!(
                    "No data received for {}s (limit {}s)",
                    observation.elapsed.as_secs(),
                    self.supervisor.offline_after().as_secs()
                );
                self.set_status(DeviceStatus::Offline, StatusDetail::CommunicationError, Some(message));
                self.session.reset_liveness();
            }
        }
    }

    fn on_inbound(&mut self, item: Inbound) {
        match item {
            Inbound::Event(event) => match self.router.route(&event, &mut self.session) {
                RouteOutcome::Dispatched { entries, listeners, .. } => {
                    trace!(device = %self.device_id, entries, listeners, "Event dispatched");
                    self.emit(SessionEvent::EventDispatched {
                        device_id: event.device_id().to_string(),
                        entries,
                        listeners,
                    });
                    self.auth_strikes = 0;
                    self.on_alive();
                }
                RouteOutcome::Rejected { reason } => {
                    self.emit(SessionEvent::EventRejected { reason: reason.clone() });
                    self.set_detail(StatusDetail::ProtocolError, reason);
                }
            },
            Inbound::Heartbeat => {
                trace!(device = %self.device_id, "Heartbeat");
                self.session.mark_alive();
                self.auth_strikes = 0;
                self.on_alive();
            }
            Inbound::Malformed(raw) => {
                let excerpt: String = raw.chars().take(MALFORMED_LOG_LIMIT).collect();
                warn!(device = %self.device_id, frame = %excerpt, "Discarding malformed frame");
            }
            Inbound::Failed(err) => {
                warn!(device = %self.device_id, error = %err, "Event source read failed");
                if err.is_auth() {
                    self.on_auth_rejected(err.to_string());
                } else {
                    self.set_detail(err.kind().into(), err.to_string());
                }
            }
        }
    }

    fn on_link_closed(&mut self) {
        info!(device = %self.device_id, "Event link closed");
        self.reader = None;
        self.link_lost = true;
        self.set_detail(StatusDetail::CommunicationError, "Event link closed".to_string());
    }

    fn on_connect_request(&mut self, reply: oneshot::Sender<Result<()>>) {
        self.supervisor.resume();
        self.auth_strikes = 0;
        if self.job.is_none() {
            self.start_connect(0);
        }
        match self.job.as_mut() {
            Some(job) => job.waiters.push(reply),
            None => {
                let _ = reply.send(Err(Error::Disposed));
            }
        }
    }

    fn on_connect_finished(&mut self, id: u64, result: std::result::Result<Link, ConnectFailure>) {
        let job = match self.job.take() {
            Some(job) if job.id == id => job,
            other => {
                self.job = other;
                debug!(device = %self.device_id, job = id, "Ignoring outcome of a cancelled connect job");
                return;
            }
        };

        match result {
            Ok(link) => {
                self.session.store_credentials(link.credentials);
                self.install_reader(link.stream);
                self.session.mark_alive();
                self.on_alive();
                info!(device = %self.device_id, endpoint = self.session.endpoint(), "Connected");
                for waiter in job.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(failure) => {
                let message = failure.error.to_string();
                let failure_text = message.clone();
                warn!(
                    device = %self.device_id,
                    attempt = job.attempt,
                    error = %message,
                    "Connect attempt failed"
                );
                self.supervisor.on_attempt_failed(self.clock.now());
                self.emit(SessionEvent::ReconnectFailed {
                    attempt: job.attempt,
                    error: message.clone(),
                });

                if failure.error.is_auth() {
                    if failure.paired {
                        self.supervisor.suspend();
                        self.set_status(
                            DeviceStatus::Offline,
                            StatusDetail::AuthError,
                            Some(format!("Pairing rejected: {message}")),
                        );
                    } else {
                        self.on_auth_rejected(message);
                    }
                } else {
                    self.set_detail(failure.error.kind().into(), message);
                }

                let mut waiters = job.waiters.into_iter();
                if let Some(first) = waiters.next() {
                    let _ = first.send(Err(failure.error));
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::Other(format!("Connect failed: {failure_text}"))));
                }
            }
        }
    }

    fn on_command_finished(&mut self, outcome: std::result::Result<(), (ErrorKind, String)>) {
        match outcome {
            Ok(()) => {
                self.session.mark_alive();
                self.auth_strikes = 0;
                self.on_alive();
            }
            Err((ErrorKind::Auth, message)) => self.on_auth_rejected(message),
            Err((kind, message)) => self.set_detail(kind.into(), message),
        }
    }

    /// Credentials were refused: drop them and pair again right away.
    ///
    /// A second refusal before any data confirmed the new credentials means
    /// freshly paired credentials were refused too, so automatic attempts
    /// stop until `connect()`.
    fn on_auth_rejected(&mut self, message: String) {
        self.session.invalidate();
        self.auth_strikes = self.auth_strikes.saturating_add(1);
        if self.auth_strikes > 1 {
            if !self.supervisor.is_suspended() {
                warn!(device = %self.device_id, error = %message, "Freshly paired credentials rejected, suspending");
                self.supervisor.suspend();
            }
            self.set_status(
                DeviceStatus::Offline,
                StatusDetail::AuthError,
                Some(format!("Credentials rejected after re-pairing: {message}")),
            );
            return;
        }

        warn!(device = %self.device_id, error = %message, "Credentials rejected, re-pairing");
        self.set_detail(StatusDetail::AuthError, message);
        if self.job.is_none() && !self.supervisor.is_suspended() {
            let attempt = self.supervisor.failures() + 1;
            self.emit(SessionEvent::ReconnectStarted { attempt });
            self.start_connect(attempt);
        }
    }

    /// Data proved the device alive
    fn on_alive(&mut self) {
        self.link_lost = self.reader.is_none();
        self.supervisor.on_recovered();
        if self.status != DeviceStatus::Online || self.detail != StatusDetail::None {
            self.set_status(DeviceStatus::Online, StatusDetail::None, None);
        }
    }

    fn start_connect(&mut self, attempt: u32) {
        if self.job.is_some() {
            return;
        }

        self.next_job += 1;
        let id = self.next_job;
        let transport = self.transport.clone();
        let source = self.source.clone();
        let credentials = self.session.credentials().cloned();
        let timeout = self.request_timeout;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = establish(transport, source, credentials, timeout) => result,
            };
            let _ = tx.send(Message::ConnectFinished { job: id, result }).await;
        });

        self.job = Some(ConnectJob {
            id,
            attempt,
            handle,
            waiters: Vec::new(),
        });
    }

    fn install_reader(&mut self, mut stream: InboundStream) {
        if let Some(old) = self.reader.take() {
            old.handle.abort();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = stream.next() => match item {
                        Some(item) => {
                            if tx.send(Message::Inbound { generation, item }).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = tx.send(Message::LinkClosed { generation }).await;
                            break;
                        }
                    },
                }
            }
        });

        self.reader = Some(Reader { generation, handle });
        self.link_lost = false;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.reader.as_ref().is_some_and(|r| r.generation == generation)
    }

    fn set_status(&mut self, status: DeviceStatus, detail: StatusDetail, message: Option<String>) {
        let from = self.status;
        self.status = status;
        self.detail = detail;
        self.message = message.clone();

        if from != status {
            info!(device = %self.device_id, %from, to = %status, ?detail, "Status changed");
            self.emit(SessionEvent::StatusChanged {
                from,
                to: status,
                detail,
                message,
            });
        }
    }

    fn set_detail(&mut self, detail: StatusDetail, message: String) {
        self.detail = detail;
        self.message = Some(message);
    }

    fn publish(&self) {
        let snapshot = StatusSnapshot {
            status: self.status,
            detail: self.detail,
            message: self.message.clone(),
            reconnect_failures: self.supervisor.failures(),
            paired: self.session.is_paired(),
            last_alive: self.session.last_alive(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Session event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn shutdown(&mut self) {
        if let Some(job) = self.job.take() {
            job.handle.abort();
            let _ = job.handle.await;
            for waiter in job.waiters {
                let _ = waiter.send(Err(Error::Disposed));
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.handle.abort();
            let _ = reader.handle.await;
        }
    }
}

/// Pair if needed, verify the link, open the event stream
///
/// Runs off the engine task and touches no shared state; the engine applies
/// the result in one step.
async fn establish(
    transport: Arc<dyn Transport>,
    source: Arc<dyn EventSource>,
    credentials: Option<Credentials>,
    timeout: Duration,
) -> std::result::Result<Link, ConnectFailure> {
    let (credentials, paired) = match credentials {
        Some(credentials) => (credentials, false),
        None => {
            debug!(transport = transport.transport_name(), "Pairing");
            let credentials = with_timeout(timeout, transport.pair())
                .await
                .map_err(|error| ConnectFailure { error, paired: true })?;
            (credentials, true)
        }
    };

    with_timeout(timeout, transport.connect(&credentials))
        .await
        .map_err(|error| ConnectFailure { error, paired })?;

    let stream = with_timeout(timeout, source.open(&credentials))
        .await
        .map_err(|error| ConnectFailure { error, paired })?;

    Ok(Link { credentials, stream })
}
