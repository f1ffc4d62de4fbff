//! Test doubles and common utilities for session contract tests
//!
//! This module provides minimal test doubles that let a test drive the
//! session from the outside: push inbound items, break the link, make the
//! device unreachable or reject credentials, and count every call.

#![allow(dead_code)]

use devsession_core::config::{CredentialsConfig, EventSourceConfig, SessionConfig, TransportConfig};
use devsession_core::error::{Error, Result};
use devsession_core::traits::{
    Command, CommandResponse, Credentials, Entry, Event, EventListener, EventSource, Inbound, InboundStream,
    Transport,
};
use devsession_core::{DeviceSession, SessionEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEVICE_ID: &str = "test-device";

/// An event source whose current link is fed by the test
pub struct ControlledEventSource {
    /// Sender of the most recently opened link
    current: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    /// Call counter for open()
    open_count: AtomicUsize,
    /// When set, open() fails with this message
    fail_open: Mutex<Option<String>>,
}

impl ControlledEventSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
            open_count: AtomicUsize::new(0),
            fail_open: Mutex::new(None),
        })
    }

    /// Get the number of times open() was called
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Push an item into the current link; false when no link is open
    pub fn push(&self, item: Inbound) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Push an event with `entries` entries (convenience method for tests)
    pub fn push_event(&self, entries: usize) -> bool {
        self.push(Inbound::Event(telegram(entries)))
    }

    /// End the current link's stream
    pub fn close(&self) {
        self.current.lock().unwrap().take();
    }

    /// Make the next open() calls fail
    pub fn fail_open(&self, message: Option<&str>) {
        *self.fail_open.lock().unwrap() = message.map(str::to_string);
    }
}

#[async_trait::async_trait]
impl EventSource for ControlledEventSource {
    async fn open(&self, _credentials: &Credentials) -> Result<InboundStream> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_open.lock().unwrap().clone() {
            return Err(Error::connection(message));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.current.lock().unwrap() = Some(tx);
        Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
    }

    fn source_name(&self) -> &'static str {
        "controlled"
    }
}

/// A transport whose failures are switched on and off by the test
#[derive(Default)]
pub struct ScriptedTransport {
    /// connect() fails with a connection error
    fail_connect: AtomicBool,
    /// pair() is rejected by the device
    reject_pairing: AtomicBool,
    /// connect() and send() never answer
    hang: AtomicBool,
    /// Token the device refuses
    rejected_token: Mutex<Option<String>>,
    /// Token of the last accepted connect
    accepted_token: Mutex<Option<String>>,
    pair_count: AtomicUsize,
    connect_count: AtomicUsize,
    send_count: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_reject_pairing(&self, reject: bool) {
        self.reject_pairing.store(reject, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn reject_token(&self, token: Option<&str>) {
        *self.rejected_token.lock().unwrap() = token.map(str::to_string);
    }

    pub fn accepted_token(&self) -> Option<String> {
        self.accepted_token.lock().unwrap().clone()
    }

    pub fn pair_count(&self) -> usize {
        self.pair_count.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    fn is_rejected(&self, credentials: &Credentials) -> bool {
        let rejected = self.rejected_token.lock().unwrap();
        rejected.is_some() && *rejected == credentials.token
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn pair(&self) -> Result<Credentials> {
        let n = self.pair_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_pairing.load(Ordering::SeqCst) {
            return Err(Error::auth("pairing refused by device"));
        }
        Ok(Credentials::with_token(format!("token-{n}")).with_pairing_code("0000"))
    }

    async fn connect(&self, credentials: &Credentials) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection("device unreachable"));
        }
        if self.is_rejected(credentials) {
            return Err(Error::auth("token expired"));
        }
        *self.accepted_token.lock().unwrap() = credentials.token.clone();
        Ok(())
    }

    async fn send(&self, credentials: &Credentials, command: &Command) -> Result<CommandResponse> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        if self.is_rejected(credentials) {
            return Err(Error::auth("token expired"));
        }
        Ok(CommandResponse::new(serde_json::json!({ "op": command.op, "ok": true })))
    }

    fn transport_name(&self) -> &'static str {
        "scripted"
    }
}

/// A listener that records every callback
#[derive(Default)]
pub struct RecordingListener {
    /// (entries in event, channel) per on_entry call
    entries: Mutex<Vec<(usize, String)>>,
    rejections: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn entries(&self) -> Vec<(usize, String)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn rejection_count(&self) -> usize {
        self.rejections.load(Ordering::SeqCst)
    }
}

impl EventListener for RecordingListener {
    fn on_entry(&self, event: &Event, entry: &Entry) {
        self.entries
            .lock()
            .unwrap()
            .push((event.entries().len(), entry.channel.clone()));
    }

    fn on_rejected(&self, _detail: &str) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
    }
}

/// An event with `n` numbered entries
pub fn telegram(n: usize) -> Event {
    Event::new(
        DEVICE_ID,
        (0..n).map(|i| Entry::new(format!("channel_{i}"), i as u64)).collect(),
    )
}

/// Create a minimal config for testing
///
/// The supervisor checks once per second so paused-time tests can reason
/// in whole seconds.
pub fn minimal_config(window_secs: u64, offline_factor: u32) -> SessionConfig {
    let mut config = SessionConfig::new(
        DEVICE_ID,
        TransportConfig::Http {
            base_url: "http://device.test/api".to_string(),
        },
        EventSourceConfig::Websocket {
            url: "ws://device.test/events".to_string(),
        },
    );
    config.liveness.window_secs = window_secs;
    config.liveness.offline_factor = offline_factor;
    config.liveness.check_interval_secs = 1;
    config
}

/// Same as [`minimal_config`] with pre-provisioned credentials
pub fn provisioned_config(window_secs: u64, offline_factor: u32, token: &str) -> SessionConfig {
    let mut config = minimal_config(window_secs, offline_factor);
    config.credentials = Some(CredentialsConfig {
        token: token.to_string(),
        pairing_code: None,
    });
    config
}

/// Build a session over the given doubles
pub fn build_session(
    transport: &Arc<ScriptedTransport>,
    source: &Arc<ControlledEventSource>,
    config: SessionConfig,
) -> (DeviceSession, mpsc::Receiver<SessionEvent>) {
    let transport: Arc<dyn Transport> = transport.clone();
    let source: Arc<dyn EventSource> = source.clone();
    DeviceSession::new(transport, source, config).expect("session construction succeeds")
}

/// Drain every notification currently queued
pub fn drain_events(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Let spawned tasks run without moving paused time forward
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Sleep until `secs` after `start` (paused-time friendly)
pub async fn advance_to(start: tokio::time::Instant, secs: f64) {
    tokio::time::sleep_until(start + Duration::from_secs_f64(secs)).await;
    settle().await;
}
