//! Architectural Contract Test: Authentication and Commands
//!
//! This test verifies credential handling and command execution.
//!
//! Constraints verified:
//! - Rejected credentials are dropped and pairing starts right away
//! - A rejected pairing parks the session offline until connect() is called
//! - A source that refuses freshly paired credentials does not cause a pairing loop
//! - Commands use the current credentials and refresh liveness
//! - Commands are bounded by the request timeout
//! - Invalid configuration is refused before any task or I/O exists
//!
//! If this test fails, someone has added:
//! - Retry loops that hammer a device refusing to pair
//! - Commands that can block forever
//! - Sessions that start with unusable configuration

mod common;

use common::*;
use devsession_core::traits::{Command, EventSource, Inbound, Transport};
use devsession_core::{DeviceSession, DeviceStatus, Error, ErrorKind, SessionEvent, StatusDetail};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn rejected_token_triggers_immediate_repairing() {
    let transport = ScriptedTransport::new();
    transport.reject_token(Some("stale"));
    let source = ControlledEventSource::new();
    let (session, mut event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "stale"));

    session.start().await.expect("session starts");
    settle().await;

    assert_eq!(transport.pair_count(), 1, "paired once, without waiting for a check");
    assert_eq!(transport.accepted_token().as_deref(), Some("token-1"));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, DeviceStatus::Online);
    assert!(snapshot.paired);
    assert_eq!(snapshot.reconnect_failures, 0);

    let events = drain_events(&mut event_rx);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::ReconnectFailed { .. })));

    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_pairing_suspends_until_connect() {
    let transport = ScriptedTransport::new();
    transport.set_reject_pairing(true);
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, minimal_config(10, 10));

    let start = Instant::now();
    session.start().await.expect("session starts");
    settle().await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, DeviceStatus::Offline);
    assert_eq!(snapshot.detail, StatusDetail::AuthError);
    assert!(!snapshot.paired);

    // No automatic attempts while suspended
    advance_to(start, 120.5).await;
    assert_eq!(transport.pair_count(), 1);
    assert_eq!(transport.connect_count(), 0);
    assert_eq!(session.current_status(), DeviceStatus::Offline);

    // User fixed the device; connect() is the wake signal
    transport.set_reject_pairing(false);
    tokio_test::assert_ok!(session.connect().await);
    assert_eq!(transport.pair_count(), 2);
    assert_eq!(session.current_status(), DeviceStatus::Online);

    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn source_refusing_fresh_credentials_does_not_loop() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, mut event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "secret"));

    let start = Instant::now();
    session.start().await.expect("session starts");
    settle().await;
    assert_eq!(session.current_status(), DeviceStatus::Online);

    // The notification endpoint refuses every token, once per second
    for second in 1..=200 {
        advance_to(start, second as f64).await;
        source.push(Inbound::Failed(Error::auth("notification token refused")));
        settle().await;
    }

    // First refusal re-pairs once; the refusal of the new token suspends
    assert_eq!(transport.pair_count(), 1);
    assert_eq!(transport.connect_count(), 2);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, DeviceStatus::Offline);
    assert_eq!(snapshot.detail, StatusDetail::AuthError);
    assert!(!snapshot.paired);

    let offline_transitions = drain_events(&mut event_rx)
        .iter()
        .filter(|e| matches!(e, SessionEvent::StatusChanged { to: DeviceStatus::Offline, .. }))
        .count();
    assert_eq!(offline_transitions, 1);

    // connect() is the wake signal
    tokio_test::assert_ok!(session.connect().await);
    assert_eq!(transport.pair_count(), 2);
    assert_eq!(session.current_status(), DeviceStatus::Online);

    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_reports_the_failure() {
    let transport = ScriptedTransport::new();
    transport.set_reject_pairing(true);
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, minimal_config(10, 10));

    session.start().await.expect("session starts");
    settle().await;

    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(session.snapshot().detail, StatusDetail::AuthError);

    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn command_success_refreshes_liveness() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "secret"));

    let start = Instant::now();
    session.start().await.expect("session starts");
    settle().await;

    advance_to(start, 8.0).await;
    let response = session
        .send_command(Command::new("power").with_param("state", "on"))
        .await
        .expect("command succeeds");
    assert_eq!(response.body["op"], "power");
    settle().await;

    // Fresh from the command at 8s: no reconnect at 11s
    advance_to(start, 15.5).await;
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(transport.send_count(), 1);
    assert_eq!(session.current_status(), DeviceStatus::Online);

    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn command_is_bounded_by_request_timeout() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let mut config = provisioned_config(60, 10, "secret");
    config.engine.request_timeout_secs = 3;
    let (session, _event_rx) = build_session(&transport, &source, config);

    session.start().await.expect("session starts");
    settle().await;

    transport.set_hang(true);
    let started = Instant::now();
    let err = session.send_command(Command::new("status")).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(3)));
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    settle().await;
    assert_eq!(session.snapshot().detail, StatusDetail::CommunicationError);

    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn command_rejected_for_auth_repairs() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, minimal_config(10, 10));

    session.start().await.expect("session starts");
    settle().await;
    assert_eq!(transport.accepted_token().as_deref(), Some("token-1"));

    transport.reject_token(Some("token-1"));
    let err = session.send_command(Command::new("unlock")).await.unwrap_err();
    assert!(err.is_auth());
    settle().await;

    assert_eq!(transport.pair_count(), 2);
    assert_eq!(transport.accepted_token().as_deref(), Some("token-2"));
    tokio_test::assert_ok!(session.send_command(Command::new("unlock")).await);

    session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn command_without_credentials_is_not_connected() {
    let transport = ScriptedTransport::new();
    transport.set_hang(true);
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, minimal_config(10, 10));

    session.start().await.expect("session starts");
    settle().await;

    let err = session.send_command(Command::new("status")).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert_eq!(transport.send_count(), 0);

    session.dispose().await;
}

#[test]
fn invalid_configuration_is_refused_up_front() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();

    let mut bad_factor = minimal_config(10, 10);
    bad_factor.liveness.offline_factor = 1;
    let mut no_window = minimal_config(10, 10);
    no_window.liveness.window_secs = 0;
    let mut no_device = minimal_config(10, 10);
    no_device.device_id = "  ".to_string();
    let slow_check = {
        let mut config = minimal_config(10, 10);
        config.liveness.check_interval_secs = 30;
        config
    };

    for config in [bad_factor, no_window, no_device, slow_check] {
        let t: Arc<dyn Transport> = transport.clone();
        let s: Arc<dyn EventSource> = source.clone();
        let err = DeviceSession::new(t, s, config).err().expect("configuration is refused");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    assert_eq!(transport.pair_count(), 0);
    assert_eq!(transport.connect_count(), 0);
    assert_eq!(source.open_count(), 0);
}
