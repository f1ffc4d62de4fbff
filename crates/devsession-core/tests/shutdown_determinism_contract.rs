//! Architectural Contract Test: Shutdown Determinism
//!
//! This test verifies that dispose() is deterministic and complete.
//!
//! Constraints verified:
//! - dispose() returns only after every task has exited
//! - An in-flight reconnect is abandoned, its outcome never applied
//! - No status changes are published after dispose() returns
//! - A disposed session refuses to start or accept requests
//! - dispose() can be called more than once
//!
//! If this test fails, someone has added:
//! - Detached background tasks
//! - Tasks that ignore cancellation
//! - Connect outcomes applied after shutdown

mod common;

use common::*;
use devsession_core::traits::Command;
use devsession_core::{DeviceStatus, Error, SessionEvent};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn dispose_during_reconnect_freezes_the_snapshot() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, mut event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "secret"));

    let start = Instant::now();
    session.start().await.expect("session starts");
    settle().await;
    assert_eq!(session.current_status(), DeviceStatus::Online);

    // Reconnect attempt that never answers
    transport.set_hang(true);
    advance_to(start, 11.5).await;
    assert_eq!(session.current_status(), DeviceStatus::Reconnecting);
    assert_eq!(transport.connect_count(), 2, "reconnect is in flight");

    let before = session.snapshot();
    let watcher = session.watch_status();

    // Act
    tokio::time::timeout(Duration::from_secs(5), session.dispose())
        .await
        .expect("dispose completes without waiting for the hung attempt");
    assert!(session.is_disposed());

    // Let the would-be deadline, offline threshold and more pass
    transport.set_hang(false);
    tokio::time::sleep(Duration::from_secs(300)).await;
    settle().await;

    assert_eq!(session.snapshot(), before, "no state change after dispose");
    assert_eq!(*watcher.borrow(), before);
    assert_eq!(transport.connect_count(), 2, "no attempt after dispose");
    assert!(!source.push_event(1), "reader was dropped");

    let events = drain_events(&mut event_rx);
    let stopped_at = events
        .iter()
        .position(|e| matches!(e, SessionEvent::Stopped { .. }))
        .expect("stop is notified");
    assert_eq!(stopped_at, events.len() - 1, "nothing is emitted after Stopped");
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_waiter_is_released_on_dispose() {
    let transport = ScriptedTransport::new();
    transport.set_hang(true);
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "secret"));
    let session = std::sync::Arc::new(session);

    session.start().await.expect("session starts");
    settle().await;

    let waiter = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    settle().await;

    session.dispose().await;
    let outcome = waiter.await.expect("waiter task completes");
    assert!(matches!(outcome, Err(Error::Disposed)));
}

#[tokio::test]
async fn start_after_dispose_is_rejected() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, minimal_config(10, 10));

    session.dispose().await;

    tokio_test::assert_err!(session.start().await);
    assert!(matches!(session.connect().await, Err(Error::Disposed)));
    assert!(matches!(
        session.send_command(Command::new("power")).await,
        Err(Error::Disposed)
    ));
    assert_eq!(transport.pair_count(), 0);
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "secret"));

    tokio_test::assert_ok!(session.start().await);
    settle().await;

    session.dispose().await;
    session.dispose().await;
    assert!(session.is_disposed());
}

#[tokio::test]
async fn start_twice_is_an_error() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "secret"));

    tokio_test::assert_ok!(session.start().await);
    tokio_test::assert_err!(session.start().await);

    session.dispose().await;
}

#[tokio::test]
async fn requests_before_start_are_refused() {
    let transport = ScriptedTransport::new();
    let source = ControlledEventSource::new();
    let (session, _event_rx) = build_session(&transport, &source, provisioned_config(10, 10, "secret"));

    tokio_test::assert_err!(session.connect().await);
    assert_eq!(session.current_status(), DeviceStatus::Unknown);
    assert!(session.snapshot().paired);
    assert_eq!(session.device_id(), DEVICE_ID);
    assert_eq!(session.endpoint(), "http://device.test/api");
}
