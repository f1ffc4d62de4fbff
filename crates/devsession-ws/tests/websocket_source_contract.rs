//! Contract Test: WebSocket notification source
//!
//! Runs the source against an in-process WebSocket server.
//!
//! Constraints verified:
//! - The upgrade request carries the bearer token
//! - Heartbeats, events and malformed frames arrive in order
//! - A close frame ends the stream (no reconnect inside the source)
//! - A refused upgrade is an authentication error

use devsession_core::ErrorKind;
use devsession_core::traits::{Credentials, EventSource, Inbound};
use devsession_ws::WebSocketSource;
use futures_util::SinkExt;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

#[tokio::test]
async fn frames_are_classified_and_close_ends_the_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen_auth = Arc::new(Mutex::new(None));

    let auth = seen_auth.clone();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let header = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            *auth.lock().unwrap() = header;
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, callback).await.unwrap();

        ws.send(Message::Text("\"Hello\"".into())).await.unwrap();
        ws.send(Message::Text(r#"{"event":"access.door.update","data":{"door_1":"open"}}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Text("{garbage".into())).await.unwrap();
        ws.send(Message::Text(r#"{"battery":87,"rssi":-60}"#.into())).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let source = WebSocketSource::new("hub", &format!("ws://{addr}/api/v1/notifications")).unwrap();
    let mut stream = source
        .open(&Credentials::with_token("s3cret"))
        .await
        .expect("upgrade succeeds");

    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item);
    }

    assert_eq!(items.len(), 4, "stream ends after the close frame: {items:?}");
    assert!(matches!(items[0], Inbound::Heartbeat));
    assert!(matches!(&items[1], Inbound::Event(e) if e.entries()[0].channel == "door_1"));
    assert!(matches!(items[2], Inbound::Malformed(_)));
    assert!(matches!(&items[3], Inbound::Event(e) if e.entries().len() == 2));

    assert_eq!(seen_auth.lock().unwrap().as_deref(), Some("Bearer s3cret"));
}

#[tokio::test]
async fn refused_upgrade_is_an_auth_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let callback = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
            let mut refused = ErrorResponse::new(None);
            *refused.status_mut() = StatusCode::UNAUTHORIZED;
            Err(refused)
        };
        let _ = tokio_tungstenite::accept_hdr_async(socket, callback).await;
    });

    let source = WebSocketSource::new("hub", &format!("ws://{addr}/notifications")).unwrap();
    let err = source
        .open(&Credentials::with_token("expired"))
        .await
        .err()
        .expect("upgrade is refused");
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = WebSocketSource::new("hub", &format!("ws://{addr}/notifications")).unwrap();
    let err = source.open(&Credentials::anonymous()).await.err().expect("connect fails");
    assert_eq!(err.kind(), ErrorKind::Transport);
}
