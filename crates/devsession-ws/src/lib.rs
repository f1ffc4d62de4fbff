//! WebSocket notification event source.
//!
//! Opens a device's notification endpoint and turns each text frame into
//! an inbound item for the session:
//!
//! - a frame whose first character is `"` (e.g. `"Hello"`) is a keep-alive
//!   heartbeat: it proves the link is alive but carries no data
//! - a JSON object becomes an [`Event`], one entry per field; an
//!   `{"event": ..., "data": {...}}` envelope contributes the `data` fields
//! - anything else is reported as malformed and skipped
//!
//! The source never reconnects on its own. When the socket closes the
//! stream ends, and the session supervisor decides when to open a new one.
//!
//! # Example
//!
//! ```rust,ignore
//! use devsession_ws::WebSocketSource;
//!
//! let source = WebSocketSource::new("door-hub", "wss://192.168.1.1/api/v1/notifications")?;
//! let mut stream = source.open(&credentials).await?;
//! while let Some(item) = stream.next().await {
//!     println!("{item:?}");
//! }
//! ```

use async_trait::async_trait;
use devsession_core::config::EventSourceConfig;
use devsession_core::traits::{Credentials, Event, EventSource, EventSourceFactory, Inbound, InboundStream};
use devsession_core::{Error, Result, SessionRegistry};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use url::Url;

/// Buffered frames between the socket reader and the session
const FRAME_BUFFER: usize = 64;

// ── Frame parsing ────────────────────────────────────────────────────

/// Classify one text frame.
pub fn parse_frame(device_id: &str, text: &str) -> Inbound {
    if text.starts_with('"') {
        return Inbound::Heartbeat;
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse WebSocket frame");
            return Inbound::Malformed(text.to_string());
        }
    };

    let payload = match value {
        serde_json::Value::Object(mut map) if map.contains_key("event") && map.contains_key("data") => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    };

    match Event::from_json_object(device_id, payload) {
        Ok(event) => Inbound::Event(event),
        Err(_) => Inbound::Malformed(text.to_string()),
    }
}

// ── WebSocketSource ──────────────────────────────────────────────────

/// Event source reading push notifications from a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketSource {
    device_id: String,
    url: Url,
}

impl WebSocketSource {
    /// Create a source for `url` (`ws://` or `wss://`).
    pub fn new(device_id: impl Into<String>, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("Invalid WebSocket URL '{url}': {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "WebSocket URL must use ws or wss, got: {}",
                url.scheme()
            )));
        }
        Ok(Self {
            device_id: device_id.into(),
            url,
        })
    }

    /// Notification endpoint.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Map a handshake failure onto the core taxonomy.
fn handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                401 | 403 => Error::auth(format!("WebSocket upgrade refused: {status}")),
                500..=599 => Error::connection(format!("WebSocket upgrade failed: {status}")),
                _ => Error::protocol(format!("WebSocket upgrade rejected: {status}")),
            }
        }
        other => Error::connection(format!("WebSocket connect failed: {other}")),
    }
}

#[async_trait]
impl EventSource for WebSocketSource {
    async fn open(&self, credentials: &Credentials) -> Result<InboundStream> {
        tracing::info!(url = %self.url, "Connecting to WebSocket");

        let uri: tungstenite::http::Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::config(e.to_string()))?;

        let mut request = ClientRequestBuilder::new(uri);
        if let Some(token) = &credentials.token {
            request = request.with_header("Authorization", format!("Bearer {token}"));
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;

        tracing::info!(device = %self.device_id, "WebSocket connected");

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let device_id = self.device_id.clone();

        tokio::spawn(async move {
            // The write half must stay alive so tungstenite can answer pings
            let (_write, mut read) = ws_stream.split();

            loop {
                let frame = tokio::select! {
                    _ = tx.closed() => break,
                    frame = read.next() => frame,
                };

                let item = match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => parse_frame(&device_id, text.as_str()),
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite handles pong replies automatically
                        tracing::trace!("WebSocket ping");
                        continue;
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        } else {
                            tracing::info!("WebSocket close frame received (no payload)");
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Inbound::Failed(Error::connection(e.to_string()))).await;
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                        continue;
                    }
                };

                if tx.send(item).await.is_err() {
                    break;
                }
            }

            tracing::debug!(device = %device_id, "WebSocket reader exiting");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn source_name(&self) -> &'static str {
        "websocket"
    }
}

// ── Registration ─────────────────────────────────────────────────────

/// Factory for creating WebSocket sources
pub struct WebSocketFactory;

impl EventSourceFactory for WebSocketFactory {
    fn create(&self, device_id: &str, config: &EventSourceConfig) -> Result<Box<dyn EventSource>> {
        match config {
            EventSourceConfig::Websocket { url } => Ok(Box::new(WebSocketSource::new(device_id, url)?)),
            _ => Err(Error::config("Invalid config for WebSocket source")),
        }
    }
}

/// Register the WebSocket source with a registry
pub fn register(registry: &SessionRegistry) {
    registry.register_source("websocket", Box::new(WebSocketFactory));
}
