// # Event Source Trait
//
// Defines the interface for receiving asynchronous data from a device:
// pushed notifications, streamed telegrams, or poll results.
//
// ## Implementations
//
// - HTTP polling: `devsession-http` crate
// - WebSocket notifications: `devsession-ws` crate
//
// ## Usage
//
// ```rust,ignore
// use devsession_core::traits::{EventSource, Inbound};
// use tokio_stream::StreamExt;
//
// let mut stream = source.open(&credentials).await?;
// while let Some(item) = stream.next().await {
//     match item {
//         Inbound::Event(event) => println!("{} entries", event.entries().len()),
//         Inbound::Heartbeat => {}
//         Inbound::Malformed(raw) => eprintln!("unparseable: {raw}"),
//         Inbound::Failed(err) => eprintln!("poll failed: {err}"),
//     }
// }
// // stream ended: link closed
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// One measurement or state value inside an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Channel the value belongs to, e.g. `"power_delivered"` or `"door_1/lock"`
    pub channel: String,
    /// Decoded value
    pub value: serde_json::Value,
}

impl Entry {
    /// Create an entry
    pub fn new(channel: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            channel: channel.into(),
            value: value.into(),
        }
    }
}

/// An immutable decoded payload from one device
///
/// Constructed by the transport/parse layer, consumed once by the router.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    device_id: String,
    entries: Vec<Entry>,
    received_at: chrono::DateTime<chrono::Utc>,
}

impl Event {
    /// Create an event
    ///
    /// This constructor is public for use in:
    /// - `EventSource` implementations
    /// - Contract tests within devsession-core
    /// - External testing code
    pub fn new(device_id: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self {
            device_id: device_id.into(),
            entries,
            received_at: chrono::Utc::now(),
        }
    }

    /// Decode a flat JSON object into an event, one entry per field
    ///
    /// Non-object payloads are a protocol error. An empty object yields an
    /// event without entries; whether that counts as data is the router's
    /// decision, not the parser's.
    pub fn from_json_object(
        device_id: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Self, crate::Error> {
        match value {
            serde_json::Value::Object(map) => Ok(Self::new(
                device_id,
                map.into_iter().map(|(channel, value)| Entry { channel, value }).collect(),
            )),
            other => Err(crate::Error::protocol(format!(
                "expected a JSON object, got: {other}"
            ))),
        }
    }

    /// Device/channel identity this event is keyed by
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Decoded entries
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Whether the payload carries no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wall-clock receive time (for display only; liveness uses the monotonic clock)
    pub fn received_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.received_at
    }
}

/// Items yielded by an event source stream
#[derive(Debug)]
pub enum Inbound {
    /// A decoded event
    Event(Event),
    /// A keep-alive frame: proves liveness, carries no data
    Heartbeat,
    /// A frame that could not be decoded (raw text for logging)
    Malformed(String),
    /// A single poll or read failed; the stream continues
    Failed(crate::Error),
}

/// Boxed stream of inbound items; stream end means the link closed
pub type InboundStream = Pin<Box<dyn Stream<Item = Inbound> + Send + 'static>>;

/// Trait for event source implementations
///
/// # Task Spawning Rules
///
/// If you spawn tasks in your implementation:
/// - Task MUST stop when the returned stream is dropped (send failure)
/// - Task MUST NOT retry a broken link; end the stream instead and let the
///   supervisor decide when to reopen
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open the link and return the stream of inbound items
    ///
    /// Returns an error when the link cannot be established at all.
    async fn open(&self, credentials: &super::Credentials) -> Result<InboundStream, crate::Error>;

    /// Get the event source name (for logging/debugging)
    fn source_name(&self) -> &'static str;
}

/// Helper trait for constructing event sources from configuration
pub trait EventSourceFactory: Send + Sync {
    /// Create an EventSource instance from configuration
    ///
    /// `device_id` keys the events the source produces.
    fn create(
        &self,
        device_id: &str,
        config: &crate::config::EventSourceConfig,
    ) -> Result<Box<dyn EventSource>, crate::Error>;
}
