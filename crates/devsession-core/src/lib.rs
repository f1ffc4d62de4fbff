// # devsession-core
//
// Core library for supervised device sessions.
//
// ## Architecture Overview
//
// This library provides the reusable part of a device integration: the
// session that stays connected to one device, notices when it goes quiet,
// reconnects, and hands incoming data to the parts of the application that
// care about it.
// - **Transport**: Trait for request/response exchanges (pairing, connect, commands)
// - **EventSource**: Trait for pushed or polled device data
// - **Session**: Credentials and liveness of one link
// - **Supervisor**: Reconnect/offline decisions with backoff
// - **EventRouter**: Listener registry and fan-out
// - **DeviceSession**: Engine that owns the session and applies every transition
// - **SessionRegistry**: Factory registry for transports and event sources
//
// ## Design Principles
//
// 1. **Single writer**: One engine task owns all session state
// 2. **No hidden retries**: Transports report failures; the supervisor decides
// 3. **Monotonic time**: Liveness never depends on wall-clock time
// 4. **Deterministic shutdown**: `dispose()` returns only after every task is gone
// 5. **Library-First**: The daemon is a thin layer over this crate

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod traits;

// Re-export core types for convenience
pub use config::{EmptyEventPolicy, EventSourceConfig, SessionConfig, TransportConfig};
pub use engine::{DeviceSession, SessionEvent, StatusDetail, StatusSnapshot};
pub use error::{Error, ErrorKind, Result};
pub use registry::SessionRegistry;
pub use router::{EventRouter, ListenerId, RouteOutcome};
pub use session::Session;
pub use supervisor::{DeviceStatus, Supervisor};
pub use traits::{Command, CommandResponse, Credentials, Entry, Event, EventListener, EventSource, Inbound, Transport};
