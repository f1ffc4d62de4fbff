//! Core traits for the device-session system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`Transport`]: Request/response exchanges with one device endpoint
//! - [`EventSource`]: Pushed or polled data from the device
//! - [`EventListener`]: Consumers of dispatched events
//! - [`Clock`]: Monotonic time for liveness accounting

pub mod clock;
pub mod event_source;
pub mod listener;
pub mod transport;

pub use clock::{Clock, ManualClock, TokioClock};
pub use event_source::{Entry, Event, EventSource, EventSourceFactory, Inbound, InboundStream};
pub use listener::EventListener;
pub use transport::{Command, CommandResponse, Credentials, Transport, TransportFactory};
