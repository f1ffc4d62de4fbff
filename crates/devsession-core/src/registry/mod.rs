//! Plugin-based factory registry
//!
//! The registry allows transports and event sources to be registered
//! dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use devsession_core::registry::SessionRegistry;
//!
//! let registry = SessionRegistry::new();
//! devsession_http::register(&registry);
//! devsession_ws::register(&registry);
//!
//! let transport = registry.create_transport(&config.transport)?;
//! let source = registry.create_source(&config.device_id, &config.source)?;
//! ```
//!
//! ## Registration
//!
//! Implementation crates register themselves during initialization:
//!
//! ```rust,ignore
//! pub fn register(registry: &SessionRegistry) {
//!     registry.register_transport("http", Box::new(HttpTransportFactory));
//! }
//! ```

use crate::config::{EventSourceConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::traits::{EventSource, EventSourceFactory, Transport, TransportFactory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Registry of transport and event source factories
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct SessionRegistry {
    /// Registered transport factories
    transports: RwLock<HashMap<String, Box<dyn TransportFactory>>>,

    /// Registered event source factories
    sources: RwLock<HashMap<String, Box<dyn EventSourceFactory>>>,
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport factory
    ///
    /// # Parameters
    ///
    /// - `name`: Transport type name (e.g., "http")
    /// - `factory`: Factory object for creating transport instances
    pub fn register_transport(&self, name: impl Into<String>, factory: Box<dyn TransportFactory>) {
        let mut transports = self.transports.write().unwrap_or_else(PoisonError::into_inner);
        transports.insert(name.into(), factory);
    }

    /// Register an event source factory
    ///
    /// # Parameters
    ///
    /// - `name`: Event source type name (e.g., "http_poll", "websocket")
    /// - `factory`: Factory object for creating event source instances
    pub fn register_source(&self, name: impl Into<String>, factory: Box<dyn EventSourceFactory>) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        sources.insert(name.into(), factory);
    }

    /// Create a transport from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn Transport>)`: Created transport instance
    /// - `Err(Error)`: If the type is not registered or creation fails
    pub fn create_transport(&self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        let transport_type = config.type_name();
        let transports = self.transports.read().unwrap_or_else(PoisonError::into_inner);

        let factory = transports
            .get(transport_type)
            .ok_or_else(|| Error::config(format!("Unknown transport type: {}", transport_type)))?;

        factory.create(config)
    }

    /// Create an event source from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn EventSource>)`: Created event source instance
    /// - `Err(Error)`: If the type is not registered or creation fails
    pub fn create_source(&self, device_id: &str, config: &EventSourceConfig) -> Result<Box<dyn EventSource>> {
        let source_type = config.type_name();
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);

        let factory = sources
            .get(source_type)
            .ok_or_else(|| Error::config(format!("Unknown event source type: {}", source_type)))?;

        factory.create(device_id, config)
    }

    /// List all registered transport types
    pub fn list_transports(&self) -> Vec<String> {
        let transports = self.transports.read().unwrap_or_else(PoisonError::into_inner);
        transports.keys().cloned().collect()
    }

    /// List all registered event source types
    pub fn list_sources(&self) -> Vec<String> {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        sources.keys().cloned().collect()
    }

    /// Check if a transport type is registered
    pub fn has_transport(&self, name: &str) -> bool {
        let transports = self.transports.read().unwrap_or_else(PoisonError::into_inner);
        transports.contains_key(name)
    }

    /// Check if an event source type is registered
    pub fn has_source(&self, name: &str) -> bool {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        sources.contains_key(name)
    }
}
