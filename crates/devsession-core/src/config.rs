//! Configuration types for the device-session system
//!
//! This module defines all configuration structures used throughout the crate.
//! Parsing configuration from files or the environment is left to the host;
//! this crate only defines the record and validates it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity of the device this session talks to
    pub device_id: String,

    /// Request/response transport configuration
    pub transport: TransportConfig,

    /// Push or poll event source configuration
    pub source: EventSourceConfig,

    /// Pre-provisioned credentials (pairing is performed when absent)
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,

    /// Liveness thresholds
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SessionConfig {
    /// Create a configuration with default thresholds
    pub fn new(
        device_id: impl Into<String>,
        transport: TransportConfig,
        source: EventSourceConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            source,
            credentials: None,
            liveness: LivenessConfig::default(),
            reconnect: ReconnectConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.device_id.trim().is_empty() {
            return Err(crate::Error::config("Device id cannot be empty"));
        }

        self.transport.validate()?;
        self.source.validate()?;
        self.liveness.validate()?;
        self.reconnect.validate()?;
        self.engine.validate()?;

        if let Some(credentials) = &self.credentials
            && credentials.token.is_empty()
        {
            return Err(crate::Error::config(
                "Configured credentials must carry a non-empty token",
            ));
        }

        Ok(())
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// JSON-over-HTTP device API
    Http {
        /// Base URL, e.g. `http://192.168.1.20:8080/api`
        base_url: String,
    },

    /// Custom transport
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl TransportConfig {
    /// Validate the transport configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            TransportConfig::Http { base_url } => validate_url("HTTP transport", base_url, &["http://", "https://"]),
            TransportConfig::Custom { factory, config } => validate_custom("transport", factory, config),
        }
    }

    /// Get the transport type name
    pub fn type_name(&self) -> &str {
        match self {
            TransportConfig::Http { .. } => "http",
            TransportConfig::Custom { factory, .. } => factory,
        }
    }

    /// Address the session talks to: the base URL, or the factory name of a custom transport
    pub fn endpoint(&self) -> &str {
        match self {
            TransportConfig::Http { base_url } => base_url,
            TransportConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Event source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventSourceConfig {
    /// Periodically fetch device state over HTTP
    HttpPoll {
        /// URL returning the current device state as JSON
        url: String,
        /// Poll interval in seconds
        interval_secs: u64,
    },

    /// Push notifications over a WebSocket
    Websocket {
        /// Notification endpoint, e.g. `wss://host/api/v1/notifications`
        url: String,
    },

    /// Custom event source
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl EventSourceConfig {
    /// Validate the event source configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            EventSourceConfig::HttpPoll { url, interval_secs } => {
                validate_url("HTTP poll source", url, &["http://", "https://"])?;
                if *interval_secs == 0 {
                    return Err(crate::Error::config("HTTP poll interval must be > 0"));
                }
                Ok(())
            }
            EventSourceConfig::Websocket { url } => validate_url("WebSocket source", url, &["ws://", "wss://"]),
            EventSourceConfig::Custom { factory, config } => validate_custom("event source", factory, config),
        }
    }

    /// Get the event source type name
    pub fn type_name(&self) -> &str {
        match self {
            EventSourceConfig::HttpPoll { .. } => "http_poll",
            EventSourceConfig::Websocket { .. } => "websocket",
            EventSourceConfig::Custom { factory, .. } => factory,
        }
    }
}

fn validate_url(what: &str, url: &str, schemes: &[&str]) -> Result<(), crate::Error> {
    if url.is_empty() {
        return Err(crate::Error::config(format!("{what} URL cannot be empty")));
    }
    if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(crate::Error::config(format!(
            "{what} URL must start with one of {schemes:?}, got: {url}"
        )));
    }
    Ok(())
}

fn validate_custom(what: &str, factory: &str, config: &serde_json::Value) -> Result<(), crate::Error> {
    if factory.is_empty() {
        return Err(crate::Error::config(format!("Custom {what} factory cannot be empty")));
    }
    if config.is_null() {
        return Err(crate::Error::config(format!("Custom {what} config cannot be null")));
    }
    Ok(())
}

/// Pre-provisioned credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Bearer token or API key
    pub token: String,

    /// Verification code from a previous pairing, if the device uses one
    #[serde(default)]
    pub pairing_code: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("token", &"<REDACTED>")
            .field("pairing_code", &self.pairing_code.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

/// Liveness thresholds
///
/// A reconnect is attempted once no data arrived for `window_secs`. The
/// device is declared offline after `window_secs * offline_factor`; the
/// offline threshold is always derived, never configured on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Reconnect threshold in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Multiple of the window after which the device is offline
    #[serde(default = "default_offline_factor")]
    pub offline_factor: u32,

    /// Supervisor period in seconds
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl LivenessConfig {
    /// Reconnect threshold
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Offline threshold (`window * offline_factor`)
    pub fn offline_after(&self) -> Duration {
        self.window().saturating_mul(self.offline_factor)
    }

    /// Supervisor period
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.window_secs == 0 {
            return Err(crate::Error::config("Liveness window must be > 0"));
        }
        if self.offline_factor < 2 {
            return Err(crate::Error::config(format!(
                "Offline factor must be at least 2, got: {}",
                self.offline_factor
            )));
        }
        if self.window().checked_mul(self.offline_factor).is_none() {
            return Err(crate::Error::config(format!(
                "Offline threshold overflows: {}s window x {}",
                self.window_secs, self.offline_factor
            )));
        }
        if self.check_interval_secs == 0 {
            return Err(crate::Error::config("Supervisor check interval must be > 0"));
        }
        if self.check_interval_secs > self.window_secs {
            return Err(crate::Error::config(format!(
                "Supervisor check interval ({}s) must not exceed the liveness window ({}s)",
                self.check_interval_secs, self.window_secs
            )));
        }
        Ok(())
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            offline_factor: default_offline_factor(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_offline_factor() -> u32 {
    10
}

fn default_check_interval_secs() -> u64 {
    5
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on backoff delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl ReconnectConfig {
    /// Delay after the first failed attempt
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Upper bound on backoff delay
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(crate::Error::config(format!(
                "Reconnect max delay ({}ms) must be >= initial delay ({}ms)",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// What to do with an event that decoded fine but carries no entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyEventPolicy {
    /// Treat as a protocol error: no liveness refresh, error detail set
    #[default]
    Reject,
    /// Treat as a keep-alive: refresh liveness, dispatch nothing
    Accept,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for every single transport call (in seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Capacity of the internal queue and of the notification channel
    ///
    /// When the notification channel is full, notifications are dropped
    /// (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Handling of decoded events without entries
    #[serde(default)]
    pub empty_event_policy: EmptyEventPolicy,

    /// Additional metadata attached to log lines
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EngineConfig {
    /// Deadline for every single transport call
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.request_timeout_secs == 0 {
            return Err(crate::Error::config("Request timeout must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            empty_event_policy: EmptyEventPolicy::default(),
            metadata: HashMap::new(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_event_channel_capacity() -> usize {
    1000
}
