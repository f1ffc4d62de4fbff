// # Transport Trait
//
// Defines the request/response side of a device link.
//
// ## Implementations
//
// - JSON over HTTP: `devsession-http` crate
// - Future: SOAP over HTTP, raw TCP line protocols, serial ports
//
// ## Usage
//
// ```rust,ignore
// use devsession_core::traits::{Command, Transport};
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let transport = /* Transport implementation */;
//
//     let credentials = transport.pair().await?;
//     transport.connect(&credentials).await?;
//     let response = transport
//         .send(&credentials, &Command::new("power").with_param("state", "on"))
//         .await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Authentication material for one device link
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token, API key or session cookie
    pub token: Option<String>,
    /// Verification code produced by a pairing handshake
    pub pairing_code: Option<String>,
}

impl Credentials {
    /// Credentials for devices that need no authentication
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Credentials carrying a token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            pairing_code: None,
        }
    }

    /// Attach a pairing verification code
    pub fn with_pairing_code(mut self, code: impl Into<String>) -> Self {
        self.pairing_code = Some(code.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .field("pairing_code", &self.pairing_code.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl From<&crate::config::CredentialsConfig> for Credentials {
    fn from(config: &crate::config::CredentialsConfig) -> Self {
        Self {
            token: Some(config.token.clone()),
            pairing_code: config.pairing_code.clone(),
        }
    }
}

/// A device operation with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Operation name, e.g. `"power"` or `"unlock"`
    pub op: String,
    /// Operation parameters
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Command {
    /// Create a command without parameters
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            params: serde_json::Map::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Parsed result of a command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// Decoded response body (`Null` when the device answers with no body)
    pub body: serde_json::Value,
}

impl CommandResponse {
    /// Wrap a decoded body
    pub fn new(body: serde_json::Value) -> Self {
        Self { body }
    }

    /// Response without a body
    pub fn empty() -> Self {
        Self {
            body: serde_json::Value::Null,
        }
    }
}

/// Trait for transport implementations
///
/// A transport performs exactly one network exchange per call and reports
/// the outcome. Implementations must be thread-safe and usable across async
/// tasks.
///
/// # Failure reporting
///
/// Every failure is returned, never swallowed:
/// - `Error::Connection`: endpoint unreachable or link broken
/// - `Error::Timeout`: the exchange exceeded its deadline
/// - `Error::Protocol`: the answer could not be understood
/// - `Error::Auth`: credentials or pairing rejected
///
/// # No retries
///
/// Transports never retry, back off or sleep. Retry policy is owned by the
/// reconnect supervisor; a transport that retries on its own makes the
/// supervisor's liveness accounting wrong and delays disposal.
///
/// ## Examples
///
/// ✅ **CORRECT**: single exchange, typed failure
/// ```rust,ignore
/// async fn connect(&self, credentials: &Credentials) -> Result<()> {
///     let response = self.client.get(&self.status_url).send().await
///         .map_err(|e| Error::connection(e.to_string()))?;
///     match response.status().as_u16() {
///         200..=299 => Ok(()),
///         401 | 403 => Err(Error::auth("token rejected")),
///         code => Err(Error::protocol(format!("unexpected status {code}"))),
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the pairing handshake and return fresh credentials
    ///
    /// Called by the engine whenever the session holds no credentials, which
    /// happens on first connect without configured credentials and after an
    /// authentication rejection invalidated the session.
    ///
    /// The default implementation is for devices without pairing.
    async fn pair(&self) -> Result<Credentials, crate::Error> {
        Ok(Credentials::anonymous())
    }

    /// Verify that the device is reachable and accepts the credentials
    async fn connect(&self, credentials: &Credentials) -> Result<(), crate::Error>;

    /// Execute one command
    async fn send(
        &self,
        credentials: &Credentials,
        command: &Command,
    ) -> Result<CommandResponse, crate::Error>;

    /// Get the transport name (for logging/debugging)
    fn transport_name(&self) -> &'static str;
}

/// Helper trait for constructing transports from configuration
pub trait TransportFactory: Send + Sync {
    /// Create a Transport instance from configuration
    fn create(
        &self,
        config: &crate::config::TransportConfig,
    ) -> Result<Box<dyn Transport>, crate::Error>;
}
