// # devsessiond - Device Session Daemon
//
// This daemon is a THIN integration layer over devsession-core:
// - No session, liveness or reconnect logic lives here
// - Configuration is via environment variables only
//
// The devsessiond daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering transports and event sources
// 4. Hosting one DeviceSession until SIGTERM/SIGINT
//
// ## Configuration
//
// ### Device
// - `DEVSESSION_DEVICE_ID`: Device identity (required)
// - `DEVSESSION_TRANSPORT_URL`: Base URL of the device HTTP API (required)
// - `DEVSESSION_TOKEN`: Pre-provisioned token (optional, pairs when absent)
//
// ### Event Source
// - `DEVSESSION_SOURCE_TYPE`: Type of event source (websocket, http_poll)
// - `DEVSESSION_SOURCE_URL`: Notification or state URL (required)
// - `DEVSESSION_POLL_INTERVAL`: Poll interval in seconds (for http_poll)
//
// ### Liveness
// - `DEVSESSION_WINDOW_SECS`: Reconnect after this many quiet seconds
// - `DEVSESSION_OFFLINE_FACTOR`: Offline after window * factor
// - `DEVSESSION_CHECK_INTERVAL`: Supervisor period in seconds
//
// ### Logging
// - `DEVSESSION_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export DEVSESSION_DEVICE_ID=door-hub
// export DEVSESSION_TRANSPORT_URL=https://192.168.1.1/api/v1
// export DEVSESSION_SOURCE_TYPE=websocket
// export DEVSESSION_SOURCE_URL=wss://192.168.1.1/api/v1/notifications
// export DEVSESSION_TOKEN=your_token
//
// devsessiond
// ```

use anyhow::{Context, Result};
use devsession_core::config::{CredentialsConfig, EventSourceConfig, SessionConfig, TransportConfig};
use devsession_core::traits::{Entry, Event, EventListener};
use devsession_core::{DeviceSession, SessionEvent, SessionRegistry};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Upper bound on waiting for the session to stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DevsessionExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<DevsessionExitCode> for ExitCode {
    fn from(code: DevsessionExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    device_id: String,
    transport_url: String,
    source_type: String,
    source_url: String,
    poll_interval: u64,
    token: Option<String>,
    window_secs: u64,
    offline_factor: u32,
    check_interval: u64,
    log_level: String,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        None => Ok(default),
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{name} is required. Set it via: export {name}=..."))
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            device_id: required(&lookup, "DEVSESSION_DEVICE_ID")?,
            transport_url: required(&lookup, "DEVSESSION_TRANSPORT_URL")?,
            source_type: lookup("DEVSESSION_SOURCE_TYPE").unwrap_or_else(|| "websocket".to_string()),
            source_url: required(&lookup, "DEVSESSION_SOURCE_URL")?,
            poll_interval: parse_or(&lookup, "DEVSESSION_POLL_INTERVAL", 30)?,
            token: lookup("DEVSESSION_TOKEN").filter(|t| !t.is_empty()),
            window_secs: parse_or(&lookup, "DEVSESSION_WINDOW_SECS", 60)?,
            offline_factor: parse_or(&lookup, "DEVSESSION_OFFLINE_FACTOR", 10)?,
            check_interval: parse_or(&lookup, "DEVSESSION_CHECK_INTERVAL", 5)?,
            log_level: lookup("DEVSESSION_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the daemon-level settings
    ///
    /// Session thresholds are validated by devsession-core when the
    /// session is built; this only covers what the core never sees.
    fn validate(&self) -> Result<()> {
        match self.source_type.as_str() {
            "websocket" | "http_poll" => {}
            _ => anyhow::bail!(
                "DEVSESSION_SOURCE_TYPE '{}' is not supported. \
                Supported types: websocket, http_poll",
                self.source_type
            ),
        }

        if self.source_type == "http_poll" && !(1..=3600).contains(&self.poll_interval) {
            anyhow::bail!(
                "DEVSESSION_POLL_INTERVAL must be between 1 and 3600 seconds. Got: {}",
                self.poll_interval
            );
        }

        if let Some(token) = &self.token {
            let lower = token.to_lowercase();
            if lower.contains("your_token") || lower.contains("replace_me") {
                anyhow::bail!(
                    "DEVSESSION_TOKEN appears to be a placeholder. \
                    Use the token issued by the device, or unset it to pair."
                );
            }
        }

        if self.transport_url.starts_with("http://") {
            eprintln!(
                "WARNING: DEVSESSION_TRANSPORT_URL uses HTTP (not HTTPS). \
                      Credentials travel in clear text."
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "DEVSESSION_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        self.session_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))
    }

    /// Build the session configuration
    fn session_config(&self) -> SessionConfig {
        let transport = TransportConfig::Http {
            base_url: self.transport_url.clone(),
        };
        let source = match self.source_type.as_str() {
            "http_poll" => EventSourceConfig::HttpPoll {
                url: self.source_url.clone(),
                interval_secs: self.poll_interval,
            },
            _ => EventSourceConfig::Websocket {
                url: self.source_url.clone(),
            },
        };

        let mut config = SessionConfig::new(self.device_id.clone(), transport, source);
        config.credentials = self.token.as_ref().map(|token| CredentialsConfig {
            token: token.clone(),
            pairing_code: None,
        });
        config.liveness.window_secs = self.window_secs;
        config.liveness.offline_factor = self.offline_factor;
        config.liveness.check_interval_secs = self.check_interval;
        config
    }
}

/// Writes every dispatched entry to the log
struct LogListener;

impl EventListener for LogListener {
    fn on_entry(&self, event: &Event, entry: &Entry) {
        info!(device = event.device_id(), channel = %entry.channel, value = %entry.value, "Entry");
    }

    fn on_rejected(&self, detail: &str) {
        warn!("Event rejected: {}", detail);
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return DevsessionExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return DevsessionExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return DevsessionExitCode::ConfigError.into();
    }

    info!("Starting devsessiond daemon");
    info!(device = %config.device_id, source = %config.source_type, "Configuration loaded");

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return DevsessionExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => DevsessionExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                DevsessionExitCode::RuntimeError
            }
        }
    })
    .into()
}

fn build_registry() -> SessionRegistry {
    let registry = SessionRegistry::new();

    #[cfg(feature = "http")]
    {
        info!("Registering HTTP transport and poll source");
        devsession_http::register(&registry);
    }

    #[cfg(feature = "ws")]
    {
        info!("Registering WebSocket source");
        devsession_ws::register(&registry);
    }

    registry
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    let registry = build_registry();
    let session_config = config.session_config();

    let transport = registry
        .create_transport(&session_config.transport)
        .context("Failed to create transport")?;
    let source = registry
        .create_source(&session_config.device_id, &session_config.source)
        .context("Failed to create event source")?;

    let (session, events) = DeviceSession::new(Arc::from(transport), Arc::from(source), session_config)?;
    session.on_event(Arc::new(LogListener));

    let logger = tokio::spawn(log_session_events(events));

    session.start().await?;
    info!("Daemon initialized successfully");

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);
    info!("Shutting down daemon");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, session.dispose()).await.is_err() {
        anyhow::bail!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT);
    }

    // Dropping the session closes the notification channel
    drop(session);
    if let Err(e) = logger.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    Ok(())
}

/// Log session notifications until the session is gone
async fn log_session_events(mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StatusChanged { from, to, detail, message } => {
                info!(%from, %to, ?detail, message = message.as_deref().unwrap_or(""), "Device status");
            }
            SessionEvent::ReconnectFailed { attempt, error } => {
                warn!(attempt, error = %error, "Reconnect failed");
            }
            SessionEvent::Stopped { reason } => {
                info!(reason = %reason, "Session stopped");
            }
            other => debug!(?other, "Session event"),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
