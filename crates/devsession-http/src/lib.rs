// # HTTP Device Transport
//
// This crate provides the JSON-over-HTTP side of a device session:
//
// - `HttpTransport`: pairing, link check and commands as plain requests
// - `HttpPollSource`: periodic state fetch, for devices that cannot push
//
// ## Device API
//
// - Pair: POST `{base}/pair` -> `{"token": "...", "pairing_code": "..."}`
// - Link check: GET `{base}/status`
// - Command: POST `{base}/commands/{op}` with the parameters as JSON body
//
// Every request carries `Authorization: Bearer <token>` when a token is
// known. Responses map onto the core error taxonomy: 401/403 are
// authentication failures, other 4xx are protocol errors, 5xx and network
// failures are connection errors.
//
// ## No retries here
//
// Each call makes exactly one request. Retries, backoff and re-pairing are
// owned by the session supervisor.

use async_trait::async_trait;
use devsession_core::config::{EventSourceConfig, TransportConfig};
use devsession_core::traits::{
    Command, CommandResponse, Credentials, Event, EventSource, EventSourceFactory, Inbound, InboundStream, Transport,
    TransportFactory,
};
use devsession_core::{Error, Result, SessionRegistry};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Default HTTP timeout for device requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered poll results between the poll task and the session
const POLL_BUFFER: usize = 16;

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))
}

fn authorize(request: reqwest::RequestBuilder, credentials: &Credentials) -> reqwest::RequestBuilder {
    match &credentials.token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

/// Map a transport-level reqwest failure onto the core taxonomy
fn request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(DEFAULT_HTTP_TIMEOUT)
    } else if err.is_decode() {
        Error::protocol(format!("Failed to decode response: {}", err))
    } else {
        Error::connection(format!("HTTP request failed: {}", err))
    }
}

/// Map a non-success status onto the core taxonomy
fn status_error(status: reqwest::StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::auth(format!("Device refused credentials. Status: {}", status)),
        500..=599 => Error::connection(format!("Device error (transient): {} - {}", status, body)),
        _ => Error::protocol(format!("Unexpected response: {} - {}", status, body)),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Pairing answer from the device
#[derive(Debug, Deserialize)]
struct PairResponse {
    token: String,
    #[serde(default)]
    pairing_code: Option<String>,
}

/// JSON-over-HTTP transport
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport for the API rooted at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            base_url,
            client: build_client()?,
        })
    }

    /// API root (without trailing slash)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("base_url", &self.base_url).finish()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn pair(&self) -> Result<Credentials> {
        tracing::debug!(url = %self.base_url, "Requesting pairing");
        let response = self
            .client
            .post(self.url("pair"))
            .send()
            .await
            .map_err(request_error)?;
        let response = check_status(response).await?;

        let paired: PairResponse = response.json().await.map_err(request_error)?;
        if paired.token.is_empty() {
            return Err(Error::protocol("Pairing response carried an empty token"));
        }

        let credentials = Credentials::with_token(paired.token);
        Ok(match paired.pairing_code {
            Some(code) => credentials.with_pairing_code(code),
            None => credentials,
        })
    }

    async fn connect(&self, credentials: &Credentials) -> Result<()> {
        let request = authorize(self.client.get(self.url("status")), credentials);
        let response = request.send().await.map_err(request_error)?;
        check_status(response).await?;
        tracing::debug!(url = %self.base_url, "Link check passed");
        Ok(())
    }

    async fn send(&self, credentials: &Credentials, command: &Command) -> Result<CommandResponse> {
        let request = authorize(self.client.post(self.url(&format!("commands/{}", command.op))), credentials)
            .json(&command.params);
        let response = request.send().await.map_err(request_error)?;
        let response = check_status(response).await?;

        let text = response.text().await.map_err(request_error)?;
        if text.trim().is_empty() {
            return Ok(CommandResponse::empty());
        }
        let body = serde_json::from_str(&text)?;
        Ok(CommandResponse::new(body))
    }

    fn transport_name(&self) -> &'static str {
        "http"
    }
}

/// Turn one poll body into an inbound item
fn decode_body(device_id: &str, body: &str) -> Inbound {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match Event::from_json_object(device_id, value) {
            Ok(event) => Inbound::Event(event),
            Err(_) => Inbound::Malformed(body.to_string()),
        },
        Err(_) => Inbound::Malformed(body.to_string()),
    }
}

async fn poll_once(client: &reqwest::Client, url: &str, credentials: &Credentials) -> Result<String> {
    let response = authorize(client.get(url), credentials)
        .send()
        .await
        .map_err(request_error)?;
    let response = check_status(response).await?;
    response.text().await.map_err(request_error)
}

/// Event source that fetches the device state at a fixed interval
///
/// `open()` performs the first fetch itself so an unreachable device is
/// reported as a failed link. Later failures are yielded as
/// `Inbound::Failed` and polling continues; the task stops when the
/// session drops the stream.
pub struct HttpPollSource {
    device_id: String,
    url: String,
    interval: Duration,
    client: reqwest::Client,
}

impl HttpPollSource {
    /// Create a poll source
    pub fn new(device_id: impl Into<String>, url: impl Into<String>, interval: Duration) -> Result<Self> {
        Ok(Self {
            device_id: device_id.into(),
            url: url.into(),
            interval,
            client: build_client()?,
        })
    }
}

#[async_trait]
impl EventSource for HttpPollSource {
    async fn open(&self, credentials: &Credentials) -> Result<InboundStream> {
        let first = poll_once(&self.client, &self.url, credentials).await?;

        let (tx, rx) = mpsc::channel(POLL_BUFFER);
        let device_id = self.device_id.clone();
        let url = self.url.clone();
        let interval = self.interval;
        let client = self.client.clone();
        let credentials = credentials.clone();

        tokio::spawn(async move {
            tracing::info!(device = %device_id, url = %url, ?interval, "Starting HTTP polling");

            let mut item = decode_body(&device_id, &first);
            loop {
                if tx.send(item).await.is_err() {
                    break;
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                item = match poll_once(&client, &url, &credentials).await {
                    Ok(body) => decode_body(&device_id, &body),
                    Err(err) => {
                        tracing::warn!(device = %device_id, error = %err, "Poll failed");
                        Inbound::Failed(err)
                    }
                };
            }

            tracing::debug!(device = %device_id, "Receiver dropped, stopping poll task");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn source_name(&self) -> &'static str {
        "http_poll"
    }
}

/// Factory for creating HTTP transports
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn create(&self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        match config {
            TransportConfig::Http { base_url } => Ok(Box::new(HttpTransport::new(base_url.clone())?)),
            _ => Err(Error::config("Invalid config for HTTP transport")),
        }
    }
}

/// Factory for creating HTTP poll sources
pub struct HttpPollFactory;

impl EventSourceFactory for HttpPollFactory {
    fn create(&self, device_id: &str, config: &EventSourceConfig) -> Result<Box<dyn EventSource>> {
        match config {
            EventSourceConfig::HttpPoll { url, interval_secs } => Ok(Box::new(HttpPollSource::new(
                device_id,
                url.clone(),
                Duration::from_secs(*interval_secs),
            )?)),
            _ => Err(Error::config("Invalid config for HTTP poll source")),
        }
    }
}

/// Register the HTTP transport and poll source with a registry
pub fn register(registry: &SessionRegistry) {
    registry.register_transport("http", Box::new(HttpTransportFactory));
    registry.register_source("http_poll", Box::new(HttpPollFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsession_core::ErrorKind;

    #[test]
    fn test_factory_creation() {
        let factory = HttpTransportFactory;

        let config = TransportConfig::Http {
            base_url: "http://192.168.1.20/api/".to_string(),
        };

        let transport = factory.create(&config);
        assert!(transport.is_ok());
    }

    #[test]
    fn poll_factory_rejects_other_configs() {
        let config = EventSourceConfig::Websocket {
            url: "ws://host".to_string(),
        };
        assert!(HttpPollFactory.create("meter", &config).is_err());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let transport = HttpTransport::new("http://host/api/").unwrap();
        assert_eq!(transport.base_url(), "http://host/api");
        assert_eq!(transport.url("status"), "http://host/api/status");
    }

    #[test]
    fn statuses_follow_the_taxonomy() {
        use reqwest::StatusCode;
        assert_eq!(status_error(StatusCode::UNAUTHORIZED, "").kind(), ErrorKind::Auth);
        assert_eq!(status_error(StatusCode::FORBIDDEN, "").kind(), ErrorKind::Auth);
        assert_eq!(status_error(StatusCode::NOT_FOUND, "").kind(), ErrorKind::Protocol);
        assert_eq!(status_error(StatusCode::BAD_GATEWAY, "").kind(), ErrorKind::Transport);
    }

    #[test]
    fn poll_bodies_decode_to_inbound_items() {
        assert!(matches!(
            decode_body("meter", r#"{"power": 1.5}"#),
            Inbound::Event(e) if e.entries().len() == 1
        ));
        assert!(matches!(decode_body("meter", "{}"), Inbound::Event(e) if e.is_empty()));
        assert!(matches!(decode_body("meter", "[1,2]"), Inbound::Malformed(_)));
        assert!(matches!(decode_body("meter", "<html>"), Inbound::Malformed(_)));
    }

    #[test]
    fn registers_both_factories() {
        let registry = SessionRegistry::new();
        register(&registry);
        assert!(registry.has_transport("http"));
        assert!(registry.has_source("http_poll"));
    }
}
