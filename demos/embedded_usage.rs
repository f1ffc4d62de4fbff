//! Minimal embedding example for devsession-core
//!
//! This example runs a session against an in-process simulated meter.
//! The session lifecycle is fully managed by the application.

use devsession_core::config::{EventSourceConfig, SessionConfig, TransportConfig};
use devsession_core::traits::{
    Command, CommandResponse, Credentials, Entry, Event, EventListener, EventSource, Inbound, InboundStream,
    Transport,
};
use devsession_core::{DeviceSession, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Simulated device API: pairs once, accepts everything afterwards
struct SimulatedTransport {
    pairings: AtomicUsize,
}

#[async_trait::async_trait]
impl Transport for SimulatedTransport {
    async fn pair(&self) -> Result<Credentials> {
        let n = self.pairings.fetch_add(1, Ordering::SeqCst) + 1;
        println!("[Device] Pairing request #{n} accepted");
        Ok(Credentials::with_token(format!("demo-token-{n}")))
    }

    async fn connect(&self, _credentials: &Credentials) -> Result<()> {
        Ok(())
    }

    async fn send(&self, _credentials: &Credentials, command: &Command) -> Result<CommandResponse> {
        println!("[Device] Executing {} {:?}", command.op, command.params);
        Ok(CommandResponse::new(serde_json::json!({ "accepted": true })))
    }

    fn transport_name(&self) -> &'static str {
        "simulated"
    }
}

/// Simulated meter: one telegram every 200ms, heartbeat in between
struct SimulatedMeter;

#[async_trait::async_trait]
impl EventSource for SimulatedMeter {
    async fn open(&self, _credentials: &Credentials) -> Result<InboundStream> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(async move {
            let mut reading = 1000.0_f64;
            for tick in 0u64.. {
                let item = if tick % 2 == 0 {
                    reading += 0.125;
                    Inbound::Event(Event::new(
                        "meter-1",
                        vec![
                            Entry::new("energy_delivered_kwh", reading),
                            Entry::new("tariff", 1 + tick % 2),
                        ],
                    ))
                } else {
                    Inbound::Heartbeat
                };
                if tx.send(item).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    fn source_name(&self) -> &'static str {
        "simulated"
    }
}

/// Prints every entry
struct PrintingListener;

impl EventListener for PrintingListener {
    fn on_entry(&self, event: &Event, entry: &Entry) {
        println!("[Listener] {} {} = {}", event.device_id(), entry.channel, entry.value);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    println!("=== Embedded devsession-core Example ===\n");

    // Create configuration
    let mut config = SessionConfig::new(
        "meter-1",
        TransportConfig::Custom {
            factory: "simulated".to_string(),
            config: serde_json::json!({}),
        },
        EventSourceConfig::Custom {
            factory: "simulated".to_string(),
            config: serde_json::json!({}),
        },
    );
    config.liveness.window_secs = 2;
    config.liveness.offline_factor = 5;
    config.liveness.check_interval_secs = 1;

    // Create session
    println!("1. Creating session...");
    let transport = Arc::new(SimulatedTransport {
        pairings: AtomicUsize::new(0),
    });
    let (session, mut event_rx) = DeviceSession::new(transport, Arc::new(SimulatedMeter), config)?;
    session.on_event(Arc::new(PrintingListener));

    // Spawn notification listener (optional)
    let notifications = tokio::spawn(async move {
        println!("2. Notification listener started");
        while let Some(event) = event_rx.recv().await {
            println!("[Session] {:?}", event);
        }
        println!("Notification listener stopped");
    });

    println!("3. Starting session...");
    session.start().await?;
    session.connect().await?;
    println!("   Status: {}", session.current_status());

    // Let data flow
    tokio::time::sleep(Duration::from_millis(500)).await;

    println!("\n4. Sending a command...");
    let response = session
        .send_command(Command::new("display").with_param("brightness", 40))
        .await?;
    println!("   Response: {}", response.body);

    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\n5. Disposing session...");
    session.dispose().await;
    let snapshot = session.snapshot();
    println!("   Final status: {} ({:?})", snapshot.status, snapshot.detail);

    drop(session);
    let _ = tokio::time::timeout(Duration::from_millis(100), notifications).await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Session lifecycle is fully controlled by application");
    println!("- dispose() returns only after every task is gone");
    println!("- Transport and event source are custom (not devsessiond defaults)");

    Ok(())
}
