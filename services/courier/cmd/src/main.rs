//! Courier relay client binary.
//!
//! Connects to the push relay, optionally sends one sample downstream
//! message, and keeps the session alive: acking upstream messages,
//! reconnecting when the server drains the connection, and replaying
//! undelivered messages. Exits non-zero when reconnection is exhausted.

use anyhow::Context;
use clap::Parser;
use courier_session::{LineTransport, SendOutcome, SessionError, SessionEvent, SessionManager};
use courier_wire::{unique_message_id, OutgoingMessage, PAYLOAD_MESSAGE};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CourierConfig;
use logging::CourierLogFormatter;

const SAMPLE_MESSAGE: &str = "This is the simple sample message";

/// Reliable push relay client
#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Reliable push relay client")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Relay address, e.g. 127.0.0.1:5236
    #[arg(long)]
    server: Option<String>,

    /// Sender (project) id used for login
    #[arg(long)]
    sender_id: Option<String>,

    /// Server key used for login
    #[arg(long)]
    api_key: Option<String>,

    /// Send one sample message to this registration id after connecting
    #[arg(long)]
    to: Option<String>,

    /// Age after which unacknowledged messages are replayed, e.g. 5s
    #[arg(long)]
    replay_grace: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(&self, config: &mut CourierConfig) {
        if let Some(server) = &self.server {
            config.server_addr = server.clone();
        }
        if let Some(sender_id) = &self.sender_id {
            config.sender_id = sender_id.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api_key = api_key.clone();
        }
        if let Some(grace) = &self.replay_grace {
            config.replay_grace = **grace;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("courier={}", args.log_level).parse()?)
        .add_directive(format!("courier_session={}", args.log_level).parse()?)
        .add_directive(format!("courier_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(CourierLogFormatter::new("courier"))
        .init();

    info!("Starting courier v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CourierConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    anyhow::ensure!(
        !config.sender_id.is_empty(),
        "no sender id configured (services.courier.sender_id, COURIER_SENDER_ID or --sender-id)"
    );

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(LineTransport::new(config.transport_config(), transport_tx));
    let (session, mut session_events) = SessionManager::new(config.session_config(), transport);

    if let Err(e) = session.connect().await {
        component_warn!("session", "Initial connection failed: {}, retrying", e);
        session
            .reconnect()
            .await
            .context("could not connect to the relay")?;
    }
    component_info!("session", "Connected to {} as {}", config.server_addr, config.username());

    if let Some(to) = &args.to {
        let session = session.clone();
        let to = to.clone();
        tokio::spawn(async move {
            if let Err(e) = send_sample(&session, &to).await {
                component_error!("session", "Sample message to {} failed: {}", to, e);
            }
        });
    }

    let run = session.run(transport_rx);
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(event) = session_events.recv() => log_session_event(&event),
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                session.disconnect_gracefully().await;
                session.shutdown().await;
            }
        }
    };

    while let Ok(event) = session_events.try_recv() {
        log_session_event(&event);
    }

    match result {
        Ok(()) => {
            info!(
                "Courier stopped with {} message(s) unacknowledged",
                session.registry().len()
            );
            Ok(())
        }
        Err(e @ SessionError::ReconnectExhausted { .. }) => {
            Err(anyhow::Error::new(e).context("relay connection lost"))
        }
        Err(e) => Err(e.into()),
    }
}

async fn send_sample(session: &SessionManager, to: &str) -> anyhow::Result<()> {
    let mut data = HashMap::new();
    data.insert(PAYLOAD_MESSAGE.to_string(), SAMPLE_MESSAGE.to_string());
    let message_id = unique_message_id();
    let payload = OutgoingMessage::new(to, message_id.as_str(), data).to_json()?;

    match session.send_downstream(message_id.as_str(), payload).await? {
        SendOutcome::Sent => info!("Sample message {} sent to {}", message_id, to),
        outcome => info!("Sample message {} to {}: {:?}", message_id, to, outcome),
    }
    Ok(())
}

fn log_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Authenticated => debug!("Session authenticated"),
        SessionEvent::Reconnected { attempts } => {
            component_info!("session", "Reconnected after {} attempt(s)", attempts)
        }
        SessionEvent::ConnectionLost { reason } => component_warn!(
            "session",
            "Connection lost: {}",
            reason.as_deref().unwrap_or("closed by server")
        ),
        SessionEvent::ReconnectFailed {
            attempts,
            last_error,
        } => component_error!(
            "session",
            "Giving up after {} reconnection attempts: {}",
            attempts,
            last_error
        ),
    }
}
