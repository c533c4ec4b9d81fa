//! Transport collaborator for courier sessions.
//!
//! The session layer only needs to connect, log in, send a frame and
//! disconnect; everything the connection observes comes back as
//! [`TransportEvent`]s on a single channel. [`LineTransport`] is a plain TCP
//! implementation carrying one JSON envelope per line.

use crate::error::TransportError;
use async_trait::async_trait;
use courier_wire::{decode_frame, EnvelopeBuilder, InboundFrame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Socket established
    Connected,
    /// Login accepted; emitted after every successful authentication,
    /// including ones the transport performs on its own
    Authenticated,
    /// Inbound frame of this protocol
    Frame(InboundFrame),
    /// Connection closed cleanly
    Closed,
    /// Connection closed because of an error
    ClosedOnError(String),
    /// The transport's own reconnection attempt failed
    ReconnectFailed(String),
}

/// Connection primitives the session layer drives
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the underlying connection
    async fn connect(&self) -> Result<(), TransportError>;

    /// Authenticate an open connection
    async fn login(&self) -> Result<(), TransportError>;

    /// Send one encoded frame
    async fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Close the connection; emits `Closed` if one was open
    async fn disconnect(&self);
}

/// Credentials and address for [`LineTransport`]
#[derive(Debug, Clone)]
pub struct LineTransportConfig {
    /// Server address, `host:port`
    pub server_addr: String,
    /// Login name, usually `<sender id>@<auth domain>`
    pub username: String,
    /// Server key
    pub api_key: String,
}

struct Connection {
    generation: u64,
    writer: OwnedWriteHalf,
    reader: Option<Lines<BufReader<OwnedReadHalf>>>,
    read_task: Option<JoinHandle<()>>,
}

/// Newline-delimited JSON over TCP
pub struct LineTransport {
    config: LineTransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    connection: Arc<Mutex<Option<Connection>>>,
    generation: AtomicU64,
}

impl LineTransport {
    /// Create a transport reporting to `events`
    pub fn new(config: LineTransportConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            config,
            events,
            connection: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }

    async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<(), TransportError> {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write the auth envelope and wait for `auth_ok`
    async fn authenticate(
        &self,
        writer: &mut OwnedWriteHalf,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
    ) -> Result<(), TransportError> {
        let auth = EnvelopeBuilder::new()
            .insert_str("message_type", "auth")
            .insert_str("username", &self.config.username)
            .insert_str("api_key", &self.config.api_key)
            .build();
        Self::write_line(writer, &auth)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let reply = lines
            .next_line()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .ok_or_else(|| TransportError::Connection("closed during login".to_string()))?;
        let frame = decode_frame(&reply).map_err(|e| TransportError::Connection(e.to_string()))?;
        if frame.str_attr("message_type") != Some("auth_ok") {
            return Err(TransportError::Connection(format!(
                "login rejected: {}",
                frame.raw()
            )));
        }
        Ok(())
    }

    fn spawn_reader(
        &self,
        generation: u64,
        mut lines: Lines<BufReader<OwnedReadHalf>>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let connection = self.connection.clone();

        tokio::spawn(async move {
            let outcome = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_frame(&line) {
                            Ok(frame) => {
                                if events.send(TransportEvent::Frame(frame)).is_err() {
                                    break None;
                                }
                            }
                            Err(e) => warn!("Skipping undecodable line: {}", e),
                        }
                    }
                    Ok(None) => break Some(TransportEvent::Closed),
                    Err(e) => break Some(TransportEvent::ClosedOnError(e.to_string())),
                }
            };

            {
                let mut guard = connection.lock().await;
                // A newer connection replaced ours; nothing to report
                if guard.as_ref().map(|c| c.generation) != Some(generation) {
                    return;
                }
                guard.take();
            }
            if let Some(event) = outcome {
                info!("Connection closed: {:?}", event);
                let _ = events.send(event);
            }
        })
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        info!("Connecting to {}", self.config.server_addr);
        let stream = TcpStream::connect(&self.config.server_addr)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (read_half, writer) = stream.into_split();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let previous = self.connection.lock().await.replace(Connection {
            generation,
            writer,
            reader: Some(BufReader::new(read_half).lines()),
            read_task: None,
        });
        if let Some(mut old) = previous {
            if let Some(task) = old.read_task.take() {
                task.abort();
            }
            let _ = old.writer.shutdown().await;
        }

        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn login(&self) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| TransportError::Connection("login before connect".to_string()))?;
        let mut lines = connection
            .reader
            .take()
            .ok_or_else(|| TransportError::Connection("already logged in".to_string()))?;

        if let Err(e) = self.authenticate(&mut connection.writer, &mut lines).await {
            // An unauthenticated socket must not accept sends
            if let Some(mut rejected) = guard.take() {
                if let Err(err) = rejected.writer.shutdown().await {
                    debug!("Shutdown failed: {}", err);
                }
            }
            warn!("Login failed for {}: {}", self.config.username, e);
            return Err(e);
        }

        info!("User logged in: {}", self.config.username);
        connection.read_task = Some(self.spawn_reader(connection.generation, lines));
        drop(guard);

        self.emit(TransportEvent::Authenticated);
        Ok(())
    }

    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(TransportError::NotConnected)?;
        Self::write_line(&mut connection.writer, frame).await?;
        debug!("Sent: {}", frame);
        Ok(())
    }

    async fn disconnect(&self) {
        let taken = self.connection.lock().await.take();
        if let Some(mut connection) = taken {
            info!("Disconnecting from {}", self.config.server_addr);
            if let Some(task) = connection.read_task.take() {
                task.abort();
            }
            if let Err(e) = connection.writer.shutdown().await {
                debug!("Shutdown failed: {}", e);
            }
            self.emit(TransportEvent::Closed);
        }
    }
}
