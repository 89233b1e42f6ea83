//! Transport seam between a session channel and the network.
//!
//! A [`Connector`] turns a channel address into a [`TransportLink`]: a FIFO
//! queue of outbound commands and a stream of inbound events.
//!
//! ```text
//!                 ┌──────────── TransportLink ────────────┐
//! SessionChannel ─┤ outbound: Frame, Frame, …, Shutdown ──┼──▸ writer task ──▸ socket
//!                 │ inbound:  ◂── Frame / Closed / Error ─┼─── reader task ◂── socket
//!                 └───────────────────────────────────────┘
//! ```
//!
//! `Shutdown` travels through the same queue as frames, so everything queued
//! before it is written before the transport closes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::address::ChannelAddress;
use crate::protocol::Message;

/// Queue depth of each link direction.
const LINK_CAPACITY: usize = 256;

/// Commands consumed by the writer side of a link.
#[derive(Debug)]
pub enum Outbound {
    /// An encoded protocol message.
    Frame(Vec<u8>),
    /// Write everything queued so far, close the transport, then acknowledge.
    Shutdown(oneshot::Sender<()>),
}

/// Events produced by the reader side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Vec<u8>),
    /// The remote end closed the connection.
    Closed,
    /// The connection broke.
    Error(String),
}

/// Both directions of an established connection.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connecting to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("connection closed")]
    ConnectionClosed,
}

/// Opens transport connections for channel addresses.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        address: &ChannelAddress,
    ) -> impl Future<Output = Result<TransportLink, TransportError>> + Send;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

/// Connects to an authority over WebSocket (`{server_url}/report/…/section/…`).
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    server_url: String,
}

impl WebSocketConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self, address: &ChannelAddress) -> Result<TransportLink, TransportError> {
        let url = address.url(&self.server_url);
        log::debug!("Attempting to open socket: {url}");

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_CAPACITY);

        // Writer task: drain the outbound queue in order.
        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match cmd {
                    Outbound::Frame(data) => {
                        let frame = match String::from_utf8(data) {
                            Ok(text) => WsMessage::Text(text.into()),
                            Err(e) => WsMessage::Binary(e.into_bytes().into()),
                        };
                        if let Err(e) = ws_writer.send(frame).await {
                            let _ = writer_events.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    Outbound::Shutdown(ack) => {
                        if let Err(e) = ws_writer.close().await {
                            log::debug!("Error closing socket: {e}");
                        }
                        let _ = ack.send(());
                        break;
                    }
                }
            }
        });

        // Reader task: forward frames until the socket ends.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(WsMessage::Text(text)) => TransportEvent::Frame(text.as_bytes().to_vec()),
                    Ok(WsMessage::Binary(data)) => TransportEvent::Frame(data.to_vec()),
                    Ok(WsMessage::Close(_)) => {
                        let _ = in_tx.send(TransportEvent::Closed).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if in_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = in_tx.send(TransportEvent::Closed).await;
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

/// A frame written by a memory connection, tagged with its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub address: ChannelAddress,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryShared {
    sent: Mutex<Vec<SentFrame>>,
    connections: Mutex<Vec<MemoryConnection>>,
    refuse: AtomicBool,
    stall_shutdown: AtomicBool,
    stall_writes: AtomicBool,
}

/// In-process connector for headless use and tests.
///
/// Every frame written by any of its connections is recorded, in write
/// order, in one shared log. Inbound traffic is injected per connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
}

/// Remote end of one memory connection.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    address: ChannelAddress,
    inbound: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Never acknowledge shutdown (simulates a stalled drain).
    pub fn stall_shutdown(&self, stall: bool) {
        self.shared.stall_shutdown.store(stall, Ordering::SeqCst);
    }

    /// Stop consuming outbound commands (simulates a peer that stopped
    /// reading). Queues fill up until writes resume.
    pub fn stall_writes(&self, stall: bool) {
        self.shared.stall_writes.store(stall, Ordering::SeqCst);
    }

    /// Every frame written so far, across all connections.
    pub fn sent(&self) -> Vec<SentFrame> {
        lock(&self.shared.sent).clone()
    }

    /// Written frames decoded as protocol messages (undecodable ones skipped).
    pub fn sent_messages(&self) -> Vec<(ChannelAddress, Message)> {
        self.sent()
            .into_iter()
            .filter_map(|f| Message::decode(&f.bytes).ok().map(|m| (f.address, m)))
            .collect()
    }

    pub fn connections(&self) -> Vec<MemoryConnection> {
        lock(&self.shared.connections).clone()
    }

    pub fn last_connection(&self) -> Option<MemoryConnection> {
        lock(&self.shared.connections).last().cloned()
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self, address: &ChannelAddress) -> Result<TransportLink, TransportError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: address.path(),
                reason: "connection refused".to_string(),
            });
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        lock(&self.shared.connections).push(MemoryConnection {
            address: address.clone(),
            inbound: in_tx,
            closed: closed.clone(),
        });

        let shared = self.shared.clone();
        let address = address.clone();
        tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                while shared.stall_writes.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                match cmd {
                    Outbound::Frame(bytes) => lock(&shared.sent).push(SentFrame {
                        address: address.clone(),
                        bytes,
                    }),
                    Outbound::Shutdown(ack) => {
                        if shared.stall_shutdown.load(Ordering::SeqCst) {
                            // Hold the ack forever.
                            std::future::pending::<()>().await;
                        }
                        closed.store(true, Ordering::SeqCst);
                        let _ = ack.send(());
                        return;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryConnection {
    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Whether the local side shut this connection down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver raw bytes as if received from the authority.
    pub async fn inject(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.inbound
            .send(TransportEvent::Frame(bytes.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Deliver an encoded protocol message.
    pub async fn inject_message(&self, msg: &Message) -> Result<(), TransportError> {
        let bytes = msg.encode().map_err(|_| TransportError::ConnectionClosed)?;
        self.inject(bytes).await
    }

    /// Break the connection with a transport error.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.inbound
            .send(TransportEvent::Error(reason.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_records_in_order() {
        let connector = MemoryConnector::new();
        let addr = ChannelAddress::new("r1", "Intro");
        let link = connector.connect(&addr).await.unwrap();

        link.outbound.send(Outbound::Frame(b"one".to_vec())).await.unwrap();
        link.outbound.send(Outbound::Frame(b"two".to_vec())).await.unwrap();
        let (ack_tx, ack_rx) = oneshot::channel();
        link.outbound.send(Outbound::Shutdown(ack_tx)).await.unwrap();
        ack_rx.await.unwrap();

        let sent: Vec<Vec<u8>> = connector.sent().into_iter().map(|f| f.bytes).collect();
        assert_eq!(sent, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(connector.last_connection().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_memory_stalled_writes_fill_the_queue() {
        let connector = MemoryConnector::new();
        connector.stall_writes(true);
        let link = connector.connect(&ChannelAddress::new("r1", "Intro")).await.unwrap();

        let mut queued = 0;
        while link.outbound.try_send(Outbound::Frame(b"x".to_vec())).is_ok() {
            queued += 1;
            assert!(queued <= LINK_CAPACITY + 1, "queue never filled");
        }
        assert!(connector.sent().is_empty());

        connector.stall_writes(false);
        let (ack_tx, ack_rx) = oneshot::channel();
        link.outbound.send(Outbound::Shutdown(ack_tx)).await.unwrap();
        ack_rx.await.unwrap();
        assert_eq!(connector.sent().len(), queued);
    }

    #[tokio::test]
    async fn test_memory_refuse() {
        let connector = MemoryConnector::new();
        connector.refuse_connections(true);
        let result = connector.connect(&ChannelAddress::new("r1", "Intro")).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        assert!(connector.connections().is_empty());
    }

    #[tokio::test]
    async fn test_memory_inject_reaches_inbound() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect(&ChannelAddress::new("r1", "Intro")).await.unwrap();
        let conn = connector.last_connection().unwrap();

        conn.inject(b"hello".to_vec()).await.unwrap();
        conn.fail("reset").await.unwrap();

        assert_eq!(link.inbound.recv().await, Some(TransportEvent::Frame(b"hello".to_vec())));
        assert_eq!(link.inbound.recv().await, Some(TransportEvent::Error("reset".into())));
    }
}
