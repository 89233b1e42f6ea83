//! WebSocket relay: the authority every session channel talks to.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── /report/{doc}/section/{s} ── BroadcastGroup
//! Client B ──┘                │
//!                             └── SnapshotStore (field → ops)
//! ```
//!
//! Routing per message type:
//! - `join`: alone in the room → reply with the stored snapshot as `sync`;
//!   otherwise send `request_contents` to one other peer.
//! - `delta`: fan out to every other peer.
//! - `sync`: fan out to every other peer, then store.
//! - `updateRepo`: store.
//! - `close`: stop routing to this peer.
//!
//! Each routed message is also appended to the report's [`ActivityLog`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityLog};
use crate::address::ChannelAddress;
use crate::broadcast::{BroadcastError, BroadcastGroup, PeerInfo, RoomFrame, RoomManager};
use crate::config::RelayConfig;
use crate::protocol::{Message, ProtocolError};
use crate::registry::FieldSnapshot;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error("no channel at path '{0}'")]
    BadPath(String),
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub stored_updates: u64,
}

/// Last known contents of every section, field by field.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    sections: RwLock<HashMap<ChannelAddress, FieldSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the listed fields of a section; other fields are kept.
    pub async fn store(&self, address: ChannelAddress, fields: FieldSnapshot) {
        let mut sections = self.sections.write().await;
        let stored = sections.entry(address).or_default();
        for (field_id, ops) in fields {
            stored.insert(field_id, ops);
        }
    }

    pub async fn load(&self, address: &ChannelAddress) -> Option<FieldSnapshot> {
        self.sections.read().await.get(address).cloned()
    }

    pub async fn section_count(&self) -> usize {
        self.sections.read().await.len()
    }
}

/// The relay server.
pub struct Relay {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    store: Arc<SnapshotStore>,
    activity: Arc<ActivityLog>,
    stats: Arc<RwLock<RelayStats>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        let activity = Arc::new(ActivityLog::new(config.activity_log_capacity));
        Self {
            config,
            rooms,
            store: Arc::new(SnapshotStore::new()),
            activity,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let store = self.store.clone();
            let activity = self.activity.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, store, activity, stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        store: Arc<SnapshotStore>,
        activity: Arc<ActivityLog>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), RelayError> {
        let mut address = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match ChannelAddress::parse_path(req.uri().path()) {
                Some(parsed) => {
                    address = Some(parsed);
                    Ok(resp)
                }
                None => {
                    let mut err = ErrorResponse::new(Some("unknown channel path".to_string()));
                    *err.status_mut() = StatusCode::NOT_FOUND;
                    Err(err)
                }
            }
        })
        .await?;
        let address = address.ok_or_else(|| RelayError::BadPath(addr.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let room = rooms.get_or_create(&address).await;
        let mut peer = PeerConnection::new(
            PeerInfo::new(addr.to_string()),
            address.clone(),
            room,
            store,
            activity,
        );
        if let Err(e) = peer.attach().await {
            rooms.remove_if_empty(&address).await;
            return Err(e.into());
        }
        log::info!("Peer {} ({addr}) connected to {address}", peer.info.peer_id);

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = rooms.room_count().await;
        }

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let bytes: Vec<u8> = match msg {
                        Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                        Some(Ok(WsMessage::Ping(data))) => {
                            if let Err(e) = ws_sender.send(WsMessage::Pong(data)).await {
                                break Err(e.into());
                            }
                            continue;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };

                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }

                    let msg = match Message::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };
                    let stored = matches!(msg, Message::SnapshotSync { .. } | Message::SnapshotPublish { .. });

                    match peer.on_message(msg, bytes).await {
                        Ok(Some(reply)) => {
                            let text = match reply.encode().map(String::from_utf8) {
                                Ok(Ok(text)) => text,
                                Ok(Err(e)) => break Err(ProtocolError::Encode(e.to_string()).into()),
                                Err(e) => break Err(e.into()),
                            };
                            if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                                break Err(e.into());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Peer {} on {address}: {e}", peer.info.peer_id),
                    }
                    if stored {
                        stats.write().await.stored_updates += 1;
                    }
                }

                frame = async {
                    match peer.room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if !frame.is_for(peer.info.peer_id) {
                                continue;
                            }
                            let text = String::from_utf8_lossy(&frame.payload).into_owned();
                            if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {} lagged by {n} frames", peer.info.peer_id);
                            peer.room.record_dropped(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        peer.detach().await;
        rooms.remove_if_empty(&address).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }
        log::info!("Peer {} left {address}", peer.info.peer_id);
        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Activity recorded for one report, oldest first.
    pub async fn activity(&self, document_id: &str) -> Vec<ActivityEntry> {
        self.activity.entries(document_id).await
    }

    pub fn activity_log(&self) -> &Arc<ActivityLog> {
        &self.activity
    }
}

/// Routing state for one connected socket.
struct PeerConnection {
    info: PeerInfo,
    address: ChannelAddress,
    room: Arc<BroadcastGroup>,
    room_rx: Option<broadcast::Receiver<RoomFrame>>,
    store: Arc<SnapshotStore>,
    activity: Arc<ActivityLog>,
}

impl PeerConnection {
    fn new(
        info: PeerInfo,
        address: ChannelAddress,
        room: Arc<BroadcastGroup>,
        store: Arc<SnapshotStore>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            info,
            address,
            room,
            room_rx: None,
            store,
            activity,
        }
    }

    async fn record(&self, section_id: &str, kind: ActivityKind) {
        let entry = ActivityEntry::new(&self.info.label, section_id, kind);
        self.activity.record(&self.address.document_id, entry).await;
    }

    async fn attach(&mut self) -> Result<(), BroadcastError> {
        if self.room_rx.is_none() {
            self.room_rx = Some(self.room.add_peer(self.info.clone()).await?);
        }
        Ok(())
    }

    async fn detach(&mut self) {
        self.room_rx = None;
        self.room.remove_peer(&self.info.peer_id).await;
    }

    /// Route one inbound message; returns a direct reply, if any.
    async fn on_message(&mut self, msg: Message, raw: Vec<u8>) -> Result<Option<Message>, BroadcastError> {
        let peer_id = self.info.peer_id;
        match msg {
            Message::Join { document_id, section_id } => {
                self.attach().await?;
                log::info!("Peer {peer_id} joined {document_id}/{section_id}");
                self.record(&section_id, ActivityKind::Joined).await;

                match self.room.other_peer(&peer_id).await {
                    Some(other) => {
                        log::debug!("Asking peer {other} for {}", self.address);
                        self.room.send_to(peer_id, other, &Message::RequestSnapshot)?;
                        Ok(None)
                    }
                    None => Ok(self
                        .store
                        .load(&self.address)
                        .await
                        .map(|fields| Message::snapshot_sync(document_id, section_id, fields))),
                }
            }
            Message::Change { .. } => {
                self.room.broadcast_raw(RoomFrame::new(peer_id, raw));
                self.record(&self.address.section_id, ActivityKind::Changed).await;
                Ok(None)
            }
            Message::SnapshotSync { document_id, section_id, fields } => {
                self.room.broadcast_raw(RoomFrame::new(peer_id, raw));
                self.record(&section_id, ActivityKind::Synced).await;
                self.store
                    .store(ChannelAddress::new(document_id, section_id), fields)
                    .await;
                Ok(None)
            }
            Message::SnapshotPublish { document_id, section_id, fields } => {
                log::debug!("Storing {} fields for {document_id}/{section_id}", fields.len());
                self.record(&section_id, ActivityKind::Published).await;
                self.store
                    .store(ChannelAddress::new(document_id, section_id), fields)
                    .await;
                Ok(None)
            }
            Message::Leave { section_id } => {
                log::info!("Peer {peer_id} closed section '{section_id}'");
                self.detach().await;
                self.record(&section_id, ActivityKind::Left).await;
                Ok(None)
            }
            Message::RequestSnapshot => {
                log::debug!("Ignoring request_contents from peer {peer_id}");
                Ok(None)
            }
        }
    }
}
