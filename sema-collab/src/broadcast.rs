//! Fan-out of relayed frames to the peers of one section channel.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; every frame carries its origin (and optionally a single target)
//! so receivers skip what is not meant for them.
//!
//! ```text
//!                      ┌──▸ peer A  (origin: skip)
//! RoomFrame ─ sender ──┼──▸ peer B
//!                      └──▸ peer C  (target = B: skip)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::address::ChannelAddress;
use crate::protocol::{Message, ProtocolError};

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    /// Human-readable label (remote address for relay peers)
    pub label: String,
}

impl PeerInfo {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), label)
    }

    pub fn with_id(peer_id: Uuid, label: impl Into<String>) -> Self {
        Self {
            peer_id,
            label: label.into(),
        }
    }
}

/// An encoded message travelling through a room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub origin: Uuid,
    /// Only this peer should receive the frame.
    pub target: Option<Uuid>,
    pub payload: Arc<Vec<u8>>,
}

impl RoomFrame {
    pub fn new(origin: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            origin,
            target: None,
            payload: Arc::new(payload.into()),
        }
    }

    pub fn targeted(origin: Uuid, target: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            origin,
            target: Some(target),
            payload: Arc::new(payload.into()),
        }
    }

    /// Whether `peer` should forward this frame to its socket.
    pub fn is_for(&self, peer: Uuid) -> bool {
        self.origin != peer && self.target.is_none_or(|target| target == peer)
    }
}

#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    #[error("room is full ({max} peers)")]
    RoomFull { max: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated without taking the peer lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single section channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,

    /// Connected peers, in join order
    peers: RwLock<IndexMap<Uuid, PeerInfo>>,

    capacity: usize,
    max_peers: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group buffering `capacity` frames per receiver.
    ///
    /// Receivers that fall further behind lose frames (reported as lag).
    pub fn new(capacity: usize) -> Self {
        Self::with_max_peers(capacity, usize::MAX)
    }

    pub fn with_max_peers(capacity: usize, max_peers: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(IndexMap::new()),
            capacity,
            max_peers,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(
        &self,
        info: PeerInfo,
    ) -> Result<broadcast::Receiver<RoomFrame>, BroadcastError> {
        let mut peers = self.peers.write().await;
        if peers.len() >= self.max_peers && !peers.contains_key(&info.peer_id) {
            return Err(BroadcastError::RoomFull {
                max: self.max_peers,
            });
        }
        peers.insert(info.peer_id, info);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.shift_remove(peer_id)
    }

    /// Encode `msg` and send it to every peer except `origin`.
    ///
    /// Returns the number of live receivers (the origin included).
    pub fn broadcast(&self, origin: Uuid, msg: &Message) -> Result<usize, BroadcastError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(RoomFrame::new(origin, encoded)))
    }

    /// Send `msg` to a single peer.
    pub fn send_to(&self, origin: Uuid, target: Uuid, msg: &Message) -> Result<usize, BroadcastError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(RoomFrame::targeted(origin, target, encoded)))
    }

    /// Send an already-encoded frame.
    pub fn broadcast_raw(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Longest-connected peer other than `peer_id`.
    pub async fn other_peer(&self, peer_id: &Uuid) -> Option<Uuid> {
        self.peers
            .read()
            .await
            .keys()
            .find(|id| *id != peer_id)
            .copied()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps channel addresses to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<ChannelAddress, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    max_peers_per_room: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize, max_peers_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            max_peers_per_room,
        }
    }

    /// Get or create the room for `address`.
    pub async fn get_or_create(&self, address: &ChannelAddress) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(address) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(address.clone())
            .or_insert_with(|| {
                Arc::new(BroadcastGroup::with_max_peers(
                    self.default_capacity,
                    self.max_peers_per_room,
                ))
            })
            .clone()
    }

    pub async fn get(&self, address: &ChannelAddress) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(address).cloned()
    }

    /// Drop the room for `address` if nobody is in it.
    pub async fn remove_if_empty(&self, address: &ChannelAddress) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(address) {
            if room.peer_count().await == 0 {
                rooms.remove(address);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<ChannelAddress> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
