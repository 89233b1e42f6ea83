//! # sema-collab — Real-time sync layer for collaborative report editing
//!
//! A report is a list of sections; each section holds one rich-text field per
//! subsection. Clients editing the same section share a channel through a
//! relay, exchanging incremental deltas and whole-section snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐     WebSocket      ┌─────────────┐
//! │ SessionController │ ◄────────────────► │   Relay     │
//! │ (per page)        │   JSON messages    │ (authority) │
//! └─────────┬─────────┘                    └──────┬──────┘
//!           │                                     │
//!           ▼                                     ▼
//! ┌───────────────────┐               ┌─────────────────────┐
//! │ FieldRegistry     │               │ BroadcastGroup      │
//! │  └ DocumentReplica│               │ per section channel │
//! │     (Delta)       │               ├─────────────────────┤
//! └───────────────────┘               │ SnapshotStore       │
//!                                     └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`delta`] — Rich-text delta algebra (insert/retain/delete, compose)
//! - [`replica`] — One field's local copy
//! - [`registry`] — Replicas of the open section, in table-of-contents order
//! - [`protocol`] — JSON wire messages
//! - [`address`] — Channel addressing (`/report/{doc}/section/{section}`)
//! - [`transport`] — Connector seam (WebSocket and in-memory)
//! - [`channel`] — Session channel with FIFO drain on close
//! - [`session`] — Section session controller
//! - [`catalog`] — Catalog, access-control and editor-surface collaborators
//! - [`config`] — Client and relay configuration
//! - [`broadcast`] — Room-based fan-out
//! - [`relay`] — WebSocket relay server
//! - [`activity`] — Per-report activity log kept by the relay

pub mod activity;
pub mod address;
pub mod broadcast;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod delta;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod replica;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use activity::{ActivityEntry, ActivityKind, ActivityLog};
pub use address::ChannelAddress;
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo, RoomFrame, RoomManager};
pub use catalog::{
    AccessControl, Catalog, CollaboratorError, EditorSurface, NullSurface, SectionDescriptor,
    StaticAccessControl, StaticCatalog,
};
pub use channel::{ChannelError, ChannelEvent, ChannelState, SessionChannel};
pub use config::{RelayConfig, SessionConfig};
pub use delta::{Delta, DeltaError, InsertValue, Op};
pub use protocol::{Message, MessageType, ProtocolError};
pub use registry::{FieldRegistry, FieldSnapshot, RegistryError};
pub use relay::{Relay, RelayError, RelayStats, SnapshotStore};
pub use replica::DocumentReplica;
pub use session::{
    SessionController, SessionError, SessionHandle, SessionNotice, SessionState, SETTINGS_SECTION,
};
pub use transport::{Connector, MemoryConnector, TransportError, WebSocketConnector};
