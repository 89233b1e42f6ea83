//! Client and relay configuration.

use std::time::Duration;

/// Session (client) configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Authority base URL, e.g. `ws://127.0.0.1:8080`
    pub server_url: String,
    /// Bound on waiting for a snapshot publish to drain before moving on
    pub publish_timeout: Duration,
    /// Bound on waiting for the transport to acknowledge a close
    pub close_timeout: Duration,
    /// Consecutive undecodable frames tolerated before forcing a resync
    pub max_protocol_errors: u32,
    /// Capacity of the host → controller command queue
    pub command_capacity: usize,
    /// Capacity of the controller → host notice queue
    pub notice_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            publish_timeout: Duration::from_secs(3),
            close_timeout: Duration::from_secs(2),
            max_protocol_errors: 3,
            command_capacity: 256,
            notice_capacity: 64,
        }
    }
}

/// Relay (authority) configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Activity entries kept per report before the oldest are evicted
    pub activity_log_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
            activity_log_capacity: 500,
        }
    }
}
