//! Sema relay: authority server for section channels.
//!
//! Serves `/report/{document}/section/{section}` channels. Options may also
//! come from `SEMA_RELAY_*` environment variables; log level comes from
//! `RUST_LOG`.

use clap::Parser;
use log::{error, info};
use sema_collab::{Relay, RelayConfig};

#[derive(Parser, Debug)]
#[command(name = "sema-relay", version, about = "Relay server for collaborative report sections")]
struct Args {
    #[arg(
        long,
        env = "SEMA_RELAY_ADDR",
        default_value = "127.0.0.1:8080",
        help = "Address to listen on"
    )]
    bind_addr: String,

    #[arg(long, env = "SEMA_RELAY_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    #[arg(long, env = "SEMA_RELAY_MAX_PEERS", default_value_t = 100)]
    max_peers_per_room: usize,

    /// Activity entries kept per report
    #[arg(long, env = "SEMA_RELAY_ACTIVITY_CAPACITY", default_value_t = 500)]
    activity_log_capacity: usize,
}

impl Args {
    fn to_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind_addr.clone(),
            broadcast_capacity: self.broadcast_capacity,
            max_peers_per_room: self.max_peers_per_room,
            activity_log_capacity: self.activity_log_capacity,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Args::parse().to_config();
    info!("Starting sema relay on {}", config.bind_addr);
    let relay = Relay::new(config);
    if let Err(e) = relay.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let config = Args::try_parse_from([
            "sema-relay",
            "--bind-addr",
            "0.0.0.0:9000",
            "--broadcast-capacity",
            "32",
        ])
        .unwrap()
        .to_config();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.broadcast_capacity, 32);
        assert_eq!(config.activity_log_capacity, 500);
    }

    #[test]
    fn test_rejects_non_numeric_capacity() {
        assert!(Args::try_parse_from(["sema-relay", "--broadcast-capacity", "lots"]).is_err());
    }
}
