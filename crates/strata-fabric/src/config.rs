//! Fabric configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::channel::{FabricChannel, MAX_CHANNEL_RECV_WORKERS};

/// Tunables for one fabric instance.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Address the fabric listener binds to (default: `0.0.0.0:3011`; tests
    /// use port 0 for an ephemeral port).
    pub bind_addr: SocketAddr,
    /// Receive workers per channel (default: 4 each, max 128 per channel).
    pub recv_workers: [usize; FabricChannel::COUNT],
    /// Capacity of each per-(peer, channel) send queue (default: 256).
    pub send_queue_capacity: usize,
    /// Capacity of each receive worker's inbound queue (default: 1024).
    pub recv_queue_capacity: usize,
    /// Ceiling on sockets per channel across all peers (default: 128).
    pub max_channel_sockets: usize,
    /// TCP connect timeout (default: 5s).
    pub connect_timeout: Duration,
    /// Reconnect attempts after a socket fault before a link is torn down
    /// (default: 3).
    pub reconnect_max_retries: u32,
    /// Initial reconnect backoff, doubled per attempt (default: 50ms).
    pub reconnect_initial_backoff: Duration,
    /// Reconnect backoff ceiling (default: 2s).
    pub reconnect_max_backoff: Duration,
    /// Transact timeout reaper period (default: 100ms).
    pub reap_interval: Duration,
    /// Whether to set TCP_NODELAY on fabric sockets (default: true).
    pub nodelay: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3011".parse().expect("static bind addr parses"),
            recv_workers: [4; FabricChannel::COUNT],
            send_queue_capacity: 256,
            recv_queue_capacity: 1024,
            max_channel_sockets: crate::channel::MAX_CHANNEL_SOCKETS,
            connect_timeout: Duration::from_secs(5),
            reconnect_max_retries: 3,
            reconnect_initial_backoff: Duration::from_millis(50),
            reconnect_max_backoff: Duration::from_secs(2),
            reap_interval: Duration::from_millis(100),
            nodelay: true,
        }
    }
}

impl FabricConfig {
    /// Sets the receive worker count for one channel, clamped to
    /// [1, [`MAX_CHANNEL_RECV_WORKERS`]]. Takes effect at start.
    pub fn set_recv_workers(&mut self, channel: FabricChannel, count: usize) {
        self.recv_workers[channel.index()] = count.clamp(1, MAX_CHANNEL_RECV_WORKERS);
    }
}
