use crate::protocol;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a [`crate::Peer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Local address to bind; port 0 picks one.
    pub listen_address: SocketAddr,
    /// Connections accepted from remote systems. Zero makes a pure client.
    pub max_incoming_connections: usize,
    /// Total connection slots, incoming plus outgoing.
    pub max_connections: usize,
    /// Largest datagram this peer will negotiate, including IP+UDP
    /// overhead.
    pub mtu: u16,
    pub protocol_version: u8,
    /// Unacked reliable traffic or radio silence longer than this kills a
    /// connection.
    pub timeout: Duration,
    /// Queued unreliable messages older than this are dropped unsent.
    pub unreliable_timeout: Option<Duration>,
    /// Surface a download-progress packet every N split parts; zero
    /// disables.
    pub split_progress_interval: u32,
    pub ping_interval: Duration,
    /// Update task cadence when nothing wakes it earlier.
    pub update_interval: Duration,
    /// Bound of the inbound datagram queue; overflow drops the oldest.
    pub receive_queue_capacity: usize,
    /// Blob served in unconnected pongs for server browsers.
    pub advertisement: Bytes,
    /// Offline handshake sends per MTU candidate before stepping down.
    pub handshake_retries: u32,
    pub handshake_retry_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:0".parse().expect("valid literal"),
            max_incoming_connections: 32,
            max_connections: 64,
            mtu: 1400,
            protocol_version: protocol::PROTOCOL_VERSION,
            timeout: Duration::from_secs(10),
            unreliable_timeout: None,
            split_progress_interval: 0,
            ping_interval: Duration::from_millis(2500),
            update_interval: Duration::from_millis(10),
            receive_queue_capacity: 1024,
            advertisement: Bytes::new(),
            handshake_retries: 4,
            handshake_retry_interval: Duration::from_millis(500),
        }
    }
}

impl PeerConfig {
    /// A config listening on the given port with incoming connections
    /// allowed.
    pub fn server(port: u16, max_incoming: usize) -> Self {
        Self {
            listen_address: SocketAddr::new("0.0.0.0".parse().expect("valid literal"), port),
            max_incoming_connections: max_incoming,
            max_connections: max_incoming.max(8) * 2,
            ..Self::default()
        }
    }

    /// A config that never accepts incoming connections.
    pub fn client() -> Self {
        Self {
            max_incoming_connections: 0,
            ..Self::default()
        }
    }
}
