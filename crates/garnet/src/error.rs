use garnet_binary::BinaryError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can cross the public API boundary. Wire-level failures never
/// appear here; they become dropped datagrams or locally queued status
/// packets.
#[derive(Error, Debug)]
pub enum NetError {
    /// An I/O error on the underlying UDP socket.
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Binding the local socket failed.
    #[error("failed to bind {0}")]
    BindFailed(SocketAddr),

    /// The socket accepted only part of a datagram.
    #[error("partial send: {sent} of {len} bytes")]
    PartialSend { sent: usize, len: usize },

    /// Serialization or deserialization failure.
    #[error("binary handling error: {0}")]
    Binary(#[from] BinaryError),

    /// The peer has shut down; its command channel is gone.
    #[error("peer is shut down")]
    Shutdown,

    /// No connection exists for the given address.
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),

    /// A payload exceeded what the transport can frame.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, NetError>;
