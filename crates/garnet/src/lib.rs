//! # garnet
//!
//! A reliable, ordered, congestion-controlled transport layered on top of
//! UDP, built for real-time games and simulations where TCP's head-of-line
//! blocking is unacceptable and raw UDP is insufficient.
//!
//! The main entry point is [`Peer`], which multiplexes any number of
//! remote systems, each driven by its own
//! [`reliability::ReliabilityLayer`]. NAT punchthrough and NAT type
//! detection ship as [`plugin::Plugin`]s in the [`nat`] module.

pub mod congestion;
pub mod config;
pub mod error;
pub mod guid;
pub mod message_id;
pub mod nat;
pub mod packet_logger;
pub mod peer;
pub mod plugin;
pub mod protocol;
pub mod reliability;
pub mod socket;

pub use config::PeerConfig;
pub use error::{NetError, Result};
pub use guid::{Guid, UNASSIGNED_ADDRESS, UNASSIGNED_GUID};
pub use message_id::MessageId;
pub use peer::{ConnectionInfo, Packet, Peer, Target};
pub use plugin::{DisconnectReason, Plugin, PluginAction, PluginContext};
pub use protocol::reliability_kind::{Priority, Reliability};
pub use reliability::ConnectionStatistics;
