//! The plugin hook surface. Every inbound packet is offered to attached
//! plugins in order before it reaches the application; plugins also get a
//! slice of the update tick and lifecycle notifications, which is all the
//! NAT punchthrough and detection machinery needs.

use crate::guid::Guid;
use crate::peer::{Packet, PeerWorld};
use crate::protocol::reliability_kind::{Priority, Reliability};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;

/// What a plugin decided about a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    /// Offer the packet to the next plugin and finally the application.
    Continue,
    /// The plugin consumed the packet; later plugins and the application
    /// never see it.
    Stop,
    /// Same as [`PluginAction::Stop`]; kept distinct for callers that want
    /// to signal the packet held nothing worth retaining.
    StopAndDiscard,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote told us it was leaving.
    Disconnected,
    /// Acks stopped, the hole queue overflowed, or traffic timed out.
    ConnectionLost,
    /// We closed it locally.
    ClosedLocally,
}

/// Window into the peer that plugin callbacks run against.
pub struct PluginContext<'a> {
    pub(crate) world: &'a mut PeerWorld,
    pub(crate) now: Instant,
}

impl<'a> PluginContext<'a> {
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn guid(&self) -> Guid {
        self.world.guid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.world.socket.local_addr()
    }

    /// Our address as some remote reported seeing it, if any connection
    /// completed.
    pub fn external_address(&self) -> Option<SocketAddr> {
        self.world.external_address
    }

    /// Milliseconds since peer startup, the wire clock.
    pub fn wire_time_ms(&self) -> u32 {
        self.world.wire_time_ms(self.now)
    }

    /// Sends a framed message over an established connection.
    pub fn send(
        &mut self,
        to: SocketAddr,
        data: &[u8],
        priority: Priority,
        reliability: Reliability,
        channel: u8,
    ) -> bool {
        self.world.send_connected(
            to,
            Bytes::copy_from_slice(data),
            priority,
            reliability,
            channel,
            None,
            self.now,
        )
    }

    /// Wraps `payload` in an out-of-band envelope and fires it at an
    /// address we are not connected to.
    pub fn send_out_of_band(&mut self, to: SocketAddr, payload: &[u8]) {
        self.world.send_out_of_band(to, payload);
    }

    /// Same, but with a temporary TTL: the datagram dies in transit while
    /// still opening our NAT outbound.
    pub fn send_out_of_band_with_ttl(&mut self, to: SocketAddr, payload: &[u8], ttl: u32) {
        self.world.send_out_of_band_with_ttl(to, payload, ttl);
    }

    /// Queues a synthetic packet for the application, flagged as locally
    /// generated.
    pub fn push_packet(&mut self, data: Bytes, address: SocketAddr, guid: Guid) {
        self.world.push_local_packet(data, address, guid);
    }

    pub fn is_connected(&self, address: SocketAddr) -> bool {
        self.world.is_connected(address)
    }

    pub fn guid_of(&self, address: SocketAddr) -> Option<Guid> {
        self.world.remotes.get(&address).map(|r| r.guid)
    }

    pub fn address_of(&self, guid: Guid) -> Option<SocketAddr> {
        self.world.address_of(guid)
    }

    /// The locally bound addresses a remote announced while connecting.
    pub fn internal_addresses_of(&self, guid: Guid) -> Option<Vec<SocketAddr>> {
        let address = self.world.address_of(guid)?;
        self.world
            .remotes
            .get(&address)
            .map(|r| r.internal_addresses.clone())
    }

    pub fn last_ping_ms(&self, address: SocketAddr) -> Option<u32> {
        self.world.remotes.get(&address).and_then(|r| r.last_ping_ms())
    }

    pub fn average_ping_ms(&self, address: SocketAddr) -> Option<u32> {
        self.world
            .remotes
            .get(&address)
            .and_then(|r| r.average_ping_ms())
    }

    /// Estimated `remote_clock - local_clock` in milliseconds.
    pub fn clock_differential_ms(&self, address: SocketAddr) -> Option<i64> {
        self.world
            .remotes
            .get(&address)
            .map(|r| r.clock_differential_ms)
    }

    pub fn connections(&self) -> Vec<(SocketAddr, Guid)> {
        self.world.connected_systems()
    }

    pub fn close_connection(&mut self, address: SocketAddr, send_notification: bool) {
        self.world.request_close(address, send_notification, self.now);
    }
}

/// Implemented by everything that rides on a peer: NAT punchthrough
/// client/server, NAT type detection, packet logging. All hooks default to
/// no-ops so implementors pick what they need.
#[allow(unused_variables)]
pub trait Plugin: Send {
    fn name(&self) -> &'static str;

    /// Called once when attached to a running peer.
    fn on_attach(&mut self, ctx: &mut PluginContext<'_>) {}

    /// Called every update tick.
    fn update(&mut self, ctx: &mut PluginContext<'_>) {}

    /// Offered every packet before the application sees it.
    fn on_packet(&mut self, ctx: &mut PluginContext<'_>, packet: &Packet) -> PluginAction {
        PluginAction::Continue
    }

    fn on_new_connection(
        &mut self,
        ctx: &mut PluginContext<'_>,
        address: SocketAddr,
        guid: Guid,
        incoming: bool,
    ) {
    }

    fn on_closed_connection(
        &mut self,
        ctx: &mut PluginContext<'_>,
        address: SocketAddr,
        guid: Guid,
        reason: DisconnectReason,
    ) {
    }

    /// An out-of-band envelope arrived from an unconnected address.
    /// Return `true` to stop the offer chain.
    fn on_out_of_band(
        &mut self,
        ctx: &mut PluginContext<'_>,
        from: SocketAddr,
        guid: Guid,
        payload: &Bytes,
    ) -> bool {
        false
    }

    /// An offline datagram nothing in the core recognized. Return `true`
    /// when handled.
    fn on_offline_datagram(
        &mut self,
        ctx: &mut PluginContext<'_>,
        from: SocketAddr,
        data: &Bytes,
    ) -> bool {
        false
    }

    /// Raw datagram taps for wire logging; no context, so they stay cheap.
    fn on_raw_send(&mut self, to: SocketAddr, data: &[u8]) {}
    fn on_raw_receive(&mut self, from: SocketAddr, data: &[u8]) {}

    /// A datagram from this address failed to parse.
    fn on_malformed_datagram(&mut self, from: SocketAddr) {}
}
