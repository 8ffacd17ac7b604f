//! The peer: multiplexes any number of remote systems over one socket,
//! owns the connection handshake, pings, the banlist, plugin dispatch and
//! the user-visible packet queue.
//!
//! The public [`Peer`] handle is cheap command plumbing; all transport
//! state lives in the update task. User calls enqueue commands, the update
//! task linearizes them with arriving datagrams and per-connection ticks.

use crate::config::PeerConfig;
use crate::congestion::SlidingWindow;
use crate::error::{NetError, Result};
use crate::guid::{Guid, UNASSIGNED_GUID};
use crate::message_id::MessageId;
use crate::plugin::{DisconnectReason, Plugin, PluginAction, PluginContext};
use crate::protocol::connected::{
    ConnectedPing, ConnectedPong, ConnectionRequest, ConnectionRequestAccepted,
    NewIncomingConnection,
};
use crate::protocol::offline::{
    AlreadyConnected, ConnectionBanned, IncompatibleProtocolVersion, NoFreeIncomingConnections,
    OpenConnectionReply1, OpenConnectionReply2, OpenConnectionRequest1, OpenConnectionRequest2,
    OutOfBandInternal, UnconnectedPing, UnconnectedPong,
};
use crate::protocol::wire_message::WireMessage;
use crate::protocol::{self, Priority, Reliability};
use crate::reliability::{ConnectionStatistics, ReliabilityConfig, ReliabilityLayer};
use crate::socket::{InboundDatagram, NetSocket};
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// MTU probe ladder for the offline handshake, largest first.
const MTU_CANDIDATES: [u16; 3] = [1492, 1200, 576];
/// How long a close waits for the disconnect notification to flush.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// What `Peer::receive` hands the application: a payload plus where it
/// came from. `was_generated_locally` marks packets the transport
/// fabricated (receipts, progress, connection status) rather than
/// received.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub address: SocketAddr,
    pub guid: Guid,
    pub was_generated_locally: bool,
}

impl Packet {
    pub fn id(&self) -> Option<MessageId> {
        MessageId::of(&self.data)
    }
}

/// Send destination.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Address(SocketAddr),
    Guid(Guid),
    Broadcast,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub address: SocketAddr,
    pub guid: Guid,
    pub ping_ms: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    until: Option<Instant>,
}

enum Command {
    Connect {
        address: SocketAddr,
    },
    Send {
        target: Target,
        data: Bytes,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        receipt: Option<u32>,
    },
    CloseConnection {
        address: SocketAddr,
        send_notification: bool,
    },
    CancelConnectionAttempt {
        address: SocketAddr,
    },
    Ping {
        address: SocketAddr,
    },
    PingServer {
        address: SocketAddr,
    },
    AttachPlugin(Box<dyn Plugin>),
    ConnectionList {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Statistics {
        address: SocketAddr,
        reply: oneshot::Sender<Option<ConnectionStatistics>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    /// Client role: offline handshake done, connection request sent.
    RequestedConnection,
    /// Server role: slot created from request 2, awaiting the connection
    /// request.
    UnverifiedSender,
    /// Server role: acceptance sent, awaiting the client's confirmation.
    HandshakeAccepted,
    Connected,
    /// Close requested; draining the disconnect notification.
    Disconnecting,
}

const PING_RING: usize = 8;

pub(crate) struct RemoteSystem {
    pub(crate) guid: Guid,
    pub(crate) reliability: ReliabilityLayer,
    pub(crate) internal_addresses: Vec<SocketAddr>,
    pub(crate) clock_differential_ms: i64,
    state: ConnectionState,
    state_since: Instant,
    system_index: u16,
    pings: [Option<u32>; PING_RING],
    ping_cursor: usize,
    next_ping: Instant,
}

impl RemoteSystem {
    fn new(guid: Guid, reliability: ReliabilityLayer, state: ConnectionState, now: Instant) -> Self {
        Self {
            guid,
            reliability,
            internal_addresses: Vec::new(),
            clock_differential_ms: 0,
            state,
            state_since: now,
            system_index: 0,
            pings: [None; PING_RING],
            ping_cursor: 0,
            next_ping: now,
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn record_ping(&mut self, rtt_ms: u32, clock_differential_ms: i64) {
        self.pings[self.ping_cursor] = Some(rtt_ms);
        self.ping_cursor = (self.ping_cursor + 1) % PING_RING;
        self.clock_differential_ms = clock_differential_ms;
    }

    /// Most recent RTT sample.
    pub(crate) fn last_ping_ms(&self) -> Option<u32> {
        let last = (self.ping_cursor + PING_RING - 1) % PING_RING;
        self.pings[last]
    }

    pub(crate) fn average_ping_ms(&self) -> Option<u32> {
        let samples: Vec<u32> = self.pings.iter().flatten().copied().collect();
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<u32>() / samples.len() as u32)
        }
    }
}

enum AttemptState {
    /// Probing MTU candidates with request 1.
    RequestingMtu,
    /// Got reply 1; sending request 2 with the agreed MTU.
    RequestingConnection { mtu: u16 },
}

struct ConnectionAttempt {
    state: AttemptState,
    mtu_index: usize,
    tries_left: u32,
    next_send: Instant,
}

/// All mutable transport state, owned by the update task. Plugins see it
/// through [`PluginContext`].
pub(crate) struct PeerWorld {
    pub(crate) socket: NetSocket,
    pub(crate) guid: Guid,
    pub(crate) config: PeerConfig,
    pub(crate) remotes: HashMap<SocketAddr, RemoteSystem>,
    pub(crate) external_address: Option<SocketAddr>,
    attempts: HashMap<SocketAddr, ConnectionAttempt>,
    packet_tx: mpsc::UnboundedSender<Packet>,
    banlist: Arc<DashMap<IpAddr, BanEntry>>,
    guid_index: Arc<DashMap<Guid, SocketAddr>>,
    epoch: Instant,
    next_system_index: u16,
}

impl PeerWorld {
    pub(crate) fn wire_time_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.epoch).as_millis() as u32
    }

    pub(crate) fn is_connected(&self, address: SocketAddr) -> bool {
        self.remotes
            .get(&address)
            .is_some_and(|remote| remote.is_connected())
    }

    pub(crate) fn address_of(&self, guid: Guid) -> Option<SocketAddr> {
        self.guid_index.get(&guid).map(|entry| *entry.value())
    }

    pub(crate) fn connected_systems(&self) -> Vec<(SocketAddr, Guid)> {
        self.remotes
            .iter()
            .filter(|(_, remote)| remote.is_connected())
            .map(|(addr, remote)| (*addr, remote.guid))
            .collect()
    }

    fn is_banned(&self, ip: IpAddr, now: Instant) -> bool {
        match self.banlist.get(&ip) {
            Some(entry) => match entry.until {
                Some(until) => now < until,
                None => true,
            },
            None => false,
        }
    }

    fn raw_send(&self, data: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, to) {
            debug!("send to {} failed: {}", to, e);
        }
    }

    pub(crate) fn send_connected(
        &mut self,
        to: SocketAddr,
        data: Bytes,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        receipt: Option<u32>,
        now: Instant,
    ) -> bool {
        match self.remotes.get_mut(&to) {
            Some(remote) => remote
                .reliability
                .send(data, priority, reliability, channel, receipt, now),
            None => {
                debug!("send to {} dropped: not connected", to);
                false
            }
        }
    }

    fn out_of_band_envelope(&self, payload: &[u8]) -> Bytes {
        OutOfBandInternal {
            guid: self.guid,
            payload: Bytes::copy_from_slice(payload),
        }
        .serialize()
    }

    pub(crate) fn send_out_of_band(&self, to: SocketAddr, payload: &[u8]) {
        let envelope = self.out_of_band_envelope(payload);
        self.raw_send(&envelope, to);
    }

    pub(crate) fn send_out_of_band_with_ttl(&self, to: SocketAddr, payload: &[u8], ttl: u32) {
        let envelope = self.out_of_band_envelope(payload);
        if let Err(e) = self.socket.send_to_with_ttl(&envelope, to, ttl) {
            debug!("ttl send to {} failed: {}", to, e);
        }
    }

    pub(crate) fn push_local_packet(&self, data: Bytes, address: SocketAddr, guid: Guid) {
        let _ = self.packet_tx.send(Packet {
            data,
            address,
            guid,
            was_generated_locally: true,
        });
    }

    /// Ask for a close; finalized by the update loop.
    pub(crate) fn request_close(&mut self, address: SocketAddr, send_notification: bool, now: Instant) {
        if let Some(remote) = self.remotes.get_mut(&address) {
            if send_notification && remote.state != ConnectionState::Disconnecting {
                remote.reliability.send(
                    Bytes::from_static(&[MessageId::DisconnectionNotification as u8]),
                    Priority::Immediate,
                    Reliability::ReliableOrdered,
                    0,
                    None,
                    now,
                );
            }
            remote.state = ConnectionState::Disconnecting;
            remote.state_since = now;
        }
    }

    fn new_reliability_layer(&self, datagram_mtu: u16, now: Instant) -> ReliabilityLayer {
        ReliabilityLayer::new(
            Box::new(SlidingWindow::new(datagram_mtu)),
            ReliabilityConfig {
                timeout: self.config.timeout,
                unreliable_timeout: self.config.unreliable_timeout,
                split_progress_interval: self.config.split_progress_interval,
            },
            self.epoch,
            now,
        )
    }

    fn install_remote(
        &mut self,
        address: SocketAddr,
        guid: Guid,
        agreed_mtu: u16,
        state: ConnectionState,
        now: Instant,
    ) {
        let datagram_mtu = agreed_mtu.saturating_sub(protocol::UDP_HEADER_OVERHEAD);
        let layer = self.new_reliability_layer(datagram_mtu, now);
        let mut remote = RemoteSystem::new(guid, layer, state, now);
        remote.system_index = self.next_system_index;
        self.next_system_index = self.next_system_index.wrapping_add(1);
        self.guid_index.insert(guid, address);
        self.remotes.insert(address, remote);
    }
}

/// Public handle. Dropping it tears the update task down.
pub struct Peer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    packet_rx: mpsc::UnboundedReceiver<Packet>,
    guid: Guid,
    local_addr: SocketAddr,
    banlist: Arc<DashMap<IpAddr, BanEntry>>,
    guid_index: Arc<DashMap<Guid, SocketAddr>>,
    update_task: JoinHandle<()>,
}

impl Peer {
    /// Binds the socket and starts the update task.
    pub async fn bind(config: PeerConfig) -> Result<Self> {
        let socket = NetSocket::bind(config.listen_address, config.receive_queue_capacity).await?;
        let local_addr = socket.local_addr();
        let guid = Guid::random();
        info!("peer {} listening on {}", guid, local_addr);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let banlist: Arc<DashMap<IpAddr, BanEntry>> = Arc::new(DashMap::new());
        let guid_index: Arc<DashMap<Guid, SocketAddr>> = Arc::new(DashMap::new());

        let world = PeerWorld {
            socket,
            guid,
            config,
            remotes: HashMap::new(),
            external_address: None,
            attempts: HashMap::new(),
            packet_tx,
            banlist: Arc::clone(&banlist),
            guid_index: Arc::clone(&guid_index),
            epoch: Instant::now(),
            next_system_index: 0,
        };
        let core = PeerCore {
            world,
            plugins: Vec::new(),
            cmd_rx,
        };
        let update_task = tokio::spawn(core.run());

        Ok(Self {
            cmd_tx,
            packet_rx,
            guid,
            local_addr,
            banlist,
            guid_index,
            update_task,
        })
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn command(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).map_err(|_| NetError::Shutdown)
    }

    /// Starts the connection handshake; the outcome arrives as a packet
    /// (`ConnectionRequestAccepted` or `ConnectionAttemptFailed`).
    pub fn connect(&self, address: SocketAddr) -> Result<()> {
        self.command(Command::Connect { address })
    }

    pub fn send_to(
        &self,
        address: SocketAddr,
        data: impl Into<Bytes>,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
    ) -> Result<()> {
        self.command(Command::Send {
            target: Target::Address(address),
            data: data.into(),
            priority,
            reliability,
            channel,
            receipt: None,
        })
    }

    /// Like [`Peer::send_to`] but requests a delivery receipt; exactly one
    /// `SndReceiptAcked` or `SndReceiptLoss` packet carrying `serial` will
    /// surface.
    pub fn send_with_receipt(
        &self,
        address: SocketAddr,
        data: impl Into<Bytes>,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        serial: u32,
    ) -> Result<()> {
        self.command(Command::Send {
            target: Target::Address(address),
            data: data.into(),
            priority,
            reliability,
            channel,
            receipt: Some(serial),
        })
    }

    pub fn send_to_guid(
        &self,
        guid: Guid,
        data: impl Into<Bytes>,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
    ) -> Result<()> {
        self.command(Command::Send {
            target: Target::Guid(guid),
            data: data.into(),
            priority,
            reliability,
            channel,
            receipt: None,
        })
    }

    pub fn broadcast(
        &self,
        data: impl Into<Bytes>,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
    ) -> Result<()> {
        self.command(Command::Send {
            target: Target::Broadcast,
            data: data.into(),
            priority,
            reliability,
            channel,
            receipt: None,
        })
    }

    /// Waits for the next packet. `None` after shutdown.
    pub async fn receive(&mut self) -> Option<Packet> {
        self.packet_rx.recv().await
    }

    pub fn try_receive(&mut self) -> Option<Packet> {
        self.packet_rx.try_recv().ok()
    }

    pub fn close_connection(&self, address: SocketAddr, send_notification: bool) -> Result<()> {
        self.command(Command::CloseConnection {
            address,
            send_notification,
        })
    }

    /// Tears down a half-open handshake.
    pub fn cancel_connection_attempt(&self, address: SocketAddr) -> Result<()> {
        self.command(Command::CancelConnectionAttempt { address })
    }

    pub fn ping(&self, address: SocketAddr) -> Result<()> {
        self.command(Command::Ping { address })
    }

    /// Fires an unconnected ping at a server; its advertisement comes back
    /// as an `UnconnectedPong` packet.
    pub fn ping_server(&self, address: SocketAddr) -> Result<()> {
        self.command(Command::PingServer { address })
    }

    pub fn attach_plugin(&self, plugin: Box<dyn Plugin>) -> Result<()> {
        self.command(Command::AttachPlugin(plugin))
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::ConnectionList { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn statistics(&self, address: SocketAddr) -> Option<ConnectionStatistics> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Statistics { address, reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub fn address_of(&self, guid: Guid) -> Option<SocketAddr> {
        self.guid_index.get(&guid).map(|entry| *entry.value())
    }

    pub fn add_to_ban_list(&self, ip: IpAddr, duration: Option<Duration>) {
        self.banlist.insert(
            ip,
            BanEntry {
                until: duration.map(|d| Instant::now() + d),
            },
        );
    }

    pub fn remove_from_ban_list(&self, ip: IpAddr) {
        self.banlist.remove(&ip);
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        match self.banlist.get(&ip) {
            Some(entry) => match entry.until {
                Some(until) => Instant::now() < until,
                None => true,
            },
            None => false,
        }
    }

    /// Notifies connected systems and stops the update task.
    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.update_task.abort();
    }
}

struct PeerCore {
    world: PeerWorld,
    plugins: Vec<Box<dyn Plugin>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl PeerCore {
    async fn run(mut self) {
        loop {
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            while let Some(inbound) = self.world.socket.poll_recv() {
                self.handle_inbound(inbound);
            }
            self.tick(Instant::now());

            let interval = self.world.config.update_interval;
            tokio::select! {
                _ = self.world.socket.readable() => {}
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                return;
                            }
                        }
                        None => return, // handle dropped
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    fn with_plugins(&mut self, now: Instant, mut f: impl FnMut(&mut dyn Plugin, &mut PluginContext<'_>)) {
        let mut plugins = std::mem::take(&mut self.plugins);
        {
            let mut ctx = PluginContext {
                world: &mut self.world,
                now,
            };
            for plugin in plugins.iter_mut() {
                f(plugin.as_mut(), &mut ctx);
            }
        }
        self.plugins = plugins;
    }

    /// Offers a packet to the plugin chain, then to the application.
    fn dispatch_packet(&mut self, packet: Packet, now: Instant) {
        let mut plugins = std::mem::take(&mut self.plugins);
        let mut surfaced = true;
        {
            let mut ctx = PluginContext {
                world: &mut self.world,
                now,
            };
            for plugin in plugins.iter_mut() {
                match plugin.on_packet(&mut ctx, &packet) {
                    PluginAction::Continue => {}
                    PluginAction::Stop | PluginAction::StopAndDiscard => {
                        surfaced = false;
                        break;
                    }
                }
            }
        }
        self.plugins = plugins;
        if surfaced {
            let _ = self.world.packet_tx.send(packet);
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        let now = Instant::now();
        match command {
            Command::Connect { address } => self.start_connect(address, now),
            Command::Send {
                target,
                data,
                priority,
                reliability,
                channel,
                receipt,
            } => {
                let targets: Vec<SocketAddr> = match target {
                    Target::Address(addr) => vec![addr],
                    Target::Guid(guid) => self.world.address_of(guid).into_iter().collect(),
                    Target::Broadcast => self
                        .world
                        .connected_systems()
                        .into_iter()
                        .map(|(addr, _)| addr)
                        .collect(),
                };
                for addr in targets {
                    self.world.send_connected(
                        addr,
                        data.clone(),
                        priority,
                        reliability,
                        channel,
                        receipt,
                        now,
                    );
                }
            }
            Command::CloseConnection {
                address,
                send_notification,
            } => self.world.request_close(address, send_notification, now),
            Command::CancelConnectionAttempt { address } => {
                self.world.attempts.remove(&address);
            }
            Command::Ping { address } => self.send_ping(address, now),
            Command::PingServer { address } => {
                let ping = UnconnectedPing {
                    time_ms: self.world.wire_time_ms(now) as u64,
                    guid: self.world.guid,
                };
                self.world.raw_send(&ping.serialize(), address);
            }
            Command::AttachPlugin(mut plugin) => {
                {
                    let mut ctx = PluginContext {
                        world: &mut self.world,
                        now,
                    };
                    plugin.on_attach(&mut ctx);
                }
                debug!("plugin {} attached", plugin.name());
                self.plugins.push(plugin);
            }
            Command::ConnectionList { reply } => {
                let list = self
                    .world
                    .remotes
                    .iter()
                    .filter(|(_, remote)| remote.is_connected())
                    .map(|(addr, remote)| ConnectionInfo {
                        address: *addr,
                        guid: remote.guid,
                        ping_ms: remote.last_ping_ms(),
                    })
                    .collect();
                let _ = reply.send(list);
            }
            Command::Statistics { address, reply } => {
                let stats = self
                    .world
                    .remotes
                    .get(&address)
                    .map(|remote| remote.reliability.statistics());
                let _ = reply.send(stats);
            }
            Command::Shutdown => {
                self.shutdown(now);
                return false;
            }
        }
        true
    }

    fn shutdown(&mut self, now: Instant) {
        info!("peer {} shutting down", self.world.guid);
        let addrs: Vec<SocketAddr> = self.world.remotes.keys().copied().collect();
        for addr in addrs {
            if let Some(remote) = self.world.remotes.get_mut(&addr) {
                remote.reliability.send(
                    Bytes::from_static(&[MessageId::DisconnectionNotification as u8]),
                    Priority::Immediate,
                    Reliability::Reliable,
                    0,
                    None,
                    now,
                );
                let mut wire = Vec::new();
                remote.reliability.update(now, &mut wire);
                for datagram in wire {
                    if let Err(e) = self.world.socket.send_to(&datagram, addr) {
                        debug!("shutdown notify {} failed: {}", addr, e);
                    }
                }
            }
        }
    }

    fn start_connect(&mut self, address: SocketAddr, now: Instant) {
        if self.world.remotes.contains_key(&address) {
            self.world.push_local_packet(
                Bytes::from_static(&[MessageId::AlreadyConnected as u8]),
                address,
                self.world
                    .remotes
                    .get(&address)
                    .map(|r| r.guid)
                    .unwrap_or(UNASSIGNED_GUID),
            );
            return;
        }
        if self.world.attempts.contains_key(&address) {
            return; // already trying
        }
        debug!("connecting to {}", address);
        self.world.attempts.insert(
            address,
            ConnectionAttempt {
                state: AttemptState::RequestingMtu,
                mtu_index: 0,
                tries_left: self.world.config.handshake_retries,
                next_send: now,
            },
        );
    }

    fn send_ping(&mut self, address: SocketAddr, now: Instant) {
        let time_ms = self.world.wire_time_ms(now);
        if let Some(remote) = self.world.remotes.get_mut(&address) {
            remote.reliability.send(
                ConnectedPing { time_ms }.serialize(),
                Priority::Immediate,
                Reliability::Unreliable,
                0,
                None,
                now,
            );
        }
    }

    // ---------------------------------------------------------------
    // Inbound datagrams
    // ---------------------------------------------------------------

    fn handle_inbound(&mut self, inbound: InboundDatagram) {
        let InboundDatagram {
            from,
            data,
            arrived,
        } = inbound;
        for plugin in self.plugins.iter_mut() {
            plugin.on_raw_receive(from, &data);
        }
        if data.is_empty() {
            return;
        }
        if data[0] & 0x80 != 0 {
            if let Some(remote) = self.world.remotes.get_mut(&from) {
                if !remote.reliability.handle_datagram(data, arrived) {
                    let mut plugins = std::mem::take(&mut self.plugins);
                    for plugin in plugins.iter_mut() {
                        plugin.on_malformed_datagram(from);
                    }
                    self.plugins = plugins;
                }
            } else {
                trace!("connected-format datagram from unknown {}", from);
            }
        } else {
            self.handle_offline(from, data, arrived);
        }
    }

    fn handle_offline(&mut self, from: SocketAddr, data: Bytes, now: Instant) {
        let id = match MessageId::of(&data) {
            Some(id) => id,
            None => {
                self.offer_offline_to_plugins(from, data, now);
                return;
            }
        };
        match id {
            MessageId::UnconnectedPing => self.on_unconnected_ping(from, data, now),
            MessageId::UnconnectedPong => {
                let pong_guid = UnconnectedPong::deserialize(data.clone())
                    .map(|p| p.guid)
                    .unwrap_or(UNASSIGNED_GUID);
                let packet = Packet {
                    data,
                    address: from,
                    guid: pong_guid,
                    was_generated_locally: false,
                };
                self.dispatch_packet(packet, now);
            }
            MessageId::OpenConnectionRequest1 => self.on_open_request_1(from, data, now),
            MessageId::OpenConnectionRequest2 => self.on_open_request_2(from, data, now),
            MessageId::OpenConnectionReply1 => self.on_open_reply_1(from, data, now),
            MessageId::OpenConnectionReply2 => self.on_open_reply_2(from, data, now),
            MessageId::IncompatibleProtocolVersion
            | MessageId::ConnectionBanned
            | MessageId::NoFreeIncomingConnections
            | MessageId::AlreadyConnected => self.on_connect_refused(from, data, now),
            MessageId::OutOfBandInternal => {
                let oob = match OutOfBandInternal::deserialize(data) {
                    Ok(oob) => oob,
                    Err(e) => {
                        debug!("bad out-of-band envelope from {}: {}", from, e);
                        return;
                    }
                };
                let mut plugins = std::mem::take(&mut self.plugins);
                {
                    let mut ctx = PluginContext {
                        world: &mut self.world,
                        now,
                    };
                    for plugin in plugins.iter_mut() {
                        if plugin.on_out_of_band(&mut ctx, from, oob.guid, &oob.payload) {
                            break;
                        }
                    }
                }
                self.plugins = plugins;
            }
            _ => self.offer_offline_to_plugins(from, data, now),
        }
    }

    fn offer_offline_to_plugins(&mut self, from: SocketAddr, data: Bytes, now: Instant) {
        let mut plugins = std::mem::take(&mut self.plugins);
        {
            let mut ctx = PluginContext {
                world: &mut self.world,
                now,
            };
            for plugin in plugins.iter_mut() {
                if plugin.on_offline_datagram(&mut ctx, from, &data) {
                    break;
                }
            }
        }
        self.plugins = plugins;
    }

    fn on_unconnected_ping(&mut self, from: SocketAddr, data: Bytes, _now: Instant) {
        let ping = match UnconnectedPing::deserialize(data) {
            Ok(ping) => ping,
            Err(_) => return,
        };
        let pong = UnconnectedPong {
            time_ms: ping.time_ms,
            guid: self.world.guid,
            advertisement: self.world.config.advertisement.clone(),
        };
        self.world.raw_send(&pong.serialize(), from);
    }

    fn on_open_request_1(&mut self, from: SocketAddr, data: Bytes, now: Instant) {
        if self.world.config.max_incoming_connections == 0 {
            return;
        }
        let request = match OpenConnectionRequest1::deserialize(data) {
            Ok(request) => request,
            Err(_) => return,
        };
        if self.world.is_banned(from.ip(), now) {
            let refusal = ConnectionBanned {
                guid: self.world.guid,
            };
            self.world.raw_send(&refusal.serialize(), from);
            return;
        }
        if request.protocol_version != self.world.config.protocol_version {
            let refusal = IncompatibleProtocolVersion {
                server_protocol: self.world.config.protocol_version,
                guid: self.world.guid,
            };
            self.world.raw_send(&refusal.serialize(), from);
            return;
        }
        let mtu = request.probed_mtu().min(self.world.config.mtu);
        let reply = OpenConnectionReply1 {
            guid: self.world.guid,
            mtu,
        };
        self.world.raw_send(&reply.serialize(), from);
    }

    fn on_open_request_2(&mut self, from: SocketAddr, data: Bytes, now: Instant) {
        if self.world.config.max_incoming_connections == 0 {
            return;
        }
        let request = match OpenConnectionRequest2::deserialize(data) {
            Ok(request) => request,
            Err(_) => return,
        };
        if self.world.is_banned(from.ip(), now) {
            let refusal = ConnectionBanned {
                guid: self.world.guid,
            };
            self.world.raw_send(&refusal.serialize(), from);
            return;
        }
        if let Some(existing) = self.world.remotes.get(&from) {
            if existing.is_connected() {
                let refusal = AlreadyConnected {
                    guid: self.world.guid,
                };
                self.world.raw_send(&refusal.serialize(), from);
                return;
            }
            // Handshake retransmit: fall through and re-reply below.
        } else {
            let connected = self.world.remotes.len();
            if connected >= self.world.config.max_connections
                || connected >= self.world.config.max_incoming_connections
            {
                let refusal = NoFreeIncomingConnections {
                    guid: self.world.guid,
                };
                self.world.raw_send(&refusal.serialize(), from);
                return;
            }
            let mtu = request
                .mtu
                .min(self.world.config.mtu)
                .max(protocol::MIN_MTU);
            self.world.install_remote(
                from,
                request.guid,
                mtu,
                ConnectionState::UnverifiedSender,
                now,
            );
            debug!("incoming handshake from {} (guid {})", from, request.guid);
        }
        let mtu = self
            .world
            .remotes
            .get(&from)
            .map(|r| r.reliability.mtu() + protocol::UDP_HEADER_OVERHEAD)
            .unwrap_or(self.world.config.mtu);
        let reply = OpenConnectionReply2 {
            guid: self.world.guid,
            client_address: from,
            mtu,
        };
        self.world.raw_send(&reply.serialize(), from);
    }

    fn on_open_reply_1(&mut self, from: SocketAddr, data: Bytes, now: Instant) {
        let reply = match OpenConnectionReply1::deserialize(data) {
            Ok(reply) => reply,
            Err(_) => return,
        };
        let config_mtu = self.world.config.mtu;
        let retries = self.world.config.handshake_retries;
        if let Some(attempt) = self.world.attempts.get_mut(&from) {
            if matches!(attempt.state, AttemptState::RequestingMtu) {
                let mtu = reply.mtu.min(config_mtu).max(protocol::MIN_MTU);
                attempt.state = AttemptState::RequestingConnection { mtu };
                attempt.tries_left = retries;
                attempt.next_send = now;
            }
        }
    }

    fn on_open_reply_2(&mut self, from: SocketAddr, data: Bytes, now: Instant) {
        let reply = match OpenConnectionReply2::deserialize(data) {
            Ok(reply) => reply,
            Err(_) => return,
        };
        if self.world.attempts.remove(&from).is_none() {
            return; // unsolicited
        }
        self.world.external_address = Some(reply.client_address);

        // Cross-connect: if the remote already opened a server-side slot
        // for us, the side with the larger GUID takes the client role.
        if let Some(existing) = self.world.remotes.get_mut(&from) {
            if existing.state == ConnectionState::UnverifiedSender
                && self.world.guid.0 < reply.guid.0
            {
                debug!("cross-connect with {}: keeping server role", from);
                return;
            }
            existing.state = ConnectionState::RequestedConnection;
            existing.state_since = now;
        } else {
            let mtu = reply
                .mtu
                .min(self.world.config.mtu)
                .max(protocol::MIN_MTU);
            self.world.install_remote(
                from,
                reply.guid,
                mtu,
                ConnectionState::RequestedConnection,
                now,
            );
        }
        let request = ConnectionRequest {
            guid: self.world.guid,
            time_ms: self.world.wire_time_ms(now),
        };
        self.world.send_connected(
            from,
            request.serialize(),
            Priority::Immediate,
            Reliability::Reliable,
            0,
            None,
            now,
        );
    }

    fn on_connect_refused(&mut self, from: SocketAddr, data: Bytes, _now: Instant) {
        if self.world.attempts.remove(&from).is_none() {
            return;
        }
        debug!(
            "connection attempt to {} refused ({:?})",
            from,
            MessageId::of(&data)
        );
        self.world.push_local_packet(data, from, UNASSIGNED_GUID);
    }

    // ---------------------------------------------------------------
    // Connected messages surfaced by a reliability layer
    // ---------------------------------------------------------------

    fn handle_connected_event(
        &mut self,
        address: SocketAddr,
        data: Bytes,
        generated_locally: bool,
        now: Instant,
    ) {
        let guid = match self.world.remotes.get(&address) {
            Some(remote) => remote.guid,
            None => return,
        };
        if generated_locally {
            // Receipts and download progress pass straight through.
            let packet = Packet {
                data,
                address,
                guid,
                was_generated_locally: true,
            };
            self.dispatch_packet(packet, now);
            return;
        }
        match MessageId::of(&data) {
            Some(MessageId::ConnectedPing) => self.on_connected_ping(address, data, now),
            Some(MessageId::ConnectedPong) => self.on_connected_pong(address, data, now),
            Some(MessageId::ConnectionRequest) => self.on_connection_request(address, data, now),
            Some(MessageId::ConnectionRequestAccepted) => {
                self.on_connection_accepted(address, data, now)
            }
            Some(MessageId::NewIncomingConnection) => {
                self.on_new_incoming_connection(address, data, now)
            }
            Some(MessageId::DisconnectionNotification) => {
                self.finalize_close(address, DisconnectReason::Disconnected, now);
            }
            Some(MessageId::Timestamp) => {
                let data = self.rewrite_timestamp(address, data, now);
                let packet = Packet {
                    data,
                    address,
                    guid,
                    was_generated_locally: false,
                };
                self.dispatch_packet(packet, now);
            }
            _ => {
                let packet = Packet {
                    data,
                    address,
                    guid,
                    was_generated_locally: false,
                };
                self.dispatch_packet(packet, now);
            }
        }
    }

    fn on_connected_ping(&mut self, address: SocketAddr, data: Bytes, now: Instant) {
        let ping = match ConnectedPing::deserialize(data) {
            Ok(ping) => ping,
            Err(_) => return,
        };
        let pong = ConnectedPong {
            ping_time_ms: ping.time_ms,
            pong_time_ms: self.world.wire_time_ms(now),
        };
        self.world.send_connected(
            address,
            pong.serialize(),
            Priority::Immediate,
            Reliability::Unreliable,
            0,
            None,
            now,
        );
    }

    fn on_connected_pong(&mut self, address: SocketAddr, data: Bytes, now: Instant) {
        let pong = match ConnectedPong::deserialize(data) {
            Ok(pong) => pong,
            Err(_) => return,
        };
        let local_now = self.world.wire_time_ms(now);
        let rtt_ms = local_now.wrapping_sub(pong.ping_time_ms);
        if rtt_ms > 60_000 {
            return; // wrapped or nonsense
        }
        // remote_clock - local_clock: the pong timestamp plus half a trip
        // is the remote's clock at our receive instant.
        let remote_at_receive = pong.pong_time_ms.wrapping_add(rtt_ms / 2);
        let clock_differential = remote_at_receive.wrapping_sub(local_now) as i32 as i64;
        if let Some(remote) = self.world.remotes.get_mut(&address) {
            remote.record_ping(rtt_ms, clock_differential);
        }
    }

    fn on_connection_request(&mut self, address: SocketAddr, data: Bytes, now: Instant) {
        let request = match ConnectionRequest::deserialize(data) {
            Ok(request) => request,
            Err(_) => return,
        };
        let reply_time = self.world.wire_time_ms(now);
        let Some(remote) = self.world.remotes.get_mut(&address) else {
            return;
        };
        // A cross-connect can leave both sides in the client role; the
        // lower GUID yields and accepts as server.
        let yield_client_role = remote.state == ConnectionState::RequestedConnection
            && self.world.guid.0 < request.guid.0;
        match remote.state {
            _ if yield_client_role => {
                remote.guid = request.guid;
                remote.state = ConnectionState::HandshakeAccepted;
                remote.state_since = now;
                let system_index = remote.system_index;
                let accepted = ConnectionRequestAccepted {
                    client_address: address,
                    system_index,
                    request_time_ms: request.time_ms,
                    reply_time_ms: reply_time,
                };
                self.world.guid_index.insert(request.guid, address);
                self.world.send_connected(
                    address,
                    accepted.serialize(),
                    Priority::Immediate,
                    Reliability::ReliableOrdered,
                    0,
                    None,
                    now,
                );
            }
            ConnectionState::UnverifiedSender | ConnectionState::HandshakeAccepted => {
                remote.guid = request.guid;
                remote.state = ConnectionState::HandshakeAccepted;
                remote.state_since = now;
                let system_index = remote.system_index;
                let accepted = ConnectionRequestAccepted {
                    client_address: address,
                    system_index,
                    request_time_ms: request.time_ms,
                    reply_time_ms: reply_time,
                };
                self.world.guid_index.insert(request.guid, address);
                self.world.send_connected(
                    address,
                    accepted.serialize(),
                    Priority::Immediate,
                    Reliability::ReliableOrdered,
                    0,
                    None,
                    now,
                );
            }
            _ => {
                debug!(
                    "connection request from {} in state {:?}",
                    address, remote.state
                );
            }
        }
    }

    fn on_connection_accepted(&mut self, address: SocketAddr, data: Bytes, now: Instant) {
        let accepted = match ConnectionRequestAccepted::deserialize(data.clone()) {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let local_addr = self.world.socket.local_addr();
        let reply_time = self.world.wire_time_ms(now);
        let Some(remote) = self.world.remotes.get_mut(&address) else {
            return;
        };
        if remote.state != ConnectionState::RequestedConnection {
            return; // duplicate
        }
        remote.state = ConnectionState::Connected;
        remote.state_since = now;
        let guid = remote.guid;
        self.world.external_address = Some(accepted.client_address);

        // A wildcard-bound socket has no announceable internal address.
        let internal_addresses = if local_addr.ip().is_unspecified() {
            Vec::new()
        } else {
            vec![local_addr]
        };
        let confirm = NewIncomingConnection {
            server_address: address,
            internal_addresses,
            request_time_ms: accepted.reply_time_ms,
            reply_time_ms: reply_time,
        };
        self.world.send_connected(
            address,
            confirm.serialize(),
            Priority::Immediate,
            Reliability::ReliableOrdered,
            0,
            None,
            now,
        );
        self.send_ping(address, now);

        info!("connected to {} (guid {})", address, guid);
        self.with_plugins(now, |plugin, ctx| {
            plugin.on_new_connection(ctx, address, guid, false);
        });
        let packet = Packet {
            data,
            address,
            guid,
            was_generated_locally: false,
        };
        self.dispatch_packet(packet, now);
    }

    fn on_new_incoming_connection(&mut self, address: SocketAddr, data: Bytes, now: Instant) {
        let confirm = match NewIncomingConnection::deserialize(data.clone()) {
            Ok(confirm) => confirm,
            Err(_) => return,
        };
        let Some(remote) = self.world.remotes.get_mut(&address) else {
            return;
        };
        if remote.state != ConnectionState::HandshakeAccepted
            && remote.state != ConnectionState::UnverifiedSender
        {
            return; // duplicate
        }
        remote.state = ConnectionState::Connected;
        remote.state_since = now;
        remote.internal_addresses = confirm.internal_addresses.clone();
        let guid = remote.guid;

        info!("incoming connection from {} (guid {})", address, guid);
        self.send_ping(address, now);
        self.with_plugins(now, |plugin, ctx| {
            plugin.on_new_connection(ctx, address, guid, true);
        });
        let packet = Packet {
            data,
            address,
            guid,
            was_generated_locally: false,
        };
        self.dispatch_packet(packet, now);
    }

    /// `Timestamp` packets embed a remote wire time right after the id;
    /// rewrite it into our clock so the application never sees a foreign
    /// timebase.
    fn rewrite_timestamp(&self, address: SocketAddr, data: Bytes, _now: Instant) -> Bytes {
        if data.len() < 5 {
            return data;
        }
        let differential = match self.world.remotes.get(&address) {
            Some(remote) => remote.clock_differential_ms,
            None => 0,
        };
        let remote_time = u32::from_le_bytes(data[1..5].try_into().expect("length checked"));
        let local_time = (remote_time as i64 - differential) as u32;
        let mut rewritten = data.to_vec();
        rewritten[1..5].copy_from_slice(&local_time.to_le_bytes());
        Bytes::from(rewritten)
    }

    // ---------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------

    fn tick(&mut self, now: Instant) {
        self.tick_attempts(now);
        self.tick_remotes(now);
        self.with_plugins(now, |plugin, ctx| plugin.update(ctx));
    }

    fn tick_attempts(&mut self, now: Instant) {
        let retry_interval = self.world.config.handshake_retry_interval;
        let retries = self.world.config.handshake_retries;
        let config_mtu = self.world.config.mtu;
        let protocol_version = self.world.config.protocol_version;
        let our_guid = self.world.guid;

        let mut failed = Vec::new();
        let mut sends: Vec<(SocketAddr, Bytes)> = Vec::new();
        for (&address, attempt) in self.world.attempts.iter_mut() {
            if now < attempt.next_send {
                continue;
            }
            match attempt.state {
                AttemptState::RequestingMtu => {
                    if attempt.tries_left == 0 {
                        attempt.mtu_index += 1;
                        attempt.tries_left = retries;
                        if attempt.mtu_index >= MTU_CANDIDATES.len() {
                            failed.push(address);
                            continue;
                        }
                    }
                    let candidate = MTU_CANDIDATES[attempt.mtu_index].min(config_mtu);
                    let padding = candidate
                        .saturating_sub(protocol::UDP_HEADER_OVERHEAD)
                        .saturating_sub(OpenConnectionRequest1::BASE_LEN as u16);
                    let probe = OpenConnectionRequest1 {
                        protocol_version,
                        padding_len: padding,
                    };
                    sends.push((address, probe.serialize()));
                    attempt.tries_left -= 1;
                    attempt.next_send = now + retry_interval;
                }
                AttemptState::RequestingConnection { mtu } => {
                    if attempt.tries_left == 0 {
                        failed.push(address);
                        continue;
                    }
                    let request = OpenConnectionRequest2 {
                        server_address: address,
                        mtu,
                        guid: our_guid,
                    };
                    sends.push((address, request.serialize()));
                    attempt.tries_left -= 1;
                    attempt.next_send = now + retry_interval;
                }
            }
        }
        for (address, data) in sends {
            self.world.raw_send(&data, address);
        }
        for address in failed {
            self.world.attempts.remove(&address);
            warn!("connection attempt to {} failed", address);
            self.world.push_local_packet(
                Bytes::from_static(&[MessageId::ConnectionAttemptFailed as u8]),
                address,
                UNASSIGNED_GUID,
            );
        }
    }

    fn tick_remotes(&mut self, now: Instant) {
        let timeout = self.world.config.timeout;
        let ping_interval = self.world.config.ping_interval;
        let addrs: Vec<SocketAddr> = self.world.remotes.keys().copied().collect();

        for address in addrs {
            let mut wire = Vec::new();
            let mut events = Vec::new();
            let mut close: Option<DisconnectReason> = None;

            {
                let Some(remote) = self.world.remotes.get_mut(&address) else {
                    continue;
                };
                remote.reliability.update(now, &mut wire);
                while let Some(event) = remote.reliability.receive() {
                    events.push(event);
                }
                if remote.reliability.is_dead().is_some() {
                    close = Some(DisconnectReason::ConnectionLost);
                } else if now.duration_since(remote.reliability.time_last_datagram_arrived())
                    > timeout
                {
                    close = Some(DisconnectReason::ConnectionLost);
                } else if remote.state == ConnectionState::Disconnecting
                    && (!remote.reliability.has_outgoing()
                        || now.duration_since(remote.state_since) > DISCONNECT_GRACE)
                {
                    close = Some(DisconnectReason::ClosedLocally);
                } else if remote.state == ConnectionState::RequestedConnection
                    && now.duration_since(remote.state_since) > timeout
                {
                    close = Some(DisconnectReason::ConnectionLost);
                }
            }

            for datagram in &wire {
                self.world.raw_send(datagram, address);
                for plugin in self.plugins.iter_mut() {
                    plugin.on_raw_send(address, datagram);
                }
            }
            for event in events {
                self.handle_connected_event(address, event.data, event.generated_locally, now);
            }

            // Ping cadence on live connections.
            if close.is_none() {
                let due = self
                    .world
                    .remotes
                    .get(&address)
                    .is_some_and(|r| r.is_connected() && now >= r.next_ping);
                if due {
                    if let Some(remote) = self.world.remotes.get_mut(&address) {
                        remote.next_ping = now + ping_interval;
                    }
                    self.send_ping(address, now);
                }
            }

            if let Some(reason) = close {
                self.finalize_close(address, reason, now);
            }
        }
    }

    fn finalize_close(&mut self, address: SocketAddr, reason: DisconnectReason, now: Instant) {
        let Some(remote) = self.world.remotes.remove(&address) else {
            return;
        };
        let guid = remote.guid;
        self.world.guid_index.remove(&guid);
        info!("connection to {} closed ({:?})", address, reason);

        self.with_plugins(now, |plugin, ctx| {
            plugin.on_closed_connection(ctx, address, guid, reason);
        });

        let id = match reason {
            DisconnectReason::Disconnected => MessageId::DisconnectionNotification,
            DisconnectReason::ConnectionLost => MessageId::ConnectionLost,
            DisconnectReason::ClosedLocally => MessageId::DisconnectionNotification,
        };
        let was_generated_locally = reason != DisconnectReason::Disconnected;
        let packet = Packet {
            data: Bytes::copy_from_slice(&[id as u8]),
            address,
            guid,
            was_generated_locally,
        };
        self.dispatch_packet(packet, now);
    }
}
