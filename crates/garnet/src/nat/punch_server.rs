//! Punchthrough facilitator: tracks connected users, pairs them up on
//! request, collects each side's freshest external port, and schedules the
//! time-synchronized simultaneous send.

use crate::guid::Guid;
use crate::message_id::MessageId;
use crate::nat::{
    AlreadyInProgress, ConnectAtTime, ConnectionToTargetLost, GetMostRecentPort, PortProbe,
    PortProbeReply, PunchthroughRequest, RespondBoundAddresses, TargetNotConnected,
    TargetUnresponsive,
};
use crate::peer::Packet;
use crate::plugin::{DisconnectReason, Plugin, PluginAction, PluginContext};
use crate::protocol::offline::OutOfBandInternal;
use crate::protocol::wire_message::WireMessage;
use crate::protocol::{Priority, Reliability};
use crate::socket::NetSocket;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// An attempt stuck collecting ports longer than this gets both parties a
/// `NatTargetUnresponsive`. Formerly 5 s upstream, which produced false
/// positives.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Rendezvous delay when either party's ping is unknown.
const UNKNOWN_PING_DELAY_MS: u32 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    NotStarted,
    GettingRecentPorts,
}

struct Attempt {
    sender: Guid,
    recipient: Guid,
    state: AttemptState,
    started: Instant,
    sender_port: Option<u16>,
    recipient_port: Option<u16>,
}

struct User {
    address: SocketAddr,
    ready: bool,
    /// Sessions this user participates in, in arrival order.
    queue: VecDeque<u16>,
}

pub struct PunchthroughServer {
    /// Port for the stride-measurement socket; zero picks one.
    alternate_port: u16,
    alternate: Option<NetSocket>,
    users: HashMap<Guid, User>,
    attempts: HashMap<u16, Attempt>,
    next_session_id: u16,
}

impl PunchthroughServer {
    pub fn new(alternate_port: u16) -> Self {
        Self {
            alternate_port,
            alternate: None,
            users: HashMap::new(),
            attempts: HashMap::new(),
            next_session_id: 0,
        }
    }

    fn allocate_session_id(&mut self) -> u16 {
        loop {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
            if !self.attempts.contains_key(&id) {
                return id;
            }
        }
    }

    fn send_to_user(
        &self,
        ctx: &mut PluginContext<'_>,
        guid: Guid,
        data: &[u8],
    ) {
        if let Some(user) = self.users.get(&guid) {
            ctx.send(
                user.address,
                data,
                Priority::High,
                Reliability::ReliableOrdered,
                0,
            );
        }
    }

    /// Starts the head-of-queue attempt for `guid` if both parties are
    /// ready.
    fn start_next_for(&mut self, ctx: &mut PluginContext<'_>, guid: Guid) {
        let session_id = loop {
            let Some(user) = self.users.get_mut(&guid) else {
                return;
            };
            match user.queue.front().copied() {
                Some(session_id) if !self.attempts.contains_key(&session_id) => {
                    // Stale entry from a finished attempt.
                    user.queue.pop_front();
                }
                Some(session_id) => break session_id,
                None => return,
            }
        };

        let (sender, recipient, state) = {
            let attempt = &self.attempts[&session_id];
            (attempt.sender, attempt.recipient, attempt.state)
        };
        if state != AttemptState::NotStarted {
            return;
        }
        let both_ready = self.users.get(&sender).is_some_and(|u| u.ready)
            && self.users.get(&recipient).is_some_and(|u| u.ready);
        if !both_ready {
            return;
        }

        if let Some(attempt) = self.attempts.get_mut(&session_id) {
            attempt.state = AttemptState::GettingRecentPorts;
            attempt.started = ctx.now();
        }
        for participant in [sender, recipient] {
            if let Some(user) = self.users.get_mut(&participant) {
                user.ready = false;
            }
        }
        debug!(
            "session {}: collecting ports from {} and {}",
            session_id, sender, recipient
        );
        let query = GetMostRecentPort {
            session_id,
            port: 0,
        }
        .serialize();
        self.send_to_user(ctx, sender, &query);
        self.send_to_user(ctx, recipient, &query);
    }

    /// Both ports are in: schedule the rendezvous.
    fn schedule_connect(&mut self, ctx: &mut PluginContext<'_>, session_id: u16) {
        let Some(attempt) = self.attempts.remove(&session_id) else {
            return;
        };
        let (Some(sender_port), Some(recipient_port)) =
            (attempt.sender_port, attempt.recipient_port)
        else {
            return;
        };
        let sender_addr = self.users.get(&attempt.sender).map(|u| u.address);
        let recipient_addr = self.users.get(&attempt.recipient).map(|u| u.address);
        let (Some(sender_addr), Some(recipient_addr)) = (sender_addr, recipient_addr) else {
            return;
        };

        let sender_ping = ctx.average_ping_ms(sender_addr);
        let recipient_ping = ctx.average_ping_ms(recipient_addr);
        let delay_ms = match (sender_ping, recipient_ping) {
            (Some(a), Some(b)) => (4 * a.max(b)).max(100),
            _ => UNKNOWN_PING_DELAY_MS,
        };
        let time_ms = ctx.wire_time_ms().wrapping_add(delay_ms);
        info!(
            "session {}: connect at +{} ms ({} <-> {})",
            session_id, delay_ms, attempt.sender, attempt.recipient
        );

        let sender_internal = ctx
            .internal_addresses_of(attempt.sender)
            .unwrap_or_default();
        let recipient_internal = ctx
            .internal_addresses_of(attempt.recipient)
            .unwrap_or_default();

        let to_recipient = ConnectAtTime {
            session_id,
            time_ms,
            target_guid: attempt.sender,
            target_public: SocketAddr::new(sender_addr.ip(), sender_port),
            target_internal: sender_internal,
            we_are_sender: false,
        }
        .serialize();
        let to_sender = ConnectAtTime {
            session_id,
            time_ms,
            target_guid: attempt.recipient,
            target_public: SocketAddr::new(recipient_addr.ip(), recipient_port),
            target_internal: recipient_internal,
            we_are_sender: true,
        }
        .serialize();
        self.send_to_user(ctx, attempt.sender, &to_sender);
        self.send_to_user(ctx, attempt.recipient, &to_recipient);
    }

    fn poll_alternate_socket(&mut self, ctx: &mut PluginContext<'_>) {
        let mut replies = Vec::new();
        if let Some(alternate) = &self.alternate {
            while let Some(inbound) = alternate.poll_recv() {
                let Ok(envelope) = OutOfBandInternal::deserialize(inbound.data.clone()) else {
                    continue;
                };
                let Ok(probe) = PortProbe::deserialize(envelope.payload.clone()) else {
                    continue;
                };
                let Some(user) = self.users.get(&probe.guid) else {
                    debug!("port probe from unknown guid {}", probe.guid);
                    continue;
                };
                let reply = PortProbeReply {
                    first_port: user.address.port(),
                    second_port: inbound.from.port(),
                };
                replies.push((probe.guid, reply.serialize()));
            }
        }
        for (guid, reply) in replies {
            self.send_to_user(ctx, guid, &reply);
        }
    }

    fn sweep_stuck_attempts(&mut self, ctx: &mut PluginContext<'_>) {
        let now = ctx.now();
        let stuck: Vec<u16> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| {
                attempt.state == AttemptState::GettingRecentPorts
                    && now.duration_since(attempt.started) > ATTEMPT_TIMEOUT
            })
            .map(|(&session_id, _)| session_id)
            .collect();
        for session_id in stuck {
            let Some(attempt) = self.attempts.remove(&session_id) else {
                continue;
            };
            warn!(
                "session {}: port collection timed out ({} <-> {})",
                session_id, attempt.sender, attempt.recipient
            );
            let to_sender = TargetUnresponsive {
                guid: attempt.recipient,
            }
            .serialize();
            let to_recipient = TargetUnresponsive {
                guid: attempt.sender,
            }
            .serialize();
            self.send_to_user(ctx, attempt.sender, &to_sender);
            self.send_to_user(ctx, attempt.recipient, &to_recipient);
            for participant in [attempt.sender, attempt.recipient] {
                if let Some(user) = self.users.get_mut(&participant) {
                    user.ready = true;
                }
                self.start_next_for(ctx, participant);
            }
        }
    }
}

impl Plugin for PunchthroughServer {
    fn name(&self) -> &'static str {
        "punchthrough-server"
    }

    fn on_attach(&mut self, _ctx: &mut PluginContext<'_>) {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.alternate_port)
            .parse()
            .expect("valid literal");
        match NetSocket::bind_sync(addr, 64) {
            Ok(socket) => {
                info!("stride socket bound on {}", socket.local_addr());
                self.alternate = Some(socket);
            }
            Err(e) => warn!("stride socket unavailable: {}", e),
        }
    }

    fn update(&mut self, ctx: &mut PluginContext<'_>) {
        self.poll_alternate_socket(ctx);
        self.sweep_stuck_attempts(ctx);
    }

    fn on_new_connection(
        &mut self,
        _ctx: &mut PluginContext<'_>,
        address: SocketAddr,
        guid: Guid,
        _incoming: bool,
    ) {
        self.users.insert(
            guid,
            User {
                address,
                ready: true,
                queue: VecDeque::new(),
            },
        );
    }

    fn on_closed_connection(
        &mut self,
        ctx: &mut PluginContext<'_>,
        _address: SocketAddr,
        guid: Guid,
        _reason: DisconnectReason,
    ) {
        self.users.remove(&guid);
        let involved: Vec<u16> = self
            .attempts
            .iter()
            .filter(|(_, a)| a.sender == guid || a.recipient == guid)
            .map(|(&id, _)| id)
            .collect();
        for session_id in involved {
            let Some(attempt) = self.attempts.remove(&session_id) else {
                continue;
            };
            let other = if attempt.sender == guid {
                attempt.recipient
            } else {
                attempt.sender
            };
            let note = ConnectionToTargetLost { guid }.serialize();
            self.send_to_user(ctx, other, &note);
            if let Some(user) = self.users.get_mut(&other) {
                user.ready = true;
            }
            self.start_next_for(ctx, other);
        }
    }

    fn on_packet(&mut self, ctx: &mut PluginContext<'_>, packet: &Packet) -> PluginAction {
        match packet.id() {
            Some(MessageId::NatPunchthroughRequest) => {
                let Ok(request) = PunchthroughRequest::deserialize(packet.data.clone()) else {
                    return PluginAction::StopAndDiscard;
                };
                let sender = packet.guid;
                let recipient = request.target_guid;
                if !self.users.contains_key(&recipient) || !ctx.is_connected(packet.address) {
                    let note = TargetNotConnected { guid: recipient }.serialize();
                    self.send_to_user(ctx, sender, &note);
                    return PluginAction::Stop;
                }
                // Duplicate suppression on the ordered (sender, target)
                // pair: overlapping retries of the same request must not
                // spawn a second session.
                let duplicate = self
                    .attempts
                    .values()
                    .any(|a| a.sender == sender && a.recipient == recipient);
                if duplicate {
                    let note = AlreadyInProgress { guid: recipient }.serialize();
                    self.send_to_user(ctx, sender, &note);
                    return PluginAction::Stop;
                }
                let session_id = self.allocate_session_id();
                debug!(
                    "session {}: {} requests punchthrough to {}",
                    session_id, sender, recipient
                );
                self.attempts.insert(
                    session_id,
                    Attempt {
                        sender,
                        recipient,
                        state: AttemptState::NotStarted,
                        started: ctx.now(),
                        sender_port: None,
                        recipient_port: None,
                    },
                );
                for participant in [sender, recipient] {
                    if let Some(user) = self.users.get_mut(&participant) {
                        user.queue.push_back(session_id);
                    }
                }
                self.start_next_for(ctx, sender);
                PluginAction::Stop
            }
            Some(MessageId::NatGetMostRecentPort) => {
                let Ok(reply) = GetMostRecentPort::deserialize(packet.data.clone()) else {
                    return PluginAction::StopAndDiscard;
                };
                let Some(attempt) = self.attempts.get_mut(&reply.session_id) else {
                    // Concurrent attempts must not be confused: a stale
                    // session id is simply dropped.
                    return PluginAction::Stop;
                };
                if attempt.state != AttemptState::GettingRecentPorts {
                    return PluginAction::Stop;
                }
                if packet.guid == attempt.sender {
                    attempt.sender_port = Some(reply.port);
                } else if packet.guid == attempt.recipient {
                    attempt.recipient_port = Some(reply.port);
                } else {
                    return PluginAction::Stop;
                }
                if attempt.sender_port.is_some() && attempt.recipient_port.is_some() {
                    self.schedule_connect(ctx, reply.session_id);
                }
                PluginAction::Stop
            }
            Some(MessageId::NatClientReady) => {
                let guid = packet.guid;
                if let Some(user) = self.users.get_mut(&guid) {
                    user.ready = true;
                }
                self.start_next_for(ctx, guid);
                PluginAction::Stop
            }
            Some(MessageId::NatRequestBoundAddresses) => {
                let alternate = self
                    .alternate
                    .as_ref()
                    .map(|socket| socket.local_addr())
                    .unwrap_or_else(|| ctx.local_addr());
                let respond = RespondBoundAddresses {
                    primary: ctx.local_addr(),
                    alternate,
                }
                .serialize();
                ctx.send(
                    packet.address,
                    &respond,
                    Priority::High,
                    Reliability::ReliableOrdered,
                    0,
                );
                PluginAction::Stop
            }
            _ => PluginAction::Continue,
        }
    }
}
