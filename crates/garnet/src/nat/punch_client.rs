//! Punchthrough client: asks a facilitator to coordinate a
//! time-synchronized exchange of UDP pings with another client so both
//! NATs open a path, then floods the discovered address until the hole is
//! confirmed in both directions.

use crate::guid::Guid;
use crate::message_id::MessageId;
use crate::nat::{
    AlreadyInProgress, ClientReady, ConnectAtTime, ConnectionToTargetLost,
    EstablishBidirectional, EstablishUnidirectional, GetMostRecentPort, PortProbe,
    PortProbeReply, PunchthroughFailed, PunchthroughRequest, PunchthroughSucceeded,
    RequestBoundAddresses, RespondBoundAddresses, TargetNotConnected, TargetUnresponsive,
};
use crate::peer::Packet;
use crate::plugin::{DisconnectReason, Plugin, PluginAction, PluginContext};
use crate::protocol::wire_message::WireMessage;
use crate::protocol::{Priority, Reliability};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Tunables for the ping sequence. The defaults are calibrated for
/// consumer NATs; the fixed-port retry accounting interacts with the
/// sweep budget, so change them together.
#[derive(Debug, Clone)]
pub struct PunchthroughConfig {
    pub time_between_punch_attempts_internal: Duration,
    pub time_between_punch_attempts_external: Duration,
    pub udp_sends_per_port_internal: u32,
    pub udp_sends_per_port_external: u32,
    pub internal_ip_wait_after_attempts: Duration,
    pub external_ip_wait_after_first_ttl: Duration,
    pub external_ip_wait_between_ports: Duration,
    pub external_ip_wait_after_all_attempts: Duration,
    /// Ports swept beyond the reported one, scaled by the port stride.
    pub max_predictive_port_range: u16,
    pub maximum_internal_ids_to_check: usize,
    /// Requeue one failed attempt before reporting failure.
    pub retry_on_failure: bool,
}

impl Default for PunchthroughConfig {
    fn default() -> Self {
        Self {
            time_between_punch_attempts_internal: Duration::from_millis(25),
            time_between_punch_attempts_external: Duration::from_millis(250),
            udp_sends_per_port_internal: 2,
            udp_sends_per_port_external: 8,
            internal_ip_wait_after_attempts: Duration::from_millis(100),
            external_ip_wait_after_first_ttl: Duration::from_millis(100),
            external_ip_wait_between_ports: Duration::from_millis(250),
            external_ip_wait_after_all_attempts: Duration::from_millis(1000),
            max_predictive_port_range: 2,
            maximum_internal_ids_to_check: 5,
            retry_on_failure: false,
        }
    }
}

enum ClientCommand {
    OpenNat {
        target: Guid,
        facilitator: SocketAddr,
    },
    DiscoverStride {
        facilitator: SocketAddr,
    },
}

/// Cheap cloneable handle for driving the plugin from application code.
#[derive(Clone)]
pub struct PunchthroughHandle {
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl PunchthroughHandle {
    /// Requests a punchthrough to `target` via the connected facilitator.
    /// The outcome surfaces as a `NatPunchthroughSucceeded` or
    /// `NatPunchthroughFailed` packet.
    pub fn open_nat(&self, target: Guid, facilitator: SocketAddr) {
        let _ = self.tx.send(ClientCommand::OpenNat { target, facilitator });
    }

    /// Measures the local NAT's port stride against the facilitator's
    /// alternate socket; improves external port prediction.
    pub fn discover_port_stride(&self, facilitator: SocketAddr) {
        let _ = self.tx.send(ClientCommand::DiscoverStride { facilitator });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingMode {
    WaitingForRendezvous,
    TestingInternalIps,
    WaitingForInternalIpsResponse,
    TestingExternalIps,
    WaitingAfterAllAttempts,
    PunchingFixedPort,
}

struct PingSequence {
    facilitator: SocketAddr,
    session_id: u16,
    target_guid: Guid,
    target_public: SocketAddr,
    target_internal: Vec<SocketAddr>,
    we_are_sender: bool,
    mode: PingMode,
    start_at: Instant,
    next_action: Instant,
    attempt_count: u32,
    retry_count: u32,
    punching_fixed_port_attempts: u32,
    locked: Option<SocketAddr>,
}

struct OutstandingRequest {
    target: Guid,
    facilitator: SocketAddr,
    sent_at: Instant,
}

/// How long the client waits for the facilitator to move an accepted
/// request forward before failing it locally.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Rendezvous fallback when the facilitator's clock offset is unknown.
const RENDEZVOUS_FALLBACK: Duration = Duration::from_millis(1500);

pub struct PunchthroughClient {
    config: PunchthroughConfig,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    pending: VecDeque<(Guid, SocketAddr)>,
    outstanding: Option<OutstandingRequest>,
    active: Option<PingSequence>,
    failures: HashMap<Guid, u32>,
    port_stride: Option<i32>,
}

impl PunchthroughClient {
    pub fn new(config: PunchthroughConfig) -> (Self, PunchthroughHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                config,
                commands,
                pending: VecDeque::new(),
                outstanding: None,
                active: None,
                failures: HashMap::new(),
                port_stride: None,
            },
            PunchthroughHandle { tx },
        )
    }

    pub fn port_stride(&self) -> Option<i32> {
        self.port_stride
    }

    fn send_request(&mut self, ctx: &mut PluginContext<'_>, target: Guid, facilitator: SocketAddr) {
        let request = PunchthroughRequest {
            target_guid: target,
        };
        if !ctx.send(
            facilitator,
            &request.serialize(),
            Priority::High,
            Reliability::ReliableOrdered,
            0,
        ) {
            warn!("punchthrough request dropped: not connected to {}", facilitator);
            self.push_failure(ctx, target, facilitator);
            return;
        }
        self.outstanding = Some(OutstandingRequest {
            target,
            facilitator,
            sent_at: ctx.now(),
        });
    }

    fn push_failure(&mut self, ctx: &mut PluginContext<'_>, target: Guid, facilitator: SocketAddr) {
        let failures = self.failures.entry(target).or_insert(0);
        *failures += 1;
        if self.config.retry_on_failure && *failures == 1 {
            debug!("retrying punchthrough to {}", target);
            self.pending.push_front((target, facilitator));
            return;
        }
        self.failures.remove(&target);
        let packet = PunchthroughFailed { guid: target }.serialize();
        ctx.push_packet(packet, facilitator, target);
    }

    fn finish_success(&mut self, ctx: &mut PluginContext<'_>, sp_locked: SocketAddr) {
        let Some(sp) = self.active.take() else {
            return;
        };
        info!(
            "punchthrough to {} succeeded via {}",
            sp.target_guid, sp_locked
        );
        // First success teaches us the remote's stride; ours stays as
        // measured.
        self.failures.remove(&sp.target_guid);
        let packet = PunchthroughSucceeded {
            guid: sp.target_guid,
            we_are_sender: sp.we_are_sender,
        }
        .serialize();
        ctx.push_packet(packet, sp_locked, sp.target_guid);
        self.notify_ready(ctx, sp.facilitator);
    }

    fn finish_failure(&mut self, ctx: &mut PluginContext<'_>) {
        let Some(sp) = self.active.take() else {
            return;
        };
        debug!("punchthrough to {} exhausted all attempts", sp.target_guid);
        self.notify_ready(ctx, sp.facilitator);
        self.push_failure(ctx, sp.target_guid, sp.facilitator);
    }

    fn notify_ready(&mut self, ctx: &mut PluginContext<'_>, facilitator: SocketAddr) {
        ctx.send(
            facilitator,
            &ClientReady.serialize(),
            Priority::High,
            Reliability::ReliableOrdered,
            0,
        );
    }

    /// External port predicted for sweep step `attempt`.
    fn predicted_port(&self, base: u16, attempt: u32) -> u16 {
        let stride = self.port_stride.unwrap_or(1).max(1) as i64;
        let port = base as i64 + stride * attempt as i64;
        port.rem_euclid(65_536) as u16
    }

    fn drive_sequence(&mut self, ctx: &mut PluginContext<'_>) {
        let now = ctx.now();
        let config = self.config.clone();
        let Some(sp) = self.active.as_mut() else {
            return;
        };
        if now < sp.next_action {
            return;
        }
        match sp.mode {
            PingMode::WaitingForRendezvous => {
                if now < sp.start_at {
                    sp.next_action = sp.start_at;
                    return;
                }
                sp.attempt_count = 0;
                sp.retry_count = 0;
                if sp.target_internal.is_empty() || config.maximum_internal_ids_to_check == 0 {
                    sp.mode = PingMode::TestingExternalIps;
                } else {
                    sp.mode = PingMode::TestingInternalIps;
                }
                sp.next_action = now;
            }
            PingMode::TestingInternalIps => {
                let ping = EstablishUnidirectional {
                    session_id: sp.session_id,
                }
                .serialize();
                let targets: Vec<SocketAddr> = sp
                    .target_internal
                    .iter()
                    .take(config.maximum_internal_ids_to_check)
                    .copied()
                    .collect();
                sp.retry_count += 1;
                let done = sp.retry_count >= config.udp_sends_per_port_internal;
                if done {
                    sp.retry_count = 0;
                    sp.mode = PingMode::WaitingForInternalIpsResponse;
                    sp.next_action = now + config.internal_ip_wait_after_attempts;
                } else {
                    sp.next_action = now + config.time_between_punch_attempts_internal;
                }
                for target in targets {
                    trace!("punch ping to internal {}", target);
                    ctx.send_out_of_band(target, &ping);
                }
            }
            PingMode::WaitingForInternalIpsResponse => {
                sp.mode = PingMode::TestingExternalIps;
                sp.attempt_count = 0;
                sp.retry_count = 0;
                sp.next_action = now;
            }
            PingMode::TestingExternalIps => {
                let base_port = sp.target_public.port();
                let ip = sp.target_public.ip();
                let session_id = sp.session_id;
                let attempt = sp.attempt_count;
                let first_send_to_port = sp.retry_count == 0;

                // Per port: one TTL-limited opener, then the full quota of
                // regular pings. retry_count 0 is the opener; values
                // 1..=udp_sends_per_port_external are the regular sends.
                if first_send_to_port {
                    sp.retry_count = 1;
                    sp.next_action = now + config.external_ip_wait_after_first_ttl;
                } else {
                    sp.retry_count += 1;
                    if sp.retry_count > config.udp_sends_per_port_external {
                        // This action carries the last regular ping for the
                        // port; the next one opens the following predicted
                        // port.
                        sp.retry_count = 0;
                        sp.attempt_count += 1;
                        if sp.attempt_count > config.max_predictive_port_range as u32 {
                            sp.mode = PingMode::WaitingAfterAllAttempts;
                            sp.next_action = now + config.external_ip_wait_after_all_attempts;
                        } else {
                            sp.next_action = now + config.external_ip_wait_between_ports;
                        }
                    } else {
                        sp.next_action = now + config.time_between_punch_attempts_external;
                    }
                }

                let port = self.predicted_port(base_port, attempt);
                let target = SocketAddr::new(ip, port);
                let ping = EstablishUnidirectional { session_id }.serialize();
                if first_send_to_port {
                    // The TTL=2 datagram dies before the remote NAT can
                    // blacklist the flow, but still opens ours outbound.
                    trace!("ttl punch to {}", target);
                    ctx.send_out_of_band_with_ttl(target, &ping, 2);
                } else {
                    trace!("punch ping to {}", target);
                    ctx.send_out_of_band(target, &ping);
                }
            }
            PingMode::WaitingAfterAllAttempts => {
                self.finish_failure(ctx);
            }
            PingMode::PunchingFixedPort => {
                let Some(locked) = sp.locked else {
                    self.finish_failure(ctx);
                    return;
                };
                sp.retry_count += 1;
                if sp.retry_count >= sp.punching_fixed_port_attempts {
                    sp.mode = PingMode::WaitingAfterAllAttempts;
                    sp.next_action = now + config.external_ip_wait_after_all_attempts;
                } else if sp.retry_count % config.udp_sends_per_port_external == 0 {
                    sp.next_action = now + config.external_ip_wait_between_ports;
                } else {
                    sp.next_action = now + config.time_between_punch_attempts_external;
                }
                let confirm = EstablishBidirectional {
                    session_id: sp.session_id,
                }
                .serialize();
                trace!("fixed-port punch to {}", locked);
                ctx.send_out_of_band(locked, &confirm);
            }
        }
    }
}

impl Plugin for PunchthroughClient {
    fn name(&self) -> &'static str {
        "punchthrough-client"
    }

    fn update(&mut self, ctx: &mut PluginContext<'_>) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ClientCommand::OpenNat { target, facilitator } => {
                    self.pending.push_back((target, facilitator));
                }
                ClientCommand::DiscoverStride { facilitator } => {
                    ctx.send(
                        facilitator,
                        &RequestBoundAddresses.serialize(),
                        Priority::High,
                        Reliability::ReliableOrdered,
                        0,
                    );
                }
            }
        }

        // A request that the facilitator never progressed fails locally.
        if let Some(outstanding) = &self.outstanding {
            if ctx.now().duration_since(outstanding.sent_at) > REQUEST_TIMEOUT {
                let target = outstanding.target;
                let facilitator = outstanding.facilitator;
                self.outstanding = None;
                self.push_failure(ctx, target, facilitator);
            }
        }

        if self.active.is_none() && self.outstanding.is_none() {
            if let Some((target, facilitator)) = self.pending.pop_front() {
                self.send_request(ctx, target, facilitator);
            }
        }

        self.drive_sequence(ctx);
    }

    fn on_packet(&mut self, ctx: &mut PluginContext<'_>, packet: &Packet) -> PluginAction {
        match packet.id() {
            Some(MessageId::NatGetMostRecentPort) => {
                let Ok(query) = GetMostRecentPort::deserialize(packet.data.clone()) else {
                    return PluginAction::StopAndDiscard;
                };
                // Our freshest external port, biased one stride up when the
                // stride is known: the next outbound flow will likely land
                // there.
                let external = ctx
                    .external_address()
                    .map(|addr| addr.port())
                    .unwrap_or_else(|| ctx.local_addr().port());
                let biased = match self.port_stride {
                    Some(stride) => {
                        (external as i64 + stride as i64).rem_euclid(65_536) as u16
                    }
                    None => external,
                };
                let reply = GetMostRecentPort {
                    session_id: query.session_id,
                    port: biased,
                };
                ctx.send(
                    packet.address,
                    &reply.serialize(),
                    Priority::High,
                    Reliability::ReliableOrdered,
                    0,
                );
                PluginAction::Stop
            }
            Some(MessageId::NatConnectAtTime) => {
                let Ok(go) = ConnectAtTime::deserialize(packet.data.clone()) else {
                    return PluginAction::StopAndDiscard;
                };
                self.outstanding = None;
                let now = ctx.now();
                // Convert the facilitator's clock to ours via the ping
                // differential; without one, fall back to a fixed delay.
                let start_at = match ctx.clock_differential_ms(packet.address) {
                    Some(differential) => {
                        let facilitator_now = ctx.wire_time_ms() as i64 + differential;
                        let delay_ms = (go.time_ms as i64 - facilitator_now).clamp(0, 10_000);
                        now + Duration::from_millis(delay_ms as u64)
                    }
                    None => now + RENDEZVOUS_FALLBACK,
                };
                debug!(
                    "rendezvous with {} at +{:?} (session {})",
                    go.target_guid,
                    start_at.duration_since(now),
                    go.session_id
                );
                self.active = Some(PingSequence {
                    facilitator: packet.address,
                    session_id: go.session_id,
                    target_guid: go.target_guid,
                    target_public: go.target_public,
                    target_internal: go.target_internal,
                    we_are_sender: go.we_are_sender,
                    mode: PingMode::WaitingForRendezvous,
                    start_at,
                    next_action: now,
                    attempt_count: 0,
                    retry_count: 0,
                    punching_fixed_port_attempts: 0,
                    locked: None,
                });
                PluginAction::Stop
            }
            Some(MessageId::NatTargetNotConnected) => {
                if let Ok(note) = TargetNotConnected::deserialize(packet.data.clone()) {
                    self.outstanding = None;
                    self.failures.remove(&note.guid);
                }
                PluginAction::Continue // surfaced to the application
            }
            Some(MessageId::NatTargetUnresponsive) => {
                if let Ok(note) = TargetUnresponsive::deserialize(packet.data.clone()) {
                    self.outstanding = None;
                    self.failures.remove(&note.guid);
                }
                PluginAction::Continue
            }
            Some(MessageId::NatConnectionToTargetLost) => {
                if let Ok(note) = ConnectionToTargetLost::deserialize(packet.data.clone()) {
                    self.outstanding = None;
                    if self
                        .active
                        .as_ref()
                        .is_some_and(|sp| sp.target_guid == note.guid)
                    {
                        self.active = None;
                    }
                }
                PluginAction::Continue
            }
            Some(MessageId::NatAlreadyInProgress) => {
                let _ = AlreadyInProgress::deserialize(packet.data.clone());
                self.outstanding = None;
                PluginAction::Continue
            }
            Some(MessageId::NatRespondBoundAddresses) => {
                if let Ok(bound) = RespondBoundAddresses::deserialize(packet.data.clone()) {
                    // The facilitator may be bound to a wildcard address;
                    // reuse the address we actually talk to.
                    let target =
                        SocketAddr::new(packet.address.ip(), bound.alternate.port());
                    let probe = PortProbe { guid: ctx.guid() }.serialize();
                    ctx.send_out_of_band(target, &probe);
                }
                PluginAction::Stop
            }
            Some(MessageId::NatPortProbeReply) => {
                if let Ok(reply) = PortProbeReply::deserialize(packet.data.clone()) {
                    let stride = reply.second_port as i32 - reply.first_port as i32;
                    info!(
                        "port stride measured: {} ({} -> {})",
                        stride, reply.first_port, reply.second_port
                    );
                    self.port_stride = Some(stride);
                }
                PluginAction::Stop
            }
            _ => PluginAction::Continue,
        }
    }

    fn on_out_of_band(
        &mut self,
        ctx: &mut PluginContext<'_>,
        from: SocketAddr,
        _guid: Guid,
        payload: &Bytes,
    ) -> bool {
        let config_sends = self.config.udp_sends_per_port_external;
        let range = self.config.max_predictive_port_range as u32;
        match MessageId::of(payload) {
            Some(MessageId::NatEstablishUnidirectional) => {
                let Ok(ping) = EstablishUnidirectional::deserialize(payload.clone()) else {
                    return true;
                };
                let Some(sp) = self.active.as_mut() else {
                    return true;
                };
                if ping.session_id != sp.session_id {
                    return true;
                }
                // The path works inbound; lock on and confirm until the
                // other side hears us too.
                if sp.mode != PingMode::PunchingFixedPort {
                    debug!("inbound punch from {}, locking on", from);
                    sp.mode = PingMode::PunchingFixedPort;
                    sp.locked = Some(from);
                    // Keep the remaining time budget compatible with the
                    // sweep that got us here.
                    sp.retry_count += sp.attempt_count * config_sends;
                    sp.punching_fixed_port_attempts = config_sends * (range + 1);
                    sp.next_action = ctx.now();
                } else {
                    sp.locked = Some(from);
                }
                let confirm = EstablishBidirectional {
                    session_id: sp.session_id,
                }
                .serialize();
                ctx.send_out_of_band(from, &confirm);
                true
            }
            Some(MessageId::NatEstablishBidirectional) => {
                let Ok(confirm) = EstablishBidirectional::deserialize(payload.clone()) else {
                    return true;
                };
                let matches = self
                    .active
                    .as_ref()
                    .is_some_and(|sp| sp.session_id == confirm.session_id);
                if matches {
                    // Final courtesy confirm so the other side resolves
                    // even if our earlier confirms were lost.
                    let reply = EstablishBidirectional {
                        session_id: confirm.session_id,
                    }
                    .serialize();
                    ctx.send_out_of_band(from, &reply);
                    self.finish_success(ctx, from);
                }
                true
            }
            _ => false,
        }
    }

    fn on_closed_connection(
        &mut self,
        ctx: &mut PluginContext<'_>,
        address: SocketAddr,
        _guid: Guid,
        _reason: DisconnectReason,
    ) {
        // Losing the facilitator mid-attempt fails the attempt.
        if self
            .active
            .as_ref()
            .is_some_and(|sp| sp.facilitator == address)
        {
            self.finish_failure(ctx);
        }
        if self
            .outstanding
            .as_ref()
            .is_some_and(|o| o.facilitator == address)
        {
            let target = self.outstanding.take().map(|o| o.target);
            if let Some(target) = target {
                self.push_failure(ctx, target, address);
            }
        }
    }
}
