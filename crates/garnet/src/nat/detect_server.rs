//! NAT type detection, server side. Besides the peer's own port, four
//! probe sockets are bound; which of their datagrams reach the client, and
//! from where the client can reach them, pins down the NAT class:
//!
//! 1. socket 4 sends to the client's second UDP socket; arrival means no
//!    NAT at all;
//! 2. socket 2 (different address characteristics, different port) sends
//!    to the client's main port; arrival means full cone;
//! 3. socket 1 (port the client has never been contacted from) sends to
//!    the main port; arrival means address restricted;
//! 4. otherwise the client is told to send to socket 3: source address
//!    matching its connection address means port restricted, a different
//!    port means symmetric.
//!
//! Every probe is sent twice, spaced `3 × last ping + 50 ms`, to ride out
//! a single loss.

use crate::guid::Guid;
use crate::message_id::MessageId;
use crate::nat::{
    DETECT_STEP_ADDRESS_RESTRICTED, DETECT_STEP_FULL_CONE, DETECT_STEP_OPEN,
    DETECT_STEP_PORT_CHECK, DetectionRequest, DetectionResult, DetectionSendToTarget,
    DetectionTest, NatType,
};
use crate::peer::Packet;
use crate::plugin::{DisconnectReason, Plugin, PluginAction, PluginContext};
use crate::protocol::offline::OutOfBandInternal;
use crate::protocol::wire_message::WireMessage;
use crate::protocol::{Priority, Reliability};
use crate::socket::NetSocket;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Sends per probe step.
const TRIES_PER_STEP: u32 = 2;

/// Ports for the four probe sockets; zero lets the OS pick.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionPorts {
    pub s1p2: u16,
    pub s2p3: u16,
    pub s3p4: u16,
    pub s4p5: u16,
}

struct Session {
    /// The client's main socket as the peer sees it (C1).
    address: SocketAddr,
    /// The client's second socket (C2).
    c2: SocketAddr,
    step: u8,
    tries: u32,
    next_send: Instant,
    spacing: Duration,
}

pub struct NatTypeDetectionServer {
    ports: DetectionPorts,
    sockets: Vec<NetSocket>,
    sessions: HashMap<Guid, Session>,
}

impl NatTypeDetectionServer {
    pub fn new(ports: DetectionPorts) -> Self {
        Self {
            ports,
            sockets: Vec::new(),
            sessions: HashMap::new(),
        }
    }

    fn socket(&self, index: usize) -> Option<&NetSocket> {
        self.sockets.get(index)
    }

    fn finish(&mut self, ctx: &mut PluginContext<'_>, guid: Guid, nat_type: NatType) {
        let Some(session) = self.sessions.remove(&guid) else {
            return;
        };
        info!("nat type of {} ({}): {:?}", guid, session.address, nat_type);
        let result = DetectionResult { nat_type }.serialize();
        ctx.send(
            session.address,
            &result,
            Priority::High,
            Reliability::ReliableOrdered,
            0,
        );
    }

    fn poll_port_check_socket(&mut self, ctx: &mut PluginContext<'_>) {
        let mut outcomes: Vec<(Guid, NatType)> = Vec::new();
        if let Some(s3p4) = self.socket(2) {
            while let Some(inbound) = s3p4.poll_recv() {
                let Ok(envelope) = OutOfBandInternal::deserialize(inbound.data.clone()) else {
                    continue;
                };
                let Ok(test) = DetectionTest::deserialize(envelope.payload.clone()) else {
                    continue;
                };
                if test.step != DETECT_STEP_PORT_CHECK {
                    continue;
                }
                let Some(session) = self.sessions.get(&test.guid) else {
                    continue;
                };
                let nat_type = if inbound.from == session.address {
                    NatType::PortRestricted
                } else {
                    debug!(
                        "port check for {}: expected {}, saw {}",
                        test.guid, session.address, inbound.from
                    );
                    NatType::Symmetric
                };
                outcomes.push((test.guid, nat_type));
            }
        }
        for (guid, nat_type) in outcomes {
            self.finish(ctx, guid, nat_type);
        }
    }

    fn drive_sessions(&mut self, ctx: &mut PluginContext<'_>) {
        let now = ctx.now();
        let mut finished: Vec<Guid> = Vec::new();
        let mut instructions: Vec<(SocketAddr, Vec<u8>)> = Vec::new();

        let socket_addrs: Vec<SocketAddr> =
            self.sockets.iter().map(|s| s.local_addr()).collect();
        for (&guid, session) in self.sessions.iter_mut() {
            if now < session.next_send {
                continue;
            }
            if session.tries >= TRIES_PER_STEP {
                session.step += 1;
                session.tries = 0;
                if session.step > DETECT_STEP_PORT_CHECK {
                    // The client never managed the port check either way.
                    finished.push(guid);
                    continue;
                }
            }
            session.tries += 1;
            session.next_send = now + session.spacing;

            match session.step {
                DETECT_STEP_OPEN => {
                    let probe = DetectionTest {
                        step: DETECT_STEP_OPEN,
                        guid,
                    }
                    .serialize();
                    if let Some(s4p5) = self.sockets.get(3) {
                        let _ = s4p5.send_to(&probe, session.c2);
                    }
                }
                DETECT_STEP_FULL_CONE => {
                    let probe = DetectionTest {
                        step: DETECT_STEP_FULL_CONE,
                        guid,
                    }
                    .serialize();
                    if let Some(s2p3) = self.sockets.get(1) {
                        let _ = s2p3.send_to(&probe, session.address);
                    }
                }
                DETECT_STEP_ADDRESS_RESTRICTED => {
                    let probe = DetectionTest {
                        step: DETECT_STEP_ADDRESS_RESTRICTED,
                        guid,
                    }
                    .serialize();
                    if let Some(s1p2) = self.sockets.first() {
                        let _ = s1p2.send_to(&probe, session.address);
                    }
                }
                DETECT_STEP_PORT_CHECK => {
                    if let Some(&s3p4_addr) = socket_addrs.get(2) {
                        let instruction = DetectionSendToTarget { target: s3p4_addr }.serialize();
                        instructions.push((session.address, instruction.to_vec()));
                    }
                }
                _ => {}
            }
        }

        for (address, instruction) in instructions {
            ctx.send(
                address,
                &instruction,
                Priority::High,
                Reliability::ReliableOrdered,
                0,
            );
        }
        for guid in finished {
            self.finish(ctx, guid, NatType::Unknown);
        }
    }
}

impl Plugin for NatTypeDetectionServer {
    fn name(&self) -> &'static str {
        "nat-type-detection-server"
    }

    fn on_attach(&mut self, _ctx: &mut PluginContext<'_>) {
        for port in [
            self.ports.s1p2,
            self.ports.s2p3,
            self.ports.s3p4,
            self.ports.s4p5,
        ] {
            let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid literal");
            match NetSocket::bind_sync(addr, 64) {
                Ok(socket) => {
                    debug!("detection socket bound on {}", socket.local_addr());
                    self.sockets.push(socket);
                }
                Err(e) => warn!("detection socket on port {} unavailable: {}", port, e),
            }
        }
        if self.sockets.len() < 4 {
            warn!(
                "nat type detection degraded: {}/4 sockets bound",
                self.sockets.len()
            );
        }
    }

    fn update(&mut self, ctx: &mut PluginContext<'_>) {
        self.poll_port_check_socket(ctx);
        self.drive_sessions(ctx);
    }

    fn on_closed_connection(
        &mut self,
        _ctx: &mut PluginContext<'_>,
        _address: SocketAddr,
        guid: Guid,
        _reason: DisconnectReason,
    ) {
        self.sessions.remove(&guid);
    }

    fn on_packet(&mut self, ctx: &mut PluginContext<'_>, packet: &Packet) -> PluginAction {
        match packet.id() {
            Some(MessageId::NatTypeDetectionRequest) => {
                let Ok(request) = DetectionRequest::deserialize(packet.data.clone()) else {
                    return PluginAction::StopAndDiscard;
                };
                let spacing_ms = ctx.last_ping_ms(packet.address).unwrap_or(50) * 3 + 50;
                debug!(
                    "detection for {} (c2 port {}, spacing {} ms)",
                    packet.guid, request.c2_port, spacing_ms
                );
                self.sessions.insert(
                    packet.guid,
                    Session {
                        address: packet.address,
                        c2: SocketAddr::new(packet.address.ip(), request.c2_port),
                        step: DETECT_STEP_OPEN,
                        tries: 0,
                        next_send: ctx.now(),
                        spacing: Duration::from_millis(spacing_ms as u64),
                    },
                );
                PluginAction::Stop
            }
            Some(MessageId::NatTypeDetectionTest) => {
                // The client echoes whichever probe reached it.
                let Ok(echo) = DetectionTest::deserialize(packet.data.clone()) else {
                    return PluginAction::StopAndDiscard;
                };
                let nat_type = match echo.step {
                    DETECT_STEP_OPEN => NatType::Open,
                    DETECT_STEP_FULL_CONE => NatType::FullCone,
                    DETECT_STEP_ADDRESS_RESTRICTED => NatType::AddressRestricted,
                    _ => return PluginAction::Stop,
                };
                self.finish(ctx, packet.guid, nat_type);
                PluginAction::Stop
            }
            _ => PluginAction::Continue,
        }
    }
}
