//! NAT type detection, client side: binds the second UDP socket, echoes
//! whichever probes arrive, and performs the directed port-check send.
//! The verdict arrives as a `NatTypeDetectionResult` packet.

use crate::message_id::MessageId;
use crate::nat::{
    DETECT_STEP_PORT_CHECK, DetectionRequest, DetectionResult, DetectionSendToTarget,
    DetectionTest, NatType,
};
use crate::peer::Packet;
use crate::plugin::{Plugin, PluginAction, PluginContext};
use crate::protocol::wire_message::WireMessage;
use crate::protocol::{Priority, Reliability};
use crate::socket::NetSocket;
use bytes::Bytes;
use log::{debug, warn};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Handle for starting a detection from application code.
#[derive(Clone)]
pub struct DetectionHandle {
    tx: mpsc::UnboundedSender<SocketAddr>,
}

impl DetectionHandle {
    /// Runs detection against a connected detection server.
    pub fn detect(&self, server: SocketAddr) {
        let _ = self.tx.send(server);
    }
}

pub struct NatTypeDetectionClient {
    commands: mpsc::UnboundedReceiver<SocketAddr>,
    c2: Option<NetSocket>,
    server: Option<SocketAddr>,
    last_result: Option<NatType>,
}

impl NatTypeDetectionClient {
    pub fn new() -> (Self, DetectionHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                commands,
                c2: None,
                server: None,
                last_result: None,
            },
            DetectionHandle { tx },
        )
    }

    pub fn last_result(&self) -> Option<NatType> {
        self.last_result
    }

    fn echo(&self, ctx: &mut PluginContext<'_>, step: u8) {
        let Some(server) = self.server else {
            return;
        };
        let echo = DetectionTest {
            step,
            guid: ctx.guid(),
        }
        .serialize();
        ctx.send(
            server,
            &echo,
            Priority::High,
            Reliability::ReliableOrdered,
            0,
        );
    }
}

impl Plugin for NatTypeDetectionClient {
    fn name(&self) -> &'static str {
        "nat-type-detection-client"
    }

    fn on_attach(&mut self, _ctx: &mut PluginContext<'_>) {
        match NetSocket::bind_sync("0.0.0.0:0".parse().expect("valid literal"), 16) {
            Ok(socket) => {
                debug!("detection second socket on {}", socket.local_addr());
                self.c2 = Some(socket);
            }
            Err(e) => warn!("detection second socket unavailable: {}", e),
        }
    }

    fn update(&mut self, ctx: &mut PluginContext<'_>) {
        while let Ok(server) = self.commands.try_recv() {
            let Some(c2) = &self.c2 else {
                warn!("detection skipped: no second socket");
                continue;
            };
            self.server = Some(server);
            self.last_result = Some(NatType::InProgress);
            let request = DetectionRequest {
                c2_port: c2.local_addr().port(),
            }
            .serialize();
            ctx.send(
                server,
                &request,
                Priority::High,
                Reliability::ReliableOrdered,
                0,
            );
        }

        // Probes landing on the second socket mean the open internet.
        let mut steps = Vec::new();
        if let Some(c2) = &self.c2 {
            while let Some(inbound) = c2.poll_recv() {
                if let Ok(test) = DetectionTest::deserialize(inbound.data.clone()) {
                    steps.push(test.step);
                }
            }
        }
        for step in steps {
            self.echo(ctx, step);
        }
    }

    /// Probes to the main port arrive as offline datagrams.
    fn on_offline_datagram(
        &mut self,
        ctx: &mut PluginContext<'_>,
        _from: SocketAddr,
        data: &Bytes,
    ) -> bool {
        if MessageId::of(data) != Some(MessageId::NatTypeDetectionTest) {
            return false;
        }
        if let Ok(test) = DetectionTest::deserialize(data.clone()) {
            self.echo(ctx, test.step);
        }
        true
    }

    fn on_packet(&mut self, ctx: &mut PluginContext<'_>, packet: &Packet) -> PluginAction {
        if Some(packet.address) != self.server {
            return PluginAction::Continue;
        }
        match packet.id() {
            Some(MessageId::NatTypeDetectionRequest) => {
                // Server direction: fire the port-check datagram at its
                // fourth socket from our main socket.
                let Ok(instruction) = DetectionSendToTarget::deserialize(packet.data.clone())
                else {
                    return PluginAction::StopAndDiscard;
                };
                let target = if instruction.target.ip().is_unspecified() {
                    SocketAddr::new(packet.address.ip(), instruction.target.port())
                } else {
                    instruction.target
                };
                let check = DetectionTest {
                    step: DETECT_STEP_PORT_CHECK,
                    guid: ctx.guid(),
                }
                .serialize();
                debug!("port check send to {}", target);
                ctx.send_out_of_band(target, &check);
                PluginAction::Stop
            }
            Some(MessageId::NatTypeDetectionResult) => {
                if let Ok(result) = DetectionResult::deserialize(packet.data.clone()) {
                    self.last_result = Some(result.nat_type);
                }
                // Surfaced to the application as well.
                PluginAction::Continue
            }
            _ => PluginAction::Continue,
        }
    }
}
