//! Rendezvous daemon: a garnet peer with the NAT punchthrough facilitator
//! and the NAT type detection server attached. Clients connect, ask for
//! punchthrough to each other by GUID, or run a detection probe.

use bytes::Bytes;
use garnet::nat::detect_server::{DetectionPorts, NatTypeDetectionServer};
use garnet::nat::punch_server::PunchthroughServer;
use garnet::{MessageId, Peer, PeerConfig};
use garnet_log::{GarnetLogger, LogSink};
use log::{error, info};
use std::time::Instant;

pub mod config;

#[tokio::main]
async fn main() {
    let start_time = Instant::now();

    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let _logger = GarnetLogger::init(config.log_level(), 4096, LogSink::Stdout)
        .expect("logger installs once");

    let peer_config = PeerConfig {
        listen_address: config.listen_address(),
        max_incoming_connections: config.service.max_clients as usize,
        max_connections: config.service.max_clients as usize,
        advertisement: Bytes::from(config.service.advertisement.clone().into_bytes()),
        ..PeerConfig::default()
    };

    let mut peer = match Peer::bind(peer_config).await {
        Ok(peer) => peer,
        Err(e) => {
            error!("Failed to bind {}: {}", config.network.address, e);
            std::process::exit(1);
        }
    };

    let punch = PunchthroughServer::new(config.network.stride_port);
    let detect = NatTypeDetectionServer::new(DetectionPorts {
        s1p2: config.network.detection_ports[0],
        s2p3: config.network.detection_ports[1],
        s3p4: config.network.detection_ports[2],
        s4p5: config.network.detection_ports[3],
    });
    peer.attach_plugin(Box::new(punch)).expect("peer just started");
    peer.attach_plugin(Box::new(detect)).expect("peer just started");

    info!(
        "{} up on {} (guid {}) in {:.2}s",
        config.service.name,
        peer.local_addr(),
        peer.guid(),
        start_time.elapsed().as_secs_f64()
    );

    loop {
        let packet = tokio::select! {
            packet = peer.receive() => packet,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(packet) = packet else {
            info!("shutting down");
            peer.shutdown();
            break;
        };
        match packet.id() {
            Some(MessageId::NewIncomingConnection) => {
                info!("client {} connected from {}", packet.guid, packet.address);
            }
            Some(MessageId::DisconnectionNotification) => {
                info!("client {} left", packet.guid);
            }
            Some(MessageId::ConnectionLost) => {
                info!("client {} timed out", packet.guid);
            }
            _ => {}
        }
    }
}
