//! NAT traversal end to end on loopback: two clients and a facilitator for
//! punchthrough, and the four-socket probe protocol for type detection.
//! Loopback behaves like the open internet, so punchthrough succeeds on
//! the first external ping and detection classifies as `Open`.

mod common;

use common::{loopback, wait_for};
use garnet::nat::detect_client::NatTypeDetectionClient;
use garnet::nat::detect_server::{DetectionPorts, NatTypeDetectionServer};
use garnet::nat::punch_client::{PunchthroughClient, PunchthroughConfig};
use garnet::nat::punch_server::PunchthroughServer;
use garnet::nat::{DetectionResult, NatType, PunchthroughSucceeded};
use garnet::protocol::wire_message::WireMessage;
use garnet::{MessageId, Peer, PeerConfig};
use std::time::Duration;

const LONG: Duration = Duration::from_secs(30);

#[tokio::test]
async fn punchthrough_happy_path() {
    let facilitator = Peer::bind(PeerConfig::server(0, 32)).await.unwrap();
    facilitator
        .attach_plugin(Box::new(PunchthroughServer::new(0)))
        .unwrap();
    let facilitator_addr = loopback(&facilitator);

    let mut a = Peer::bind(PeerConfig::client()).await.unwrap();
    let (plugin_a, handle_a) = PunchthroughClient::new(PunchthroughConfig::default());
    a.attach_plugin(Box::new(plugin_a)).unwrap();

    let mut b = Peer::bind(PeerConfig::client()).await.unwrap();
    let (plugin_b, _handle_b) = PunchthroughClient::new(PunchthroughConfig::default());
    b.attach_plugin(Box::new(plugin_b)).unwrap();

    a.connect(facilitator_addr).unwrap();
    b.connect(facilitator_addr).unwrap();
    wait_for(&mut a, MessageId::ConnectionRequestAccepted, LONG)
        .await
        .expect("a reaches the facilitator");
    wait_for(&mut b, MessageId::ConnectionRequestAccepted, LONG)
        .await
        .expect("b reaches the facilitator");
    // The facilitator registers a client when its connection confirmation
    // lands, one trip after the client-side acceptance above.
    tokio::time::sleep(Duration::from_millis(300)).await;

    handle_a.open_nat(b.guid(), facilitator_addr);

    let success_a = wait_for(&mut a, MessageId::NatPunchthroughSucceeded, LONG)
        .await
        .expect("initiator succeeds");
    let decoded_a = PunchthroughSucceeded::deserialize(success_a.data).unwrap();
    assert_eq!(decoded_a.guid, b.guid());
    assert!(decoded_a.we_are_sender);

    let success_b = wait_for(&mut b, MessageId::NatPunchthroughSucceeded, LONG)
        .await
        .expect("target succeeds");
    let decoded_b = PunchthroughSucceeded::deserialize(success_b.data).unwrap();
    assert_eq!(decoded_b.guid, a.guid());
    assert!(!decoded_b.we_are_sender);

    // The opened path is a real address the peers can now connect over.
    assert_ne!(success_a.address, facilitator_addr);
}

#[tokio::test]
async fn punchthrough_to_unknown_target_reports_not_connected() {
    let facilitator = Peer::bind(PeerConfig::server(0, 32)).await.unwrap();
    facilitator
        .attach_plugin(Box::new(PunchthroughServer::new(0)))
        .unwrap();
    let facilitator_addr = loopback(&facilitator);

    let mut a = Peer::bind(PeerConfig::client()).await.unwrap();
    let (plugin_a, handle_a) = PunchthroughClient::new(PunchthroughConfig::default());
    a.attach_plugin(Box::new(plugin_a)).unwrap();
    a.connect(facilitator_addr).unwrap();
    wait_for(&mut a, MessageId::ConnectionRequestAccepted, LONG)
        .await
        .expect("a reaches the facilitator");

    handle_a.open_nat(garnet::Guid(0xdead_c0de), facilitator_addr);
    wait_for(&mut a, MessageId::NatTargetNotConnected, LONG)
        .await
        .expect("facilitator reports the unknown target");
}

#[tokio::test]
async fn nat_type_detection_on_loopback_is_open() {
    let facilitator = Peer::bind(PeerConfig::server(0, 32)).await.unwrap();
    facilitator
        .attach_plugin(Box::new(NatTypeDetectionServer::new(DetectionPorts::default())))
        .unwrap();
    let facilitator_addr = loopback(&facilitator);

    let mut client = Peer::bind(PeerConfig::client()).await.unwrap();
    let (plugin, handle) = NatTypeDetectionClient::new();
    client.attach_plugin(Box::new(plugin)).unwrap();
    client.connect(facilitator_addr).unwrap();
    wait_for(&mut client, MessageId::ConnectionRequestAccepted, LONG)
        .await
        .expect("client reaches the detection server");

    handle.detect(facilitator_addr);
    let packet = wait_for(&mut client, MessageId::NatTypeDetectionResult, LONG)
        .await
        .expect("detection completes");
    let result = DetectionResult::deserialize(packet.data).unwrap();
    assert_eq!(result.nat_type, NatType::Open);
}
