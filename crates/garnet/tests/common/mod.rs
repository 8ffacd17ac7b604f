#![allow(dead_code)]

use garnet::peer::Packet;
use garnet::{MessageId, Peer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// The peer binds wildcard; tests talk to it over loopback.
pub fn loopback(peer: &Peer) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), peer.local_addr().port())
}

/// Drains packets until one with the wanted id arrives.
pub async fn wait_for(peer: &mut Peer, want: MessageId, timeout: Duration) -> Option<Packet> {
    wait_for_any(peer, &[want], timeout).await
}

pub async fn wait_for_any(
    peer: &mut Peer,
    wants: &[MessageId],
    timeout: Duration,
) -> Option<Packet> {
    tokio::time::timeout(timeout, async {
        loop {
            let packet = peer.receive().await?;
            match packet.id() {
                Some(id) if wants.contains(&id) => return Some(packet),
                _ => {}
            }
        }
    })
    .await
    .ok()
    .flatten()
}
