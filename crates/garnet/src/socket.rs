//! Datagram I/O: a bound UDP socket with a background receive task.
//!
//! The receive task's only job is to read datagrams and push them onto a
//! bounded queue; the peer's update task drains it. When the queue is full
//! the oldest entry is dropped, which is what UDP would have done anyway.
//! Sends never block: they go through the nonblocking fast path and a full
//! OS buffer simply drops the datagram.

use crate::error::{NetError, Result};
use bytes::Bytes;
use log::{debug, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One datagram pulled off the wire.
#[derive(Debug)]
pub struct InboundDatagram {
    pub from: SocketAddr,
    pub data: Bytes,
    pub arrived: Instant,
}

struct SharedQueue {
    queue: Mutex<VecDeque<InboundDatagram>>,
    capacity: usize,
    notify: Notify,
}

impl SharedQueue {
    fn push(&self, datagram: InboundDatagram) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(datagram);
        }
        self.notify.notify_one();
    }
}

pub struct NetSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shared: Arc<SharedQueue>,
    recv_task: JoinHandle<()>,
}

impl NetSocket {
    /// Binds and starts the receive task. Must run inside a tokio runtime.
    pub async fn bind(addr: SocketAddr, queue_capacity: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|_| NetError::BindFailed(addr))?;
        Self::start(socket, queue_capacity)
    }

    /// Synchronous bind for auxiliary sockets created mid-update (NAT
    /// detection probes, port-stride listeners). Must run inside a tokio
    /// runtime.
    pub fn bind_sync(addr: SocketAddr, queue_capacity: usize) -> Result<Self> {
        let std_socket = std::net::UdpSocket::bind(addr).map_err(|_| NetError::BindFailed(addr))?;
        std_socket
            .set_nonblocking(true)
            .map_err(|_| NetError::BindFailed(addr))?;
        let socket = UdpSocket::from_std(std_socket).map_err(|_| NetError::BindFailed(addr))?;
        Self::start(socket, queue_capacity)
    }

    fn start(socket: UdpSocket, queue_capacity: usize) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let shared = Arc::new(SharedQueue {
            queue: Mutex::new(VecDeque::new()),
            capacity: queue_capacity.max(1),
            notify: Notify::new(),
        });

        let recv_socket = Arc::clone(&socket);
        let recv_shared = Arc::clone(&shared);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; crate::protocol::MAX_MTU as usize];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        recv_shared.push(InboundDatagram {
                            from,
                            data: Bytes::copy_from_slice(&buf[..len]),
                            arrived: Instant::now(),
                        });
                    }
                    Err(e) => {
                        // Transient on most platforms (e.g. ICMP port
                        // unreachable surfacing as ECONNRESET).
                        debug!("recv_from on {}: {}", local_addr, e);
                    }
                }
            }
        });

        Ok(Self {
            socket,
            local_addr,
            shared,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Nonblocking send. A kernel buffer full or unreachable destination
    /// drops the datagram, as UDP semantics allow; partial sends surface
    /// as errors.
    pub fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<()> {
        match self.socket.try_send_to(data, to) {
            Ok(sent) if sent == data.len() => Ok(()),
            Ok(sent) => Err(NetError::PartialSend {
                sent,
                len: data.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("send buffer full, dropping {} bytes to {}", data.len(), to);
                Ok(())
            }
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Sends with a temporary TTL, used by NAT punchthrough to open a hole
    /// outbound without the datagram reaching (and upsetting) the remote
    /// NAT.
    pub fn send_to_with_ttl(&self, data: &[u8], to: SocketAddr, ttl: u32) -> Result<()> {
        let original = self.socket.ttl()?;
        self.socket.set_ttl(ttl)?;
        let result = self.send_to(data, to);
        if let Err(e) = self.socket.set_ttl(original) {
            warn!("failed to restore ttl on {}: {}", self.local_addr, e);
        }
        result
    }

    /// Pops the oldest queued datagram, if any.
    pub fn poll_recv(&self) -> Option<InboundDatagram> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// Resolves when a datagram may be waiting.
    pub async fn readable(&self) {
        self.shared.notify.notified().await;
    }
}

impl Drop for NetSocket {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let a = NetSocket::bind(loopback(), 16).await.unwrap();
        let b = NetSocket::bind(loopback(), 16).await.unwrap();

        a.send_to(b"hello", b.local_addr()).unwrap();
        b.readable().await;
        let datagram = b.poll_recv().expect("datagram queued");
        assert_eq!(&datagram.data[..], b"hello");
        assert_eq!(datagram.from, a.local_addr());
    }

    #[tokio::test]
    async fn queue_overflow_drops_the_oldest() {
        let a = NetSocket::bind(loopback(), 16).await.unwrap();
        let b = NetSocket::bind(loopback(), 2).await.unwrap();

        for i in 0..5u8 {
            a.send_to(&[i], b.local_addr()).unwrap();
        }
        // Let the receive task drain the kernel buffer.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let first = b.poll_recv().expect("queue has entries");
        let second = b.poll_recv().expect("queue has entries");
        assert!(b.poll_recv().is_none());
        assert_eq!(&first.data[..], &[3]);
        assert_eq!(&second.data[..], &[4]);
    }
}
