//! The datagram I/O seam. The cores consume [`DatagramSocket`] so tests can
//!  substitute an in-memory network; production traffic goes through
//!  [`UdpDatagramSocket`], a thin wrapper over tokio's UDP socket that also
//!  meters byte throughput.

use crate::util::rolling::SlidingWindow;
use async_trait::async_trait;
use anyhow::Context;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{ToSocketAddrs, UdpSocket};

/// Abstraction over a bound, unconnected datagram socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;

    /// Total payload bytes sent since creation.
    fn bytes_sent(&self) -> u64;

    /// Total payload bytes received since creation.
    fn bytes_received(&self) -> u64;

    /// Sent payload bytes per second, averaged over the last second.
    fn send_rate(&self) -> f64;

    /// Received payload bytes per second, averaged over the last second.
    fn receive_rate(&self) -> f64;
}

/// Total plus windowed byte counter backing the rate accessors.
pub(crate) struct ByteMeter {
    total: AtomicU64,
    window: Mutex<SlidingWindow>,
}

impl ByteMeter {
    pub(crate) fn new() -> ByteMeter {
        ByteMeter {
            total: AtomicU64::new(0),
            window: Mutex::new(SlidingWindow::new(Duration::from_secs(1))),
        }
    }

    pub(crate) fn count(&self, bytes: usize) {
        self.total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.window.lock().record(Instant::now(), bytes as f64);
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn rate(&self) -> f64 {
        let mut window = self.window.lock();
        window.sum(Instant::now()) / window.window().as_secs_f64()
    }
}

pub struct UdpDatagramSocket {
    socket: UdpSocket,
    sent: ByteMeter,
    received: ByteMeter,
}

impl UdpDatagramSocket {
    pub async fn bind(addr: impl ToSocketAddrs) -> anyhow::Result<UdpDatagramSocket> {
        let socket = UdpSocket::bind(addr).await.context("binding UDP socket")?;
        Ok(UdpDatagramSocket {
            socket,
            sent: ByteMeter::new(),
            received: ByteMeter::new(),
        })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<usize> {
        let sent = self.socket.send_to(buf, to).await?;
        self.sent.count(sent);
        Ok(sent)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let (received, from) = self.socket.recv_from(buf).await?;
        self.received.count(received);
        Ok((received, from))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn bytes_sent(&self) -> u64 {
        self.sent.total()
    }

    fn bytes_received(&self) -> u64 {
        self.received.total()
    }

    fn send_rate(&self) -> f64 {
        self.sent.rate()
    }

    fn receive_rate(&self) -> f64 {
        self.received.rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_send_recv_and_meters() {
        let a = UdpDatagramSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpDatagramSocket::bind("127.0.0.1:0").await.unwrap();

        let payload = b"quadlink";
        a.send_to(b.local_addr().unwrap(), payload).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &payload[..]);
        assert_eq!(from, a.local_addr().unwrap());

        assert_eq!(a.bytes_sent(), payload.len() as u64);
        assert_eq!(b.bytes_received(), payload.len() as u64);
        assert!(a.send_rate() > 0.0);
        assert!(b.receive_rate() > 0.0);
    }

    #[test]
    fn test_byte_meter_accumulates() {
        let meter = ByteMeter::new();
        meter.count(100);
        meter.count(50);
        assert_eq!(meter.total(), 150);
        assert!(meter.rate() >= 150.0);
    }
}
