//! An in-memory datagram network with configurable packet loss and one-way
//!  latency, plugged in through the [`DatagramSocket`] seam. This is what
//!  lets loss-and-latency scenarios run deterministically fast, without
//!  shaping real kernel sockets.

use crate::socket::DatagramSocket;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

type Mailbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

struct NetworkInner {
    loss_probability: f64,
    latency: Duration,
    mailboxes: Mutex<FxHashMap<SocketAddr, Mailbox>>,
    next_port: AtomicU16,
}

/// The simulated network. Endpoints created from the same network can reach
///  each other; each send is dropped with `loss_probability` and otherwise
///  delivered after `latency`.
pub struct FakeNetwork {
    inner: Arc<NetworkInner>,
}

impl FakeNetwork {
    pub fn new(loss_probability: f64, latency: Duration) -> FakeNetwork {
        FakeNetwork {
            inner: Arc::new(NetworkInner {
                loss_probability,
                latency,
                mailboxes: Mutex::new(FxHashMap::default()),
                next_port: AtomicU16::new(40_000),
            }),
        }
    }

    /// A loss-free, zero-latency network.
    pub fn perfect() -> FakeNetwork {
        FakeNetwork::new(0.0, Duration::ZERO)
    }

    pub fn endpoint(&self) -> Arc<FakeDatagramSocket> {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::new(10, 99, 0, 1), port).into();

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.mailboxes.lock().insert(addr, tx);

        Arc::new(FakeDatagramSocket {
            addr,
            network: self.inner.clone(),
            rx: tokio::sync::Mutex::new(rx),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }
}

pub struct FakeDatagramSocket {
    addr: SocketAddr,
    network: Arc<NetworkInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[async_trait]
impl DatagramSocket for FakeDatagramSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<usize> {
        self.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);

        if rand::random::<f64>() < self.network.loss_probability {
            trace!("fake network dropped {} bytes {:?} -> {:?}", buf.len(), self.addr, to);
            return Ok(buf.len());
        }

        // an unknown target swallows the datagram, like real UDP would
        let Some(mailbox) = self.network.mailboxes.lock().get(&to).cloned() else {
            return Ok(buf.len());
        };

        let payload = buf.to_vec();
        let from = self.addr;
        let latency = self.network.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let _ = mailbox.send((payload, from));
        });

        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let Some((payload, from)) = self.rx.lock().await.recv().await else {
            bail!("fake socket closed");
        };

        let num_read = payload.len().min(buf.len());
        buf[..num_read].copy_from_slice(&payload[..num_read]);
        self.bytes_received.fetch_add(num_read as u64, Ordering::Relaxed);
        Ok((num_read, from))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn send_rate(&self) -> f64 {
        0.0
    }

    fn receive_rate(&self) -> f64 {
        0.0
    }
}
