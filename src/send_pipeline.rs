//! The outbound half of the I/O plane: an unbounded multi-producer
//!  single-consumer queue feeding one send loop. Posting never blocks and
//!  never fails the caller; send errors are logged and swallowed, because the
//!  reliability layer retransmits anything that mattered.

use crate::socket::DatagramSocket;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

pub struct OutboundDatagram {
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

/// Cloneable producer handle for the outbound queue.
#[derive(Clone)]
pub struct SendPipeline {
    tx: mpsc::UnboundedSender<OutboundDatagram>,
}

impl SendPipeline {
    pub fn new() -> (SendPipeline, mpsc::UnboundedReceiver<OutboundDatagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SendPipeline { tx }, rx)
    }

    /// Enqueues a datagram for sending. A closed queue means the endpoint is
    ///  shutting down; the datagram is dropped silently apart from a debug
    ///  line.
    pub fn post(&self, to: SocketAddr, payload: Vec<u8>) {
        trace!("enqueueing {} bytes for {:?}", payload.len(), to);
        if self.tx.send(OutboundDatagram { to, payload }).is_err() {
            debug!("outbound queue is closed - dropping datagram for {:?}", to);
        }
    }
}

/// Drains the outbound queue onto the socket until the queue closes.
pub async fn run_send_loop(
    socket: Arc<dyn DatagramSocket>,
    mut rx: mpsc::UnboundedReceiver<OutboundDatagram>,
    ready: tokio::sync::oneshot::Sender<()>,
) {
    info!("starting send loop");
    let _ = ready.send(());

    while let Some(datagram) = rx.recv().await {
        if let Err(e) = socket.send_to(datagram.to, &datagram.payload).await {
            error!("error sending datagram to {:?}: {:#}", datagram.to, e);
        }
    }
    info!("send loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockDatagramSocket;

    #[tokio::test]
    async fn test_posted_datagrams_reach_the_socket() {
        let target: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let mut socket = MockDatagramSocket::new();
        socket
            .expect_send_to()
            .withf(move |to, buf| *to == target && buf == &b"hello"[..])
            .times(1)
            .returning(|_, buf| Ok(buf.len()));

        let (pipeline, rx) = SendPipeline::new();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(run_send_loop(Arc::new(socket), rx, ready_tx));
        ready_rx.await.unwrap();

        pipeline.post(target, b"hello".to_vec());
        drop(pipeline); // closes the queue, ends the loop

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_errors_do_not_stop_the_loop() {
        let target: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let mut socket = MockDatagramSocket::new();
        socket
            .expect_send_to()
            .withf(move |to, _| *to == target)
            .times(2)
            .returning(|_, buf| {
                if buf == &b"first"[..] {
                    Err(anyhow::anyhow!("transient failure"))
                } else {
                    Ok(buf.len())
                }
            });

        let (pipeline, rx) = SendPipeline::new();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(run_send_loop(Arc::new(socket), rx, ready_tx));
        ready_rx.await.unwrap();

        pipeline.post(target, b"first".to_vec());
        pipeline.post(target, b"second".to_vec());
        drop(pipeline);

        handle.await.unwrap();
    }

    #[test]
    fn test_post_after_close_is_silent() {
        let (pipeline, rx) = SendPipeline::new();
        drop(rx);
        pipeline.post("127.0.0.1:1".parse().unwrap(), vec![1, 2, 3]);
    }
}
