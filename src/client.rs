//! The client core: a single-peer mirror of the server with the
//!  connection-initiating half of the handshake, plus the keep-alive and ping
//!  duties and the stateless server-info one-shot.

use crate::auth::ChallengeResponder;
use crate::channel::Channel;
use crate::config::QuadlinkConfig;
use crate::connection_state::ConnectionState;
use crate::events::ClientEventHandler;
use crate::packet::{ConnectCode, Frame, Packet, PacketHeader, SequenceNumber};
use crate::peer::{InboundDisposition, RemoteConnection};
use crate::reliability::AckedPacket;
use crate::send_pipeline::{run_send_loop, SendPipeline};
use crate::server_info::WireSerialize;
use crate::socket::{DatagramSocket, UdpDatagramSocket};
use crate::util::rolling::SlidingWindow;
use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace};

/// Channel for protocol-internal traffic; see the server-side counterpart.
const CONTROL: Channel = Channel::RELIABLE.union(Channel::ORDERED);

/// Outcome of a connect attempt. `client` is populated exactly when `code`
///  is [`ConnectCode::Success`].
pub struct ConnectResult {
    pub code: ConnectCode,
    pub client_id: u64,
    pub client: Option<Arc<Client>>,
}

pub struct Client {
    config: Arc<QuadlinkConfig>,
    responder: Arc<dyn ChallengeResponder>,
    events: Arc<dyn ClientEventHandler>,
    /// the one peer record a client ever has: the server
    server: Arc<RemoteConnection>,
    send: SendPipeline,
    socket: Arc<dyn DatagramSocket>,
    rtt: Mutex<SlidingWindow>,
    /// sequence numbers of in-flight RTT probes; an inbound ack for one of
    ///  these is the "pong"
    outstanding_pings: Mutex<BTreeSet<SequenceNumber>>,
    handshake: Mutex<Option<oneshot::Sender<(ConnectCode, u64)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Resolves the handshake against `server_addr`: sends a connection
    ///  request, answers the server's challenge via `responder` and waits for
    ///  the connection response. Returns [`ConnectCode::NoResponse`] if the
    ///  server does not conclude the handshake within `timeout`.
    pub async fn connect(
        config: Arc<QuadlinkConfig>,
        server_addr: SocketAddr,
        responder: Arc<dyn ChallengeResponder>,
        events: Arc<dyn ClientEventHandler>,
        timeout: Duration,
    ) -> anyhow::Result<ConnectResult> {
        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpDatagramSocket::bind(bind_addr).await?);
        Self::connect_with_socket(config, server_addr, responder, events, timeout, socket).await
    }

    /// [`connect`](Self::connect) with name resolution: takes a host name or
    ///  address literal plus a port and connects to the first address it
    ///  resolves to.
    pub async fn connect_to(
        config: Arc<QuadlinkConfig>,
        host: &str,
        port: u16,
        responder: Arc<dyn ChallengeResponder>,
        events: Arc<dyn ClientEventHandler>,
        timeout: Duration,
    ) -> anyhow::Result<ConnectResult> {
        let server_addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("{}:{} did not resolve to any address", host, port))?;
        Self::connect(config, server_addr, responder, events, timeout).await
    }

    /// Like [`connect`](Self::connect) on an externally supplied socket - the
    ///  seam used by tests running on the in-memory network.
    pub async fn connect_with_socket(
        config: Arc<QuadlinkConfig>,
        server_addr: SocketAddr,
        responder: Arc<dyn ChallengeResponder>,
        events: Arc<dyn ClientEventHandler>,
        timeout: Duration,
        socket: Arc<dyn DatagramSocket>,
    ) -> anyhow::Result<ConnectResult> {
        config.validate()?;

        let (send, outbound_rx) = SendPipeline::new();
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let ping_window = config.ping_window;
        let client = Arc::new(Client {
            server: Arc::new(RemoteConnection::new(server_addr, config.clone())),
            config,
            responder,
            events,
            send,
            socket: socket.clone(),
            rtt: Mutex::new(SlidingWindow::new(ping_window)),
            outstanding_pings: Mutex::new(BTreeSet::new()),
            handshake: Mutex::new(Some(handshake_tx)),
            tasks: Mutex::new(Vec::new()),
        });

        let (send_ready_tx, send_ready_rx) = oneshot::channel();
        let (recv_ready_tx, recv_ready_rx) = oneshot::channel();
        {
            let mut tasks = client.tasks.lock();
            tasks.push(tokio::spawn(run_send_loop(socket, outbound_rx, send_ready_tx)));
            let c = client.clone();
            tasks.push(tokio::spawn(async move { c.recv_loop(recv_ready_tx).await }));
            let c = client.clone();
            tasks.push(tokio::spawn(async move { c.retransmit_loop().await }));
        }
        recv_ready_rx.await.ok();
        send_ready_rx.await.ok();

        info!("connecting to {:?}", server_addr);
        client.server.set_state(ConnectionState::Requested).await;
        client
            .post(
                Packet::ConnectionRequest {
                    protocol_id: client.config.protocol_id,
                    protocol_version: 0,
                },
                CONTROL,
            )
            .await;

        match tokio::time::timeout(timeout, handshake_rx).await {
            Err(_) => {
                info!("no handshake response from {:?} within {:?}", server_addr, timeout);
                client.shutdown().await;
                Ok(ConnectResult { code: ConnectCode::NoResponse, client_id: 0, client: None })
            }
            Ok(Err(_)) => {
                client.shutdown().await;
                bail!("connect attempt aborted");
            }
            Ok(Ok((code, client_id))) => {
                if code == ConnectCode::Success {
                    info!("connected to {:?} as client {}", server_addr, client_id);
                    let mut tasks = client.tasks.lock();
                    let c = client.clone();
                    tasks.push(tokio::spawn(async move { c.keepalive_loop().await }));
                    let c = client.clone();
                    tasks.push(tokio::spawn(async move { c.ping_loop().await }));
                    drop(tasks);
                    Ok(ConnectResult { code, client_id, client: Some(client) })
                } else {
                    info!("connect to {:?} rejected: {:?}", server_addr, code);
                    client.shutdown().await;
                    Ok(ConnectResult { code, client_id: 0, client: None })
                }
            }
        }
    }

    /// One-shot, connectionless query of a server's self-description. The
    ///  caller supplies the blob's type via `T`; `None` means no answer
    ///  arrived within `timeout`.
    pub async fn request_server_info<T: WireSerialize>(
        server_addr: SocketAddr,
        timeout: Duration,
    ) -> anyhow::Result<Option<T>> {
        const MAX_INFO_LEN: usize = 64 * 1024;

        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpDatagramSocket::bind(bind_addr).await?;

        let mut buf = Vec::new();
        Frame {
            header: PacketHeader::new(Channel::empty(), SequenceNumber::ZERO, Vec::new()),
            packet: Packet::ServerInfoRequest,
        }
        .ser(&mut buf);
        socket.send_to(server_addr, &buf).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut recv_buf = vec![0u8; crate::packet::max_datagram_len(MAX_INFO_LEN, 0)];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let received = match tokio::time::timeout(remaining, socket.recv_from(&mut recv_buf)).await {
                Err(_) => return Ok(None),
                Ok(received) => received?,
            };

            let (num_read, from) = received;
            if from != server_addr {
                continue;
            }
            match Frame::deser(&mut &recv_buf[..num_read], MAX_INFO_LEN) {
                Ok(Frame { packet: Packet::ServerInfoResponse { info }, .. }) => {
                    return Ok(Some(T::deser(&mut &info[..])?));
                }
                _ => continue,
            }
        }
    }

    pub async fn send_to_server(&self, data: &[u8], channel: Channel) -> anyhow::Result<()> {
        if data.len() > self.config.max_payload {
            bail!("payload of {} bytes exceeds the maximum of {}", data.len(), self.config.max_payload);
        }
        if self.server.state().await != ConnectionState::AuthenticatedConnected {
            bail!("not connected");
        }

        self.post(Packet::ApplicationData { data: data.to_vec() }, channel).await;
        Ok(())
    }

    /// Graceful termination: a reliable CT to the server, then local
    ///  shutdown. Mirrors the server's disconnect semantics.
    pub async fn disconnect(&self) {
        if self.server.state().await == ConnectionState::AuthenticatedConnected {
            info!("disconnecting from {:?}", self.server.peer_addr());
            self.post(Packet::Termination { reason: "disconnected".to_string() }, CONTROL).await;
            self.server.set_state(ConnectionState::Disconnected).await;
            // the send loop must drain the termination before it is cancelled
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.shutdown().await;
    }

    /// Sliding-window average of observed round trips; zero until the first
    ///  probe is answered.
    pub fn ping(&self) -> Duration {
        Duration::from_secs_f64(self.rtt.lock().mean(Instant::now()))
    }

    pub fn client_id(&self) -> u64 {
        self.server.client_id()
    }

    pub async fn state(&self) -> ConnectionState {
        self.server.state().await
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    async fn post(&self, packet: Packet, channel: Channel) {
        let (_, datagram) = self.server.encode_outgoing(packet, channel).await;
        self.send.post(self.server.peer_addr(), datagram);
    }

    async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn recv_loop(&self, ready: oneshot::Sender<()>) {
        info!("starting client receive loop");
        let _ = ready.send(());

        let mut buf = vec![
            0u8;
            crate::packet::max_datagram_len(self.config.max_payload, self.config.received_ack_capacity)
        ];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error on receive, shutting down client receive loop: {:#}", e);
                    break;
                }
            };
            if from != self.server.peer_addr() {
                debug!("datagram from unexpected endpoint {:?} - dropping", from);
                continue;
            }

            let frame = match Frame::deser(&mut &buf[..num_read], self.config.max_payload) {
                Ok(frame) => frame,
                Err(_) => {
                    debug!("undecodable datagram from server - dropping");
                    continue;
                }
            };
            trace!("received {:?}", frame);

            let acked = self.server.register_inbound(&frame.header.acks).await;
            self.note_acked(&acked);

            match self.server.filter_inbound(frame.header.channel, frame.header.sequence).await {
                InboundDisposition::Deliver => {}
                InboundDisposition::Duplicate | InboundDisposition::Rejected => continue,
            }

            let state = self.server.state().await;
            if !state.client_accepts(&frame.packet) {
                debug!("ignoring {:?} in state {:?}", frame.packet, state);
                continue;
            }

            match frame.packet {
                Packet::Challenge { challenge } => {
                    debug!("received challenge of {} bytes", challenge.len());
                    let response = self.responder.respond(&challenge).await;
                    self.post(Packet::ChallengeResponse { response }, CONTROL).await;
                    self.server.set_state(ConnectionState::WaitingForChallengeResponse).await;
                }
                Packet::ConnectionResponse { code, client_id } => {
                    if code == ConnectCode::Success {
                        self.server.set_state(ConnectionState::AuthenticatedConnected).await;
                        self.server.assign_client_id(client_id).await;
                    } else {
                        self.server.set_state(ConnectionState::Disconnected).await;
                    }
                    if let Some(tx) = self.handshake.lock().take() {
                        let _ = tx.send((code, client_id));
                    }
                }
                Packet::KeepAlive => {}
                Packet::ApplicationData { data } => {
                    self.events.on_data(frame.header.channel, data).await;
                }
                Packet::Termination { reason } => {
                    info!("server terminated the connection: {:?}", reason);
                    self.post(Packet::TerminationAck, Channel::empty()).await;
                    self.server.set_state(ConnectionState::Disconnected).await;
                    self.events.on_disconnected_by_server(reason).await;
                    break;
                }
                Packet::TerminationAck => {}
                Packet::ConnectionRequest { .. }
                | Packet::ChallengeResponse { .. }
                | Packet::ServerInfoRequest
                | Packet::ServerInfoResponse { .. } => {
                    // gated out above for every state
                }
            }
        }
        info!("client receive loop terminated");
    }

    /// Turns acks for outstanding probes into RTT samples. Sync on purpose:
    ///  both guards are dropped before the caller suspends again.
    fn note_acked(&self, acked: &[AckedPacket]) {
        if acked.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut pings = self.outstanding_pings.lock();
        let mut rtt = self.rtt.lock();
        for ack in acked {
            if pings.remove(&ack.sequence) {
                rtt.record(now, now.duration_since(ack.sent_at).as_secs_f64());
            }
        }
    }

    async fn retransmit_loop(&self) {
        let mut ticker = interval(self.config.retransmit_scan_interval);
        loop {
            ticker.tick().await;
            if self.server.state().await == ConnectionState::Disconnected {
                break;
            }
            for datagram in self.server.due_retransmissions().await {
                self.send.post(self.server.peer_addr(), datagram);
            }
        }
    }

    /// Sends an unreliable keep-alive whenever nothing has gone out for a
    ///  whole keep-alive interval, so the server's idle scan never evicts a
    ///  quiet but live client.
    async fn keepalive_loop(&self) {
        loop {
            if self.server.state().await != ConnectionState::AuthenticatedConnected {
                break;
            }

            let idle_for = Instant::now().duration_since(self.server.last_sent_at().await);
            if idle_for >= self.config.keepalive_interval {
                trace!("nothing sent for {:?} - sending keep-alive", idle_for);
                self.post(Packet::KeepAlive, Channel::empty()).await;
                tokio::time::sleep(self.config.keepalive_interval).await;
            } else {
                tokio::time::sleep(self.config.keepalive_interval - idle_for).await;
            }
        }
    }

    /// The RTT probe: a reliable keep-alive whose ack is the pong. The server
    ///  answers a reliable keep-alive immediately, so the sample measures the
    ///  path rather than the peer's send schedule.
    async fn ping_loop(&self) {
        let mut ticker = interval(self.config.ping_interval);
        loop {
            ticker.tick().await;
            if self.server.state().await != ConnectionState::AuthenticatedConnected {
                break;
            }

            let (sequence, datagram) = self.server.encode_outgoing(Packet::KeepAlive, CONTROL).await;
            self.outstanding_pings.lock().insert(sequence);
            self.send.post(self.server.peer_addr(), datagram);
        }
    }
}
