//! The server core: owns the peer registry, drives the handshake, dispatches
//!  inbound packets and runs the background duties (receive, send, retransmit
//!  scan, idle scan).

use crate::auth::Authenticator;
use crate::channel::Channel;
use crate::config::QuadlinkConfig;
use crate::connection_state::ConnectionState;
use crate::events::ServerEventHandler;
use crate::packet::{ConnectCode, Frame, Packet, PacketHeader, SequenceNumber};
use crate::peer::{InboundDisposition, RemoteConnection};
use crate::send_pipeline::{run_send_loop, OutboundDatagram, SendPipeline};
use crate::server_info::ServerInfoProvider;
use crate::socket::{DatagramSocket, UdpDatagramSocket};
use crate::util::shared_map::SharedMap;
use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Channel for protocol-internal traffic. Reliable so handshake and
///  termination survive loss; ordered so internal packets never leave gaps in
///  the strict FIFO numbering (see [`OrderingFilter`](crate::ordering::OrderingFilter)).
const CONTROL: Channel = Channel::RELIABLE.union(Channel::ORDERED);

pub struct Server {
    config: Arc<QuadlinkConfig>,
    authenticator: Arc<dyn Authenticator>,
    info_provider: Arc<dyn ServerInfoProvider>,
    events: Arc<dyn ServerEventHandler>,
    peers: SharedMap<SocketAddr, Arc<RemoteConnection>>,
    next_client_id: AtomicU64,
    send: SendPipeline,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundDatagram>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(
        config: Arc<QuadlinkConfig>,
        authenticator: Arc<dyn Authenticator>,
        info_provider: Arc<dyn ServerInfoProvider>,
        events: Arc<dyn ServerEventHandler>,
    ) -> Server {
        let (send, outbound_rx) = SendPipeline::new();
        Server {
            config,
            authenticator,
            info_provider,
            events,
            peers: SharedMap::new(),
            next_client_id: AtomicU64::new(0),
            send,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds a UDP socket and launches the background duties. Returns once
    ///  the receive and send loops are running.
    pub async fn start(self: &Arc<Self>, bind_addr: SocketAddr) -> anyhow::Result<()> {
        let socket = Arc::new(UdpDatagramSocket::bind(bind_addr).await?);
        self.start_with_socket(socket).await
    }

    /// Like [`start`](Self::start) on an externally supplied socket - the
    ///  seam used by tests running on the in-memory network.
    pub async fn start_with_socket(self: &Arc<Self>, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<()> {
        self.config.validate()?;
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            bail!("server already started");
        };

        let local_addr = socket.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!("starting server on {:?}", local_addr);

        let (send_ready_tx, send_ready_rx) = oneshot::channel();
        let (recv_ready_tx, recv_ready_rx) = oneshot::channel();

        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(run_send_loop(socket.clone(), outbound_rx, send_ready_tx)));
            let server = self.clone();
            tasks.push(tokio::spawn(async move { server.recv_loop(socket, recv_ready_tx).await }));
            let server = self.clone();
            tasks.push(tokio::spawn(async move { server.retransmit_loop().await }));
            let server = self.clone();
            tasks.push(tokio::spawn(async move { server.idle_scan_loop().await }));
        }

        recv_ready_rx.await.map_err(|_| anyhow!("receive loop did not come up"))?;
        send_ready_rx.await.map_err(|_| anyhow!("send loop did not come up"))?;
        Ok(())
    }

    /// Cancels the background duties, waits for them to quiesce and releases
    ///  the socket.
    pub async fn stop(&self) {
        info!("stopping server");
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        *self.local_addr.lock() = None;
    }

    /// Terminates a client's connection: reliable CT to the peer, peer record
    ///  removed, `ConnectionTerminated` raised.
    pub async fn disconnect_client(&self, client_id: u64) -> anyhow::Result<()> {
        let Some(peer) = self.client_connection(client_id) else {
            bail!("no connected client with id {}", client_id);
        };

        info!("disconnecting client {} at {:?}", client_id, peer.peer_addr());
        peer.set_state(ConnectionState::Disconnected).await;
        self.post_to_peer(
            &peer,
            Packet::Termination { reason: "disconnected by server".to_string() },
            CONTROL,
        )
        .await;
        self.peers.remove(&peer.peer_addr());
        self.events
            .on_connection_terminated(client_id, "disconnected by server".to_string())
            .await;
        Ok(())
    }

    pub async fn send_to_client(&self, client_id: u64, data: &[u8], channel: Channel) -> anyhow::Result<()> {
        if data.len() > self.config.max_payload {
            bail!("payload of {} bytes exceeds the maximum of {}", data.len(), self.config.max_payload);
        }
        let Some(peer) = self.client_connection(client_id) else {
            bail!("no connected client with id {}", client_id);
        };

        self.post_to_peer(&peer, Packet::ApplicationData { data: data.to_vec() }, channel).await;
        Ok(())
    }

    /// The connection authenticated as `client_id`, if there is one.
    pub fn client_connection(&self, client_id: u64) -> Option<Arc<RemoteConnection>> {
        self.peers
            .values()
            .into_iter()
            .find(|peer| peer.is_authenticated() && peer.client_id() == client_id)
    }

    /// All authenticated connections.
    pub fn client_connections(&self) -> Vec<Arc<RemoteConnection>> {
        self.peers
            .values()
            .into_iter()
            .filter(|peer| peer.is_authenticated())
            .collect()
    }

    /// Number of tracked remote endpoints, handshaking peers included.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn protocol_id(&self) -> u32 {
        self.config.protocol_id
    }

    pub fn supported_secondary_protocol_ids(&self) -> &[u32] {
        &self.config.supported_secondary_protocol_ids
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    async fn recv_loop(&self, socket: Arc<dyn DatagramSocket>, ready: oneshot::Sender<()>) {
        info!("starting receive loop");
        let _ = ready.send(());

        let mut buf = vec![
            0u8;
            crate::packet::max_datagram_len(self.config.max_payload, self.config.received_ack_capacity)
        ];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error on receive, shutting down receive loop: {:#}", e);
                    break;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            let frame = match Frame::deser(&mut &buf[..num_read], self.config.max_payload) {
                Ok(frame) => frame,
                Err(_) => {
                    debug!("undecodable datagram from {:?} - dropping", from);
                    continue;
                }
            };

            self.dispatch(from, frame).instrument(span).await;
        }
    }

    async fn dispatch(&self, from: SocketAddr, frame: Frame) {
        trace!("received {:?} from {:?}", frame, from);

        // server-info requests are stateless and never touch the registry
        if frame.packet == Packet::ServerInfoRequest {
            let info = self.info_provider.server_info().await;
            trace!("answering server-info request from {:?} with {} bytes", from, info.len());
            let mut buf = Vec::new();
            Frame {
                header: PacketHeader::new(Channel::empty(), SequenceNumber::ZERO, Vec::new()),
                packet: Packet::ServerInfoResponse { info },
            }
            .ser(&mut buf);
            self.send.post(from, buf);
            return;
        }

        let peer = match self.peers.get(&from) {
            Some(peer) => peer,
            None => {
                if self.peers.len() >= self.config.max_connections as usize {
                    debug!("connection registry is full - dropping datagram from unknown endpoint {:?}", from);
                    return;
                }
                debug!("first datagram from {:?} - creating remote connection", from);
                let peer = Arc::new(RemoteConnection::new(from, self.config.clone()));
                self.peers.insert(from, peer.clone());
                peer
            }
        };

        // ack ingestion is unconditional: even packets the ordering filter is
        // about to drop retire their piggybacked acks
        let acked = peer.register_inbound(&frame.header.acks).await;
        if !acked.is_empty() {
            trace!("peer {:?} acked {} reliable packets", from, acked.len());
        }

        match peer.filter_inbound(frame.header.channel, frame.header.sequence).await {
            InboundDisposition::Deliver => {}
            InboundDisposition::Duplicate | InboundDisposition::Rejected => return,
        }

        let state = peer.state().await;
        if !state.server_accepts(&frame.packet) {
            debug!("ignoring {:?} from {:?} in state {:?}", frame.packet, from, state);
            return;
        }

        match frame.packet {
            Packet::ConnectionRequest { protocol_id, .. } => {
                self.on_connection_request(&peer, protocol_id).await;
            }
            Packet::ChallengeResponse { response } => {
                self.on_challenge_response(&peer, &response).await;
            }
            Packet::KeepAlive => {
                if frame.header.channel.is_reliable() {
                    // a ping: answer right away so the piggybacked ack carries
                    // the pinged sequence number back with minimal delay. The
                    // pong rides the control channel like all internal traffic,
                    // so its loss cannot open a gap in the strict numbering.
                    self.post_to_peer(&peer, Packet::KeepAlive, CONTROL).await;
                }
            }
            Packet::ApplicationData { data } => {
                self.events.on_data(peer.client_id(), frame.header.channel, data).await;
            }
            Packet::Termination { reason } => {
                self.on_termination(&peer, reason).await;
            }
            Packet::TerminationAck => {}
            Packet::Challenge { .. }
            | Packet::ConnectionResponse { .. }
            | Packet::ServerInfoRequest
            | Packet::ServerInfoResponse { .. } => {
                // gated out above for every state
            }
        }
    }

    async fn on_connection_request(&self, peer: &Arc<RemoteConnection>, protocol_id: u32) {
        if protocol_id != self.config.protocol_id
            && !self.config.supported_secondary_protocol_ids.contains(&protocol_id)
        {
            warn!("peer {:?} requested unsupported protocol {} - rejecting", peer.peer_addr(), protocol_id);
            self.post_to_peer(
                peer,
                Packet::ConnectionResponse { code: ConnectCode::UnsupportedProtocolVersion, client_id: 0 },
                Channel::empty(),
            )
            .await;
            self.drop_handshake_peer(peer, ConnectCode::UnsupportedProtocolVersion).await;
            return;
        }

        peer.set_state(ConnectionState::Requested).await;

        let candidate_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let challenge = self.authenticator.get_challenge_for(candidate_id).await;
        peer.store_auth_context(candidate_id, challenge.clone()).await;

        self.post_to_peer(peer, Packet::Challenge { challenge }, CONTROL).await;
        peer.set_state(ConnectionState::WaitingForChallengeResponse).await;
    }

    async fn on_challenge_response(&self, peer: &Arc<RemoteConnection>, response: &[u8]) {
        let Some((candidate_id, challenge)) = peer.auth_context().await else {
            warn!("challenge response from {:?} without a stored challenge - ignoring", peer.peer_addr());
            return;
        };

        if self.authenticator.authenticate(candidate_id, &challenge, response).await {
            peer.set_state(ConnectionState::AuthenticatedConnected).await;
            peer.assign_client_id(candidate_id).await;
            info!("peer {:?} authenticated as client {}", peer.peer_addr(), candidate_id);
            self.post_to_peer(
                peer,
                Packet::ConnectionResponse { code: ConnectCode::Success, client_id: candidate_id },
                CONTROL,
            )
            .await;
            self.events.on_client_connected(candidate_id).await;
        } else {
            info!("peer {:?} failed authentication", peer.peer_addr());
            self.post_to_peer(
                peer,
                Packet::ConnectionResponse { code: ConnectCode::InvalidAuthentication, client_id: 0 },
                Channel::empty(),
            )
            .await;
            self.drop_handshake_peer(peer, ConnectCode::InvalidAuthentication).await;
        }
    }

    async fn on_termination(&self, peer: &Arc<RemoteConnection>, reason: String) {
        debug!("peer {:?} terminated the connection: {:?}", peer.peer_addr(), reason);
        self.post_to_peer(peer, Packet::TerminationAck, Channel::empty()).await;
        peer.set_state(ConnectionState::Disconnected).await;
        self.peers.remove(&peer.peer_addr());
        self.events.on_connection_terminated(peer.client_id(), reason).await;
    }

    /// A failed handshake ends with the peer removed immediately - the
    ///  response packet (already posted, unreliable) is the only notice the
    ///  peer gets.
    async fn drop_handshake_peer(&self, peer: &Arc<RemoteConnection>, code: ConnectCode) {
        peer.set_state(ConnectionState::Disconnected).await;
        self.peers.remove(&peer.peer_addr());
        self.events.on_authentication_failed(peer.peer_addr(), code).await;
    }

    async fn post_to_peer(&self, peer: &Arc<RemoteConnection>, packet: Packet, channel: Channel) {
        let (_, datagram) = peer.encode_outgoing(packet, channel).await;
        self.send.post(peer.peer_addr(), datagram);
    }

    async fn retransmit_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.retransmit_scan_interval);
        loop {
            ticker.tick().await;
            for peer in self.peers.values() {
                for datagram in peer.due_retransmissions().await {
                    self.send.post(peer.peer_addr(), datagram);
                }
            }
        }
    }

    async fn idle_scan_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for peer in self.peers.values() {
                if now.duration_since(peer.last_received_at().await) < self.config.idle_timeout {
                    continue;
                }

                info!("peer {:?} timed out", peer.peer_addr());
                peer.set_state(ConnectionState::Disconnected).await;
                self.peers.remove(&peer.peer_addr());
                if peer.is_authenticated() {
                    self.events
                        .on_connection_terminated(peer.client_id(), "timed out".to_string())
                        .await;
                }
            }
        }
    }
}
