//! The per-peer record. On the server there is one [`RemoteConnection`] per
//!  remote endpoint; the client holds exactly one, representing the server.
//!  It ties together the sequence counter, the reliability tables, the
//!  ordering filter and the connection state, and it is the single place
//!  where outgoing frames get their header stamped.

use crate::channel::Channel;
use crate::config::QuadlinkConfig;
use crate::connection_state::ConnectionState;
use crate::ordering::{AdmitVerdict, OrderingFilter};
use crate::packet::{Frame, Packet, PacketHeader, SequenceNumber};
use crate::reliability::{AckedPacket, RecentReceivedToAck, SentAwaitingAck};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// What becomes of an inbound packet after ack bookkeeping and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDisposition {
    /// Process the packet body.
    Deliver,
    /// A reliable retransmission that was already delivered once: its ack is
    ///  refreshed, the body is not processed again.
    Duplicate,
    /// Dropped by the ordering filter.
    Rejected,
}

struct PeerInner {
    state: ConnectionState,
    /// the most recently assigned outgoing sequence number; assignment is
    ///  strictly increasing starting at 1
    last_assigned: SequenceNumber,
    ordering: OrderingFilter,
    sent_awaiting_ack: SentAwaitingAck,
    recent_received: RecentReceivedToAck,
    last_received_at: Instant,
    last_sent_at: Instant,
    /// server side: the challenge sent to this peer, kept for validating the
    ///  response
    pending_challenge: Option<Vec<u8>>,
    /// server side: the id this peer will receive if authentication succeeds
    candidate_client_id: Option<u64>,
}

pub struct RemoteConnection {
    peer_addr: SocketAddr,
    config: Arc<QuadlinkConfig>,
    /// 0 until assigned after successful authentication
    client_id: AtomicU64,
    authenticated: std::sync::atomic::AtomicBool,
    inner: Mutex<PeerInner>,
}

impl RemoteConnection {
    pub fn new(peer_addr: SocketAddr, config: Arc<QuadlinkConfig>) -> RemoteConnection {
        let now = Instant::now();
        let received_ack_capacity = config.received_ack_capacity;
        RemoteConnection {
            peer_addr,
            config,
            client_id: AtomicU64::new(0),
            authenticated: std::sync::atomic::AtomicBool::new(false),
            inner: Mutex::new(PeerInner {
                state: ConnectionState::Disconnected,
                last_assigned: SequenceNumber::ZERO,
                ordering: OrderingFilter::new(),
                sent_awaiting_ack: SentAwaitingAck::new(),
                recent_received: RecentReceivedToAck::new(received_ack_capacity),
                last_received_at: now,
                last_sent_at: now,
                pending_challenge: None,
                candidate_client_id: None,
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The id assigned after successful authentication; 0 until then. Use
    ///  [`is_authenticated`](Self::is_authenticated) to tell the first client
    ///  (id 0) apart from a peer still in the handshake.
    pub fn client_id(&self) -> u64 {
        self.client_id.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub(crate) async fn set_state(&self, new_state: ConnectionState) {
        let mut inner = self.inner.lock().await;
        if inner.state != new_state {
            debug!("peer {:?}: {:?} -> {:?}", self.peer_addr, inner.state, new_state);
            inner.state = new_state;
        }
    }

    pub(crate) async fn assign_client_id(&self, client_id: u64) {
        self.client_id.store(client_id, Ordering::Release);
        self.authenticated.store(true, Ordering::Release);
    }

    pub(crate) async fn store_auth_context(&self, candidate_client_id: u64, challenge: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        inner.candidate_client_id = Some(candidate_client_id);
        inner.pending_challenge = Some(challenge);
    }

    pub(crate) async fn auth_context(&self) -> Option<(u64, Vec<u8>)> {
        let inner = self.inner.lock().await;
        match (&inner.candidate_client_id, &inner.pending_challenge) {
            (Some(id), Some(challenge)) => Some((*id, challenge.clone())),
            _ => None,
        }
    }

    /// Stamps a header onto `packet` and serializes the result: assigns the
    ///  next sequence number, copies the current ack list into the header,
    ///  and - for reliable channels - retains a clone for retransmission.
    pub(crate) async fn encode_outgoing(&self, packet: Packet, channel: Channel) -> (SequenceNumber, Vec<u8>) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let sequence = inner.last_assigned.next();
        inner.last_assigned = sequence;

        let frame = Frame {
            header: PacketHeader::new(channel, sequence, inner.recent_received.next_acks()),
            packet,
        };
        trace!("sending {:?} to {:?}", frame, self.peer_addr);

        let mut buf = Vec::new();
        frame.ser(&mut buf);

        if channel.is_reliable() {
            inner.sent_awaiting_ack.add(sequence, buf.clone(), now);
        }
        inner.last_sent_at = now;

        (sequence, buf)
    }

    /// First stop for every inbound packet from this peer: refreshes the idle
    ///  clock and ingests the piggybacked acks. Runs unconditionally, before
    ///  ordering and state gating - stale packets still retire acks.
    pub(crate) async fn register_inbound(&self, acks: &[SequenceNumber]) -> Vec<AckedPacket> {
        let mut inner = self.inner.lock().await;
        inner.last_received_at = Instant::now();
        inner.sent_awaiting_ack.ingest_acks(acks)
    }

    /// Second stop: ordering filter plus received-ack bookkeeping, per the
    ///  verdict rules described on [`AdmitVerdict`].
    pub(crate) async fn filter_inbound(&self, channel: Channel, sequence: SequenceNumber) -> InboundDisposition {
        let mut inner = self.inner.lock().await;

        match inner.ordering.admit(channel, sequence) {
            AdmitVerdict::Admit => {
                if channel.is_reliable() && !inner.recent_received.record(sequence) {
                    return InboundDisposition::Duplicate;
                }
                InboundDisposition::Deliver
            }
            AdmitVerdict::DropStale => {
                if channel.is_reliable() {
                    // re-ack so the sender stops retransmitting
                    inner.recent_received.record(sequence);
                }
                InboundDisposition::Rejected
            }
            AdmitVerdict::DropAhead => InboundDisposition::Rejected,
        }
    }

    /// Clones of all reliable packets whose resend budget has elapsed, with
    ///  their timestamps refreshed. The caller posts them as-is.
    pub(crate) async fn due_retransmissions(&self) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let due = inner.sent_awaiting_ack.due_for_resend(now, self.config.resend_budget);
        let mut datagrams = Vec::with_capacity(due.len());
        for (sequence, datagram) in due {
            debug!("resending #{} to {:?}", sequence, self.peer_addr);
            inner.sent_awaiting_ack.mark_resent(sequence, now);
            inner.last_sent_at = now;
            datagrams.push(datagram);
        }
        datagrams
    }

    pub(crate) async fn last_received_at(&self) -> Instant {
        self.inner.lock().await.last_received_at
    }

    pub(crate) async fn last_sent_at(&self) -> Instant {
        self.inner.lock().await.last_sent_at
    }

    #[cfg(test)]
    pub(crate) async fn unacked_count(&self) -> usize {
        self.inner.lock().await.sent_awaiting_ack.len()
    }
}
