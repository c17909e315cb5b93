use crate::packet::Packet;

/// Lifecycle state of a remote connection. Both endpoints walk the same
///  states; the legality of an inbound packet depends on the role, so the
///  gating functions come in a server and a client flavor.
///
/// Packets that are not legal in the current state are silently ignored by
///  the caller (their piggybacked acks have been ingested by then - ack
///  ingestion is unconditional).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Requested,
    WaitingForChallengeResponse,
    AuthenticatedConnected,
}

impl ConnectionState {
    /// Which inbound packets a *server* processes for a peer in this state.
    ///
    /// Server-info packets never reach the state machine, and a termination
    ///  ack carries no state of its own - it is consumed for its acks alone.
    pub fn server_accepts(&self, packet: &Packet) -> bool {
        match packet {
            Packet::ConnectionRequest { .. } => *self == ConnectionState::Disconnected,
            Packet::ChallengeResponse { .. } => *self == ConnectionState::WaitingForChallengeResponse,
            Packet::KeepAlive
            | Packet::ApplicationData { .. }
            | Packet::Termination { .. } => *self == ConnectionState::AuthenticatedConnected,
            Packet::TerminationAck => true,
            Packet::Challenge { .. }
            | Packet::ConnectionResponse { .. }
            | Packet::ServerInfoRequest
            | Packet::ServerInfoResponse { .. } => false,
        }
    }

    /// Which inbound packets a *client* processes in this state. A connection
    ///  response is legal both while waiting for the challenge outcome and
    ///  directly after the request (a server rejecting the protocol answers
    ///  without ever challenging).
    pub fn client_accepts(&self, packet: &Packet) -> bool {
        match packet {
            Packet::Challenge { .. } => *self == ConnectionState::Requested,
            Packet::ConnectionResponse { .. } => matches!(
                self,
                ConnectionState::Requested | ConnectionState::WaitingForChallengeResponse
            ),
            Packet::KeepAlive
            | Packet::ApplicationData { .. }
            | Packet::Termination { .. } => *self == ConnectionState::AuthenticatedConnected,
            Packet::TerminationAck => true,
            Packet::ConnectionRequest { .. }
            | Packet::ChallengeResponse { .. }
            | Packet::ServerInfoRequest
            | Packet::ServerInfoResponse { .. } => false,
        }
    }
}
