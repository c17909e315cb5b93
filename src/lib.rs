//! Quadlink is a reliability and ordering layer on top of UDP, built for
//!  low-latency bidirectional client-server communication - primarily real-time
//!  games. It multiplexes four delivery channels over a single socket pair and
//!  adds a connection lifecycle with optional challenge-response authentication.
//!
//! ## Design goals
//!
//! * Client-server rather than peer-to-peer: a server handles many remote
//!   connections on one listening UDP socket, a client has exactly one
//! * Per-packet choice of delivery discipline via two channel flags:
//!   * *reliable*: the packet is retained by the sender and retransmitted until
//!     its sequence number comes back in a piggybacked ack list
//!   * *ordered*: stale packets are dropped rather than delivered late; on the
//!     reliable-ordered channel admission is strict FIFO with no head-of-line
//!     buffer (the sender's retransmission closes gaps in order)
//! * Acknowledgements are piggybacked on every outgoing packet - there is no
//!   dedicated ack packet, any outbound traffic carries them
//! * Connection lifecycle: challenge-response handshake (degenerating to an
//!   empty challenge when no authentication is configured), keep-alive,
//!   graceful termination, idle-timeout eviction
//! * A stateless out-of-band server-info query that never establishes a
//!   connection
//! * Explicitly *not* in scope: encryption, congestion control, fragmentation
//!   of oversized payloads, NAT traversal
//!
//! ## Header
//!
//! Packet header (inside a UDP packet) - all numbers little-endian:
//! ```ascii
//! 0:  type_and_channel (u8):
//!     * low nibble: packet type (0..9)
//!       * 0 CR   connection request
//!       * 1 CH   challenge
//!       * 2 CHR  challenge response
//!       * 3 CRS  connection response
//!       * 4 KA   keep-alive
//!       * 5 AD   application data
//!       * 6 CT   termination
//!       * 7 CTA  termination ack
//!       * 8 SIRQ server-info request
//!       * 9 SIRS server-info response
//!     * high nibble: channel flags, RELIABLE = 0x10, ORDERED = 0x20
//! 1:  sequence number (u64): per-peer, strictly increasing from 1
//! 9:  ack count (u32)
//! 13: ack count x u64: acknowledged sequence numbers, most recent first,
//!      at most 32
//! ```
//!
//! The header is followed by a type-specific body; variable-length fields are
//!  u32-length-prefixed and bounded by the configured maximum payload.
//!
//! ## Concurrency
//!
//! All long-running duties (receive, send, retransmit scan, idle scan,
//!  keep-alive, ping) are cooperative tokio tasks. Shared state is behind
//!  mutual-exclusion guards whose critical sections never suspend; the
//!  outbound datagram queue is an unbounded multi-producer single-consumer
//!  channel, so posting never blocks.

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection_state;
pub mod events;
pub mod ordering;
pub mod packet;
pub mod peer;
pub mod reliability;
pub mod send_pipeline;
pub mod server;
pub mod server_info;
pub mod socket;
pub mod test_util;
pub mod util;

pub use channel::Channel;
pub use client::{Client, ConnectResult};
pub use config::QuadlinkConfig;
pub use packet::ConnectCode;
pub use server::Server;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
