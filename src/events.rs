//! Application-facing event surfaces. Handlers run inline on the receive
//!  loop, so implementations should hand heavy work off to their own tasks.

use crate::channel::Channel;
use crate::packet::ConnectCode;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;

/// Events a [`Server`](crate::Server) raises. All methods default to no-ops
///  so handlers implement only what they care about.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerEventHandler: Send + Sync + 'static {
    /// A peer finished the handshake and was assigned `client_id`.
    async fn on_client_connected(&self, client_id: u64) {
        let _ = client_id;
    }

    /// A handshake failed - wrong protocol or failed authentication. The
    ///  peer record is already gone when this fires.
    async fn on_authentication_failed(&self, peer_addr: SocketAddr, code: ConnectCode) {
        let _ = (peer_addr, code);
    }

    /// Application data arrived from an authenticated peer.
    async fn on_data(&self, client_id: u64, channel: Channel, data: Vec<u8>) {
        let _ = (client_id, channel, data);
    }

    /// A connection ended - peer-initiated termination, server-initiated
    ///  disconnect, or idle timeout.
    async fn on_connection_terminated(&self, client_id: u64, reason: String) {
        let _ = (client_id, reason);
    }
}

/// Events a [`Client`](crate::Client) raises.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientEventHandler: Send + Sync + 'static {
    /// Application data arrived from the server.
    async fn on_data(&self, channel: Channel, data: Vec<u8>) {
        let _ = (channel, data);
    }

    /// The server terminated this connection.
    async fn on_disconnected_by_server(&self, reason: String) {
        let _ = reason;
    }
}

/// Handler for endpoints that do not consume events.
pub struct NullEventHandler;

#[async_trait]
impl ServerEventHandler for NullEventHandler {}

#[async_trait]
impl ClientEventHandler for NullEventHandler {}
