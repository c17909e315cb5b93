//! Utilities for testing code built on quadlink endpoints. They are used by
//!  the crate's own integration tests, and they are exported so applications
//!  can drive their own netcode through a simulated network. That requires
//!  them to be part of the regular (non-`#[cfg(test)]`) crate.

pub mod fake_network;

use crate::channel::Channel;
use crate::events::{ClientEventHandler, ServerEventHandler};
use crate::packet::ConnectCode;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::Duration;

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Server event handler that records everything it sees.
pub struct RecordingServerEvents {
    pub connected: Mutex<Vec<u64>>,
    pub auth_failures: Mutex<Vec<(SocketAddr, ConnectCode)>>,
    pub data: Mutex<Vec<(u64, Channel, Vec<u8>)>>,
    pub terminated: Mutex<Vec<(u64, String)>>,
}

impl RecordingServerEvents {
    pub fn new() -> RecordingServerEvents {
        RecordingServerEvents {
            connected: Mutex::new(Vec::new()),
            auth_failures: Mutex::new(Vec::new()),
            data: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingServerEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerEventHandler for RecordingServerEvents {
    async fn on_client_connected(&self, client_id: u64) {
        self.connected.lock().push(client_id);
    }

    async fn on_authentication_failed(&self, peer_addr: SocketAddr, code: ConnectCode) {
        self.auth_failures.lock().push((peer_addr, code));
    }

    async fn on_data(&self, client_id: u64, channel: Channel, data: Vec<u8>) {
        self.data.lock().push((client_id, channel, data));
    }

    async fn on_connection_terminated(&self, client_id: u64, reason: String) {
        self.terminated.lock().push((client_id, reason));
    }
}

/// Client event handler that records everything it sees.
pub struct RecordingClientEvents {
    pub data: Mutex<Vec<(Channel, Vec<u8>)>>,
    pub disconnected: Mutex<Vec<String>>,
}

impl RecordingClientEvents {
    pub fn new() -> RecordingClientEvents {
        RecordingClientEvents {
            data: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingClientEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientEventHandler for RecordingClientEvents {
    async fn on_data(&self, channel: Channel, data: Vec<u8>) {
        self.data.lock().push((channel, data));
    }

    async fn on_disconnected_by_server(&self, reason: String) {
        self.disconnected.lock().push(reason);
    }
}
