use anyhow::bail;
use std::time::Duration;

/// Configuration shared by [`Server`](crate::Server) and
///  [`Client`](crate::Client) instances. The `new` constructor fills in
///  defaults that are reasonable for game traffic on consumer connections;
///  applications with unusual tick rates or link characteristics can adjust
///  the fields before starting an endpoint.
pub struct QuadlinkConfig {
    /// The application protocol this endpoint speaks. A server accepts a
    ///  connection request only if the client's protocol id equals this value
    ///  or appears in `supported_secondary_protocol_ids`; anything else is
    ///  answered with an unsupported-protocol response and the peer is
    ///  dropped.
    pub protocol_id: u32,

    /// Older protocol ids this server is still willing to serve, e.g. during
    ///  a staged client rollout. Ignored on the client side.
    pub supported_secondary_protocol_ids: Vec<u32>,

    /// Upper bound on concurrently tracked remote connections. Datagrams from
    ///  unknown endpoints are dropped while the registry is full; established
    ///  peers are unaffected.
    pub max_connections: u32,

    /// A peer from which no datagram has arrived for this long is considered
    ///  lost and disconnected as if it had sent a termination. The client's
    ///  keep-alive and ping duties guarantee that a live peer is never this
    ///  quiet, so expiry really means the peer or the path is gone.
    pub idle_timeout: Duration,

    /// Age at which an unacknowledged reliable packet is retransmitted.
    ///
    /// This is a fixed budget rather than an RTT-derived estimate: it must
    ///  comfortably exceed the worst acceptable round trip plus the peer's
    ///  ack carriage delay (acks ride on the peer's next outbound packet).
    pub resend_budget: Duration,

    /// Cadence of the scan over unacknowledged reliable packets.
    pub retransmit_scan_interval: Duration,

    /// When nothing has been sent for this long, the client emits a
    ///  keep-alive so the server's idle scan never evicts a quiet peer.
    pub keepalive_interval: Duration,

    /// Cadence of the client's RTT probes.
    pub ping_interval: Duration,

    /// Width of the sliding window over which observed round trips are
    ///  averaged.
    pub ping_window: Duration,

    /// Capacity of the per-peer table of recently received reliable sequence
    ///  numbers awaiting acknowledgement. On overflow the lowest entry is
    ///  evicted; every outgoing packet carries the table's contents as its
    ///  piggybacked ack list.
    pub received_ack_capacity: usize,

    /// Upper bound for every length-prefixed field on the wire, checked both
    ///  when sending and when decoding hostile input.
    pub max_payload: usize,
}

impl QuadlinkConfig {
    pub fn new(protocol_id: u32) -> QuadlinkConfig {
        QuadlinkConfig {
            protocol_id,
            supported_secondary_protocol_ids: Vec::new(),
            max_connections: 64,
            idle_timeout: Duration::from_secs(10),
            resend_budget: Duration::from_millis(1000),
            retransmit_scan_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(500),
            ping_interval: Duration::from_millis(300),
            ping_window: Duration::from_secs(1),
            received_ack_capacity: 32,
            max_payload: 64 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.max_payload == 0 {
            bail!("max_payload must be positive");
        }
        if self.received_ack_capacity == 0 {
            bail!("received_ack_capacity must be positive");
        }
        if self.resend_budget < self.retransmit_scan_interval {
            bail!("resend_budget must not be shorter than the retransmit scan interval");
        }
        if self.idle_timeout <= self.keepalive_interval {
            bail!("idle_timeout must exceed keepalive_interval, or live peers get evicted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(QuadlinkConfig::new(5).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let mut config = QuadlinkConfig::new(5);
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_resend_budget() {
        let mut config = QuadlinkConfig::new(5);
        config.resend_budget = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_idle_timeout_below_keepalive() {
        let mut config = QuadlinkConfig::new(5);
        config.idle_timeout = Duration::from_millis(400);
        assert!(config.validate().is_err());
    }
}
