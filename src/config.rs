use anyhow::bail;
use std::time::Duration;

/// Client-wide tunables. All values are used as bounds by the core - chunk
///  size, window size and worker count are normally dictated by the session
///  negotiation handshake, which is performed by an external collaborator.
#[derive(Clone)]
pub struct ClientConfig {
    /// Deadline for a single outbound message, counted from its transmission
    ///  (not from enqueueing). One slow destination in a multicast does not
    ///  extend or shorten the deadline of the others.
    pub message_ack_timeout: Duration,

    /// Upper bound for a single relay payload. Larger payloads are rejected
    ///  synchronously - the relay substrate delivers whole frames only, so
    ///  there is no fragmentation path for discrete messages. Byte streams
    ///  that exceed this bound go through a session instead.
    pub max_payload_len: usize,

    /// How long relay nodes may hold a frame for an offline destination.
    ///  Zero means "deliver now or drop".
    pub max_holding_secs: u32,

    /// Suppress the automatic empty ACK for inbound messages that the
    ///  handler does not answer. The flag travels in the outbound envelope,
    ///  so it suppresses acks sent *to us* by well-behaved peers.
    pub suppress_auto_acks: bool,

    /// Capacity of the dispatcher's admission queue. Senders are suspended
    ///  while the queue is full.
    pub dispatch_queue_capacity: usize,

    pub session: SessionConfig,
    pub connect: ConnectConfig,
}

#[derive(Clone)]
pub struct SessionConfig {
    /// Chunk size for outbound session data. Negotiated down during the
    ///  session handshake; never exceeded.
    pub mtu: usize,

    /// Maximum unacknowledged byte volume in flight per session.
    pub window_size: usize,

    /// Number of parallel transport paths ("workers") a session spreads its
    ///  chunks over. Bounded by the number of connected transports and by the
    ///  number of address prefixes the remote announced.
    pub worker_count: usize,

    /// Extra admission queue capacity beyond `window_size / mtu * worker_count`,
    ///  so chunking never stalls on queue capacity alone while the window is open.
    pub admission_queue_slack: usize,

    /// Interval of the scan that moves acknowledgment-overdue chunks onto the
    ///  resend queue. Chunk age is judged against the sending worker's
    ///  adaptive retransmission timeout, not against this interval.
    pub resend_scan_interval: Duration,

    /// Interval at which pending acknowledgment bundles are transmitted.
    pub ack_flush_interval: Duration,

    /// Retransmission timeout before any round-trip sample exists for a path.
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,

    /// Upper bound for the graceful close drain: how long `close()` waits for
    ///  outstanding chunks to be acknowledged before giving up on them.
    pub drain_timeout: Duration,
}

#[derive(Clone)]
pub struct ConnectConfig {
    /// Additional connection attempts after the first one fails, walking the
    ///  routing node list round-robin.
    pub retries: u32,

    /// Seed for the round-robin start index, making node selection
    ///  deterministic for a given configuration.
    pub selection_seed: u64,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            message_ack_timeout: Duration::from_secs(5),
            max_payload_len: 1024 * 1024,
            max_holding_secs: 0,
            suppress_auto_acks: false,
            dispatch_queue_capacity: 64,
            session: SessionConfig::default(),
            connect: ConnectConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            mtu: 1024,
            window_size: 1024 * 1024,
            worker_count: 4,
            admission_queue_slack: 16,
            resend_scan_interval: Duration::from_millis(100),
            ack_flush_interval: Duration::from_millis(50),
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> ConnectConfig {
        ConnectConfig {
            retries: 3,
            selection_seed: 0,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_len == 0 {
            bail!("max payload length must be positive");
        }
        if self.dispatch_queue_capacity == 0 {
            bail!("dispatch queue capacity must be positive");
        }
        self.session.validate()
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu == 0 {
            bail!("session MTU must be positive");
        }
        if self.window_size < self.mtu {
            bail!("session window must hold at least one chunk");
        }
        if self.worker_count == 0 {
            bail!("a session needs at least one worker path");
        }
        if self.min_rto > self.max_rto {
            bail!("minimum RTO exceeds maximum RTO");
        }
        Ok(())
    }

    /// Admission queue capacity: enough chunks to fill the window on every
    ///  worker path, plus slack.
    pub fn admission_capacity(&self) -> usize {
        self.window_size / self.mtu * self.worker_count + self.admission_queue_slack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_mtu(0, 1024, 1, false)]
    #[case::window_below_mtu(1024, 1023, 1, false)]
    #[case::no_workers(1024, 4096, 0, false)]
    #[case::minimal(16, 16, 1, true)]
    fn test_session_validate(#[case] mtu: usize, #[case] window: usize, #[case] workers: usize, #[case] ok: bool) {
        let config = SessionConfig {
            mtu,
            window_size: window,
            worker_count: workers,
            ..SessionConfig::default()
        };
        assert_eq!(config.validate().is_ok(), ok);
    }

    #[rstest]
    #[case(1024, 4096, 2, 16, 24)]
    #[case(16, 16, 1, 0, 1)]
    fn test_admission_capacity(#[case] mtu: usize, #[case] window: usize, #[case] workers: usize, #[case] slack: usize, #[case] expected: usize) {
        let config = SessionConfig {
            mtu,
            window_size: window,
            worker_count: workers,
            admission_queue_slack: slack,
            ..SessionConfig::default()
        };
        assert_eq!(config.admission_capacity(), expected);
    }
}
