use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::fmt::{Debug, Formatter};

/// Identifies one transport path of a client. Sessions use it to attribute
///  sent chunks and pending acknowledgments to the path they belong to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl Debug for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// One full-duplex frame channel to a relay node. This is an abstraction over
///  the actual connection (kept outside the core), introduced to facilitate
///  mocking the I/O part away for testing.
///
/// The substrate is best-effort: a successful send means the frame left the
///  local end, not that it was delivered. Frames arrive whole or not at all.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()>;
}

/// Inbound notifications from one transport path, delivered to the client's
///  event pump on a channel. This models the received-frame and
///  connection-loss callbacks of the underlying connection.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(Bytes),
    ConnectionLost,
}
