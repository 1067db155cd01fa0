use crate::wire::MessageId;
use thiserror::Error;

/// Errors surfaced to SDK callers, either synchronously or through the
///  per-destination acknowledgment promises.
///
/// Decode failures of inbound frames are deliberately *not* represented here:
///  a malformed frame is logged and discarded without affecting the connection,
///  and an acknowledgment for an unknown message id or stale sequence number is
///  a no-op since duplicate and late acks are expected under retransmission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The deadline of an outbound message elapsed before an acknowledgment
    ///  arrived. Reported exactly once per unacknowledged destination.
    #[error("no acknowledgment for message {0:?} before its deadline")]
    AckTimeout(MessageId),

    /// The payload is too large for the relay codec to frame. Rejected
    ///  synchronously, before any network activity.
    #[error("payload of {0} bytes cannot be framed for the relay")]
    UnsupportedPayload(usize),

    #[error("at least one destination is required")]
    NoDestinations,

    #[error("at least one routing node is required")]
    NoRoutingNodes,

    #[error("client is not running")]
    NotRunning,

    #[error("client is already running")]
    AlreadyRunning,

    /// The underlying frame channel failed. Propagated to the collaborator
    ///  owning connection establishment; the core never retries on its own.
    #[error("connection to the relay node was lost")]
    ConnectionLost,

    #[error("session is not established")]
    SessionNotEstablished,
}
