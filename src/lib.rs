//! Client SDK for an overlay messaging network: applications address peers by
//!  logical identifier, send discrete messages or byte streams, and receive
//!  delivery acknowledgment despite an unreliable, best-effort relay
//!  substrate.
//!
//! ## Design goals
//!
//! * Two delivery abstractions over the same fire-and-forget frame channel:
//!   * acknowledged discrete messages with per-destination multicast
//!     completion - one outstanding message resolves or times out per
//!     destination, never as an all-or-nothing batch
//!   * ordered, flow-controlled byte streams ("sessions") to a single remote
//!     peer, aggregated over several parallel relay connections for
//!     throughput
//! * Both are built from the same reliability ingredients: deadline
//!   scheduling, acknowledgment matching and resend bookkeeping
//! * The relay substrate is assumed to deliver whole frames at most once and
//!   in no particular order; everything stronger is built here
//! * One scheduling loop per connection and per-session worker tasks, all
//!   cooperatively driven - woken by admitted work, computed deadlines or a
//!   stop signal, never busy-polling
//! * A malformed inbound frame is logged and dropped; it never tears down a
//!   connection or a loop
//! * Acknowledgments for unknown message ids or stale sequence numbers are
//!   expected under retransmission and ignored without ceremony
//!
//! Out of scope, owned by external collaborators: key management and address
//!  validation, RPC discovery of routing nodes, the raw socket connection and
//!  session-initiation handshakes. Their results are handed in through
//!  [`Client`]'s constructor, [`Client::establish_session`] and the per-path
//!  transport event pumps.

pub mod client;
pub mod config;
pub mod connect;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod transport;
pub mod wire;

pub use client::Client;
pub use config::{ClientConfig, ConnectConfig, SessionConfig};
pub use dispatch::{AckReceiver, MessageBody, MessageDispatcher, ReceivedMessage};
pub use error::ClientError;
pub use session::{Session, SessionNegotiation, SessionState};
pub use transport::{FrameTransport, TransportEvent, WorkerId};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
