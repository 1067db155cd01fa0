//! Ordered, flow-controlled, multi-path byte delivery to one remote peer.
//!
//! A session spreads sequence-numbered chunks over several transport paths
//!  ("workers") for throughput aggregation. Reliability is built from four
//!  pieces of bookkeeping, all owned by the session: the in-flight map of
//!  unacknowledged chunks, the resend queue ordered by ascending sequence
//!  number, the pending acknowledgment bundles for inbound chunks, and the
//!  cumulative-bytes index that turns acknowledgment progress into send-window
//!  room.

mod chunk;
mod reassembly;
mod rtt;
mod session;
mod worker;

pub use chunk::{AckBundle, DataChunk, SentLog};
pub use session::{Session, SessionNegotiation, SessionState};
