//! Codec boundary between the reliability engine and the relay substrate.
//!
//! The relay treats payloads as opaque bytes; everything in this module is
//!  client-to-client framing. Decode failures are reported as errors to the
//!  caller, which logs and discards the frame - one bad frame never aborts a
//!  receive loop.

mod envelope;
mod message_id;
mod payload;
mod session_frame;

pub use envelope::{InboundEnvelope, OutboundEnvelope};
pub use message_id::MessageId;
pub use payload::{Payload, PayloadKind};
pub use session_frame::{SessionFrame, SessionOp};
