//! Acknowledged request/response exchanges over fire-and-forget relay frames.
//!
//! One scheduling loop per connection owns the pending-job table; everything
//!  that mutates it - admissions, inbound frames, the stop signal - funnels
//!  through the loop's event inbox, so no mutation ever races another.

mod dispatcher;
mod job;

pub use dispatcher::{InboundHandler, MessageDispatcher};
pub use job::{AckReceiver, MessageBody, ReceivedMessage};
