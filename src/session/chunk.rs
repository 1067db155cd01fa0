use crate::transport::WorkerId;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

/// A sequence-numbered fragment of a session's outbound byte stream. Sequence
///  numbers are session-scoped, start at 1 and are never reused; a resent
///  chunk keeps its original sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub seq: u64,
    pub data: Bytes,
}

/// Bookkeeping for a transmitted, not-yet-acknowledged chunk: when it was
///  sent and which worker path sent it. The acknowledgment reports the
///  round-trip time back to that worker, and the resend scan judges the
///  chunk's age against that worker's retransmission timeout.
#[derive(Debug, Clone, Copy)]
pub struct SentLog {
    pub sent_at: Instant,
    pub worker: WorkerId,
}

/// A contiguous run of received chunk sequence numbers awaiting transmission
///  as a single acknowledgment, attributed to the worker path the chunks
///  arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBundle {
    pub worker: WorkerId,
    pub start_seq: u64,
    pub count: u64,
}

impl AckBundle {
    fn contains(&self, seq: u64) -> bool {
        self.start_seq <= seq && seq < self.start_seq + self.count
    }
}

/// Registers a received chunk with the pending-acknowledgment bundles,
///  keeping adjacent runs for the same worker merged. The number of bundles
///  stays proportional to the number of *gaps* in the received sequence, not
///  to the number of chunks.
pub fn register_pending_ack(bundles: &mut Vec<AckBundle>, worker: WorkerId, seq: u64) {
    if bundles.iter().any(|b| b.worker == worker && b.contains(seq)) {
        trace!("chunk #{} already covered by a pending ack bundle - duplicate", seq);
        return;
    }

    let append_idx = bundles.iter().position(|b| b.worker == worker && b.start_seq + b.count == seq);
    let prepend_idx = bundles.iter().position(|b| b.worker == worker && b.start_seq == seq + 1);

    match (append_idx, prepend_idx) {
        (Some(a), Some(p)) => {
            // the chunk closes the gap between two runs - fuse them
            bundles[a].count += 1 + bundles[p].count;
            bundles.remove(p);
        }
        (Some(a), None) => bundles[a].count += 1,
        (None, Some(p)) => {
            bundles[p].start_seq -= 1;
            bundles[p].count += 1;
        }
        (None, None) => bundles.push(AckBundle {
            worker,
            start_seq: seq,
            count: 1,
        }),
    }
}
