use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Restores the application-visible ordering of a session's inbound chunks.
///
/// Workers deliver chunks in whatever order their paths happen to produce;
///  this buffer holds out-of-order arrivals and releases the longest
///  contiguous run starting at the next undelivered sequence number. Chunks
///  below that sequence number, or already buffered, are duplicates from
///  retransmission and are dropped.
pub struct ReassemblyBuffer {
    /// next sequence number to deliver; session sequence numbers start at 1
    next_seq: u64,
    pending: BTreeMap<u64, Bytes>,
    delivery: mpsc::UnboundedSender<Bytes>,
}

impl ReassemblyBuffer {
    pub fn new(delivery: mpsc::UnboundedSender<Bytes>) -> ReassemblyBuffer {
        ReassemblyBuffer {
            next_seq: 1,
            pending: BTreeMap::default(),
            delivery,
        }
    }

    pub fn on_chunk(&mut self, seq: u64, data: Bytes) {
        if seq < self.next_seq {
            debug!("chunk #{} already delivered - dropping duplicate", seq);
            return;
        }
        if self.pending.contains_key(&seq) {
            debug!("chunk #{} already buffered - dropping duplicate", seq);
            return;
        }

        self.pending.insert(seq, data);

        while let Some(data) = self.pending.remove(&self.next_seq) {
            trace!("delivering chunk #{} ({} bytes)", self.next_seq, data.len());
            // a closed receiver means the application stopped reading; ordering
            //  state must still advance so acks stay truthful
            let _ = self.delivery.send(data);
            self.next_seq += 1;
        }
    }

    /// Chunks buffered above a gap, i.e. received but not yet deliverable.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
