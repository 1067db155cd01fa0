use crate::error::ClientError;
use crate::wire::{MessageId, Payload};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

/// An outbound message body. Anything else the caller might want to send must
///  be serialized into one of these before it reaches the SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Binary(Bytes),
}

impl MessageBody {
    pub fn len(&self) -> usize {
        match self {
            MessageBody::Text(text) => text.len(),
            MessageBody::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn into_payload(self, message_id: MessageId, reply_to: Option<MessageId>, no_ack: bool) -> Payload {
        match self {
            MessageBody::Text(text) => Payload::text(message_id, reply_to, no_ack, &text),
            MessageBody::Binary(data) => Payload::binary(message_id, reply_to, no_ack, data),
        }
    }
}

/// A message delivered to the application: either an unsolicited inbound
///  message or the acknowledgment that settles an outbound one. `body` is
///  absent for a bare, empty acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub source: String,
    pub message_id: MessageId,
    pub body: Option<MessageBody>,
}

/// Resolves with the acknowledging message, or with the typed error that
///  settled the destination instead.
pub type AckReceiver = oneshot::Receiver<Result<ReceivedMessage, ClientError>>;

struct DestinationSlot {
    resolver: Option<oneshot::Sender<Result<ReceivedMessage, ClientError>>>,
}

impl DestinationSlot {
    fn resolved(&self) -> bool {
        self.resolver.is_none()
    }

    fn settle(&mut self, outcome: Result<ReceivedMessage, ClientError>) -> bool {
        match self.resolver.take() {
            Some(resolver) => {
                // a dropped receiver still counts as settled
                resolver.send(outcome).ok();
                true
            }
            None => false,
        }
    }
}

/// A tracked outbound message awaiting acknowledgment from one or more
///  destinations. Destinations resolve independently; the job is retired only
///  once every slot is settled or the deadline has passed.
pub(crate) struct MessageJob {
    pub message_id: MessageId,
    slots: FxHashMap<String, DestinationSlot>,
    /// the fully serialized relay envelope, ready for transmission
    pub frame: Bytes,
    pub timeout: Duration,
    /// set when the job is transmitted; `None` while it sits in the admission queue
    pub deadline: Option<Instant>,
}

impl MessageJob {
    /// Duplicate destinations are collapsed: one outcome slot (and one
    ///  receiver) per unique destination, in first-occurrence order.
    pub fn new(
        message_id: MessageId,
        destinations: &[String],
        frame: Bytes,
        timeout: Duration,
    ) -> (MessageJob, Vec<AckReceiver>) {
        let mut slots = FxHashMap::default();
        let mut receivers = Vec::with_capacity(destinations.len());

        for destination in destinations {
            if slots.contains_key(destination) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            slots.insert(destination.clone(), DestinationSlot { resolver: Some(tx) });
            receivers.push(rx);
        }

        let job = MessageJob {
            message_id,
            slots,
            frame,
            timeout,
            deadline: None,
        };
        (job, receivers)
    }

    pub fn is_settled(&self) -> bool {
        self.slots.values().all(DestinationSlot::resolved)
    }

    pub fn has_destination(&self, destination: &str) -> bool {
        self.slots.contains_key(destination)
    }

    /// Resolves one destination's slot. Returns false if the destination is
    ///  unknown or already resolved (a duplicate ack, which is a no-op).
    pub fn resolve(&mut self, destination: &str, message: ReceivedMessage) -> bool {
        match self.slots.get_mut(destination) {
            Some(slot) if !slot.resolved() => slot.settle(Ok(message)),
            Some(_) => {
                trace!("destination {} of message {:?} acknowledged twice - ignoring", destination, self.message_id);
                false
            }
            None => false,
        }
    }

    /// Rejects every still-unresolved slot with `error`, atomically from the
    ///  caller's point of view: each destination reports exactly once.
    pub fn reject_unresolved(&mut self, error: ClientError) {
        for slot in self.slots.values_mut() {
            if !slot.resolved() {
                slot.settle(Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(destinations: &[&str]) -> (MessageJob, Vec<AckReceiver>) {
        let destinations = destinations.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        MessageJob::new(
            MessageId::from_raw([1, 2, 3, 4]),
            &destinations,
            Bytes::from_static(b"frame"),
            Duration::from_secs(5),
        )
    }

    fn message(source: &str) -> ReceivedMessage {
        ReceivedMessage {
            source: source.to_owned(),
            message_id: MessageId::from_raw([9, 9, 9, 9]),
            body: None,
        }
    }

    #[test]
    fn test_destinations_resolve_independently() {
        let (mut job, mut receivers) = job(&["a", "b"]);
        assert!(!job.is_settled());

        assert!(job.resolve("a", message("a")));
        assert!(!job.is_settled());
        assert_eq!(receivers.remove(0).try_recv().unwrap().unwrap().source, "a");

        assert!(job.resolve("b", message("b")));
        assert!(job.is_settled());
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let (mut job, _receivers) = job(&["a"]);
        assert!(job.resolve("a", message("a")));
        assert!(!job.resolve("a", message("a")));
    }

    #[test]
    fn test_unknown_destination_is_noop() {
        let (mut job, _receivers) = job(&["a"]);
        assert!(!job.resolve("stranger", message("stranger")));
        assert!(!job.is_settled());
    }

    #[test]
    fn test_duplicate_destinations_are_collapsed() {
        let (job, receivers) = job(&["a", "b", "a"]);
        assert_eq!(receivers.len(), 2);
        assert_eq!(job.slots.len(), 2);
    }

    #[test]
    fn test_reject_unresolved_skips_resolved_slots() {
        let (mut job, mut receivers) = job(&["a", "b"]);
        job.resolve("a", message("a"));

        job.reject_unresolved(ClientError::AckTimeout(job.message_id));

        assert!(job.is_settled());
        assert!(receivers.remove(0).try_recv().unwrap().is_ok());
        assert_eq!(
            receivers.remove(0).try_recv().unwrap(),
            Err(ClientError::AckTimeout(MessageId::from_raw([1, 2, 3, 4]))),
        );
    }

    #[test]
    fn test_dropped_receiver_still_settles() {
        let (mut job, receivers) = job(&["a"]);
        drop(receivers);

        assert!(job.resolve("a", message("a")));
        assert!(job.is_settled());
    }
}
