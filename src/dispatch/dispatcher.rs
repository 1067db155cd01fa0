use crate::config::ClientConfig;
use crate::dispatch::job::{AckReceiver, MessageBody, MessageJob, ReceivedMessage};
use crate::error::ClientError;
use crate::transport::FrameTransport;
use crate::wire::{MessageId, OutboundEnvelope, Payload, PayloadKind};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Handler for unsolicited inbound messages. A returned body is sent back to
///  the source as a reply; `None` lets the automatic empty ACK apply.
pub type InboundHandler = dyn Fn(ReceivedMessage) -> Option<MessageBody> + Send + Sync;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

pub(crate) enum DispatcherEvent {
    Inbound { source: String, payload: Payload },
    Stop,
}

/// Turns the fire-and-forget relay substrate into acknowledged,
///  timeout-bounded request/response exchanges, including multicast fan-out
///  with per-destination partial completion.
///
/// One scheduling loop per connection owns the pending-job table. The loop
///  wakes when new work is admitted, when an inbound frame arrives, when the
///  earliest pending deadline passes, or when the stop signal fires; it never
///  busy-polls.
pub struct MessageDispatcher {
    config: Arc<ClientConfig>,
    transport: Arc<dyn FrameTransport>,
    handler: Arc<RwLock<Option<Arc<InboundHandler>>>>,
    suppress_auto_acks: Arc<AtomicBool>,
    admission_tx: mpsc::Sender<MessageJob>,
    event_tx: mpsc::UnboundedSender<DispatcherEvent>,
    loop_channels: std::sync::Mutex<Option<(mpsc::Receiver<MessageJob>, mpsc::UnboundedReceiver<DispatcherEvent>)>>,
    state: AtomicU8,
}

impl MessageDispatcher {
    pub fn new(transport: Arc<dyn FrameTransport>, config: Arc<ClientConfig>) -> MessageDispatcher {
        let (admission_tx, admission_rx) = mpsc::channel(config.dispatch_queue_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        MessageDispatcher {
            suppress_auto_acks: Arc::new(AtomicBool::new(config.suppress_auto_acks)),
            config,
            transport,
            handler: Arc::new(RwLock::new(None)),
            admission_tx,
            event_tx,
            loop_channels: std::sync::Mutex::new(Some((admission_rx, event_rx))),
            state: AtomicU8::new(STATE_IDLE),
        }
    }

    /// Registers the handler for unsolicited inbound messages, replacing any
    ///  previous one.
    pub async fn on_message(&self, handler: impl Fn(ReceivedMessage) -> Option<MessageBody> + Send + Sync + 'static) {
        *self.handler.write().await = Some(Arc::new(handler));
    }

    pub fn set_suppress_auto_acks(&self, suppress: bool) {
        self.suppress_auto_acks.store(suppress, Ordering::Relaxed);
    }

    /// Starts the scheduling loop for this connection.
    pub fn spawn_loop(&self) -> Result<(), ClientError> {
        if self.state.compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(ClientError::AlreadyRunning);
        }

        let (admission_rx, event_rx) = self.loop_channels.lock()
            .expect("loop channel lock poisoned")
            .take()
            .expect("loop channels consumed without state transition");

        tokio::spawn(SchedulingLoop {
            config: self.config.clone(),
            transport: self.transport.clone(),
            handler: self.handler.clone(),
            suppress_auto_acks: self.suppress_auto_acks.clone(),
            admission_tx: self.admission_tx.clone(),
            admission_rx,
            event_rx,
            pending: FxHashMap::default(),
            stopping: false,
        }.run());
        Ok(())
    }

    /// Signals the loop to stop. Jobs already admitted are still transmitted;
    ///  afterwards every unresolved pending slot is rejected with `NotRunning`.
    pub fn stop(&self) -> Result<(), ClientError> {
        if self.state.compare_exchange(STATE_RUNNING, STATE_STOPPED, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(ClientError::NotRunning);
        }
        self.event_tx.send(DispatcherEvent::Stop).ok();
        Ok(())
    }

    /// Sends `body` to each destination, returning one acknowledgment
    ///  receiver per unique destination. Suspends while the admission queue
    ///  is full. The deadline starts at transmission, with `timeout` falling
    ///  back to the configured acknowledgment timeout.
    pub async fn send_message(
        &self,
        destinations: Vec<String>,
        reply_to: Option<MessageId>,
        body: MessageBody,
        timeout: Option<Duration>,
    ) -> Result<Vec<AckReceiver>, ClientError> {
        if self.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(ClientError::NotRunning);
        }
        if destinations.is_empty() {
            return Err(ClientError::NoDestinations);
        }
        if body.len() > self.config.max_payload_len {
            return Err(ClientError::UnsupportedPayload(body.len()));
        }

        let message_id = MessageId::random();
        let payload = body.into_payload(message_id, reply_to, self.suppress_auto_acks.load(Ordering::Relaxed));
        let frame = build_frame(destinations.clone(), &payload, self.config.max_holding_secs);
        let (job, receivers) = MessageJob::new(
            message_id,
            &destinations,
            frame,
            timeout.unwrap_or(self.config.message_ack_timeout),
        );

        debug!("queueing message {:?} for {} destination(s)", message_id, destinations.len());
        self.admission_tx.send(job).await.map_err(|_| ClientError::NotRunning)?;
        Ok(receivers)
    }

    /// Sends an empty acknowledgment, bypassing the job queue: acks are
    ///  fire-and-forget and never tracked.
    pub async fn send_ack(&self, destination: &str, reply_to: MessageId) {
        send_ack_frame(self.transport.as_ref(), &self.config, destination, reply_to).await;
    }

    /// Feeds one decoded inbound payload into the scheduling loop.
    pub fn on_inbound(&self, source: String, payload: Payload) {
        self.event_tx.send(DispatcherEvent::Inbound { source, payload }).ok();
    }
}

fn build_frame(destinations: Vec<String>, payload: &Payload, max_holding_secs: u32) -> Bytes {
    let mut payload_buf = BytesMut::new();
    payload.ser(&mut payload_buf);

    OutboundEnvelope {
        destinations,
        payload: payload_buf.freeze(),
        max_holding_secs,
    }.ser()
}

async fn send_ack_frame(transport: &dyn FrameTransport, config: &ClientConfig, destination: &str, reply_to: MessageId) {
    let payload = Payload::ack(reply_to);
    let frame = build_frame(vec![destination.to_owned()], &payload, config.max_holding_secs);
    if let Err(e) = transport.send_frame(&frame).await {
        error!("error sending ACK to {}: {}", destination, e);
    }
}

fn decode_received(source: &str, payload: &Payload) -> anyhow::Result<ReceivedMessage> {
    let body = match payload.kind {
        PayloadKind::Text => Some(MessageBody::Text(std::str::from_utf8(&payload.body)?.to_owned())),
        PayloadKind::Binary => Some(MessageBody::Binary(payload.body.clone())),
        PayloadKind::Ack => None,
        PayloadKind::Session => anyhow::bail!("session payloads are not dispatcher messages"),
    };

    Ok(ReceivedMessage {
        source: source.to_owned(),
        message_id: payload.message_id,
        body,
    })
}

struct SchedulingLoop {
    config: Arc<ClientConfig>,
    transport: Arc<dyn FrameTransport>,
    handler: Arc<RwLock<Option<Arc<InboundHandler>>>>,
    suppress_auto_acks: Arc<AtomicBool>,
    /// handler replies are admitted through the regular queue
    admission_tx: mpsc::Sender<MessageJob>,
    admission_rx: mpsc::Receiver<MessageJob>,
    event_rx: mpsc::UnboundedReceiver<DispatcherEvent>,
    pending: FxHashMap<MessageId, MessageJob>,
    stopping: bool,
}

impl SchedulingLoop {
    async fn run(mut self) {
        debug!("starting dispatcher scheduling loop");

        loop {
            // settle / expire pass over the pending table; the next wake time
            //  is the minimum deadline among the jobs that survive it
            let now = Instant::now();
            let mut next_deadline: Option<Instant> = None;
            self.pending.retain(|id, job| {
                if job.is_settled() {
                    return false;
                }
                match job.deadline {
                    Some(deadline) if deadline <= now => {
                        debug!("message {:?} timed out waiting for acknowledgment", id);
                        job.reject_unresolved(ClientError::AckTimeout(*id));
                        false
                    }
                    Some(deadline) => {
                        next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                        true
                    }
                    None => true,
                }
            });

            // admit at most one queued job per wakeup
            match self.admission_rx.try_recv() {
                Ok(job) => {
                    self.transmit(job).await;
                    continue;
                }
                Err(_) => {
                    if self.stopping {
                        break;
                    }
                }
            }

            tokio::select! {
                maybe_event = self.event_rx.recv() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => self.stopping = true,
                },
                maybe_job = self.admission_rx.recv() => match maybe_job {
                    Some(job) => self.transmit(job).await,
                    None => self.stopping = true,
                },
                _ = time::sleep_until(next_deadline.unwrap_or(now)), if next_deadline.is_some() => {}
            }
        }

        // deterministic shutdown: in-flight jobs are not silently abandoned
        debug!("dispatcher loop terminating, draining {} pending job(s)", self.pending.len());
        for (_, mut job) in self.pending.drain() {
            job.reject_unresolved(ClientError::NotRunning);
        }
    }

    async fn transmit(&mut self, mut job: MessageJob) {
        job.deadline = Some(Instant::now() + job.timeout);
        trace!("transmitting message {:?}", job.message_id);

        if let Err(e) = self.transport.send_frame(&job.frame).await {
            error!("error transmitting message {:?}: {}", job.message_id, e);
            // the job stays pending regardless; its deadline settles it if no ack arrives
        }
        self.pending.insert(job.message_id, job);
    }

    async fn handle_event(&mut self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::Stop => {
                debug!("dispatcher stop requested");
                self.stopping = true;
            }
            DispatcherEvent::Inbound { source, payload } => self.on_inbound_payload(source, payload).await,
        }
    }

    async fn on_inbound_payload(&mut self, source: String, payload: Payload) {
        if payload.kind == PayloadKind::Session {
            debug!("session payload reached the dispatcher - dropping");
            return;
        }

        // a frame is a reply iff its reply-to id matches a pending job *and*
        //  its source is one of that job's destinations
        let mut matched = false;
        if let Some(reply_to) = payload.reply_to {
            if let Some(job) = self.pending.get_mut(&reply_to) {
                if job.has_destination(&source) {
                    matched = true;
                    match decode_received(&source, &payload) {
                        Ok(message) => {
                            job.resolve(&source, message);
                            if job.is_settled() {
                                debug!("message {:?} fully acknowledged", reply_to);
                                self.pending.remove(&reply_to);
                            }
                        }
                        Err(e) => warn!("acknowledgment for {:?} with undecodable body - discarding: {}", reply_to, e),
                    }
                }
            }
        }

        if matched || payload.kind == PayloadKind::Ack {
            // unmatched ACKs are expected under retransmission; they are
            //  neither auto-acked nor forwarded to the handler
            return;
        }

        let message = match decode_received(&source, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("inbound message from {} with undecodable body - discarding: {}", source, e);
                return;
            }
        };

        let handler = self.handler.read().await.clone();
        match handler.and_then(|handler| handler(message)) {
            Some(reply_body) => self.enqueue_reply(source, payload.message_id, reply_body),
            None => {
                if !payload.no_ack {
                    trace!("sending automatic empty ACK to {}", source);
                    send_ack_frame(self.transport.as_ref(), &self.config, &source, payload.message_id).await;
                }
            }
        }
    }

    fn enqueue_reply(&mut self, destination: String, reply_to: MessageId, body: MessageBody) {
        if body.len() > self.config.max_payload_len {
            warn!("handler reply of {} bytes exceeds the maximum payload length - dropping", body.len());
            return;
        }

        let message_id = MessageId::random();
        let no_ack = self.suppress_auto_acks.load(Ordering::Relaxed);
        let payload = body.into_payload(message_id, Some(reply_to), no_ack);
        let frame = build_frame(vec![destination.clone()], &payload, self.config.max_holding_secs);
        let (job, _receivers) = MessageJob::new(message_id, std::slice::from_ref(&destination), frame, self.config.message_ack_timeout);

        // admitted without suspension from inside the loop; a full queue drops the reply
        if self.admission_tx.try_send(job).is_err() {
            warn!("admission queue full - dropping handler reply to {}", destination);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::sync::mpsc::error::TryRecvError;

    struct RecordingTransport {
        frames: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl FrameTransport for RecordingTransport {
        async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
            self.frames.send(frame.to_vec()).ok();
            Ok(())
        }
    }

    fn dispatcher() -> (MessageDispatcher, mpsc::UnboundedReceiver<Vec<u8>>) {
        dispatcher_with_config(ClientConfig::default())
    }

    fn dispatcher_with_config(config: ClientConfig) -> (MessageDispatcher, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RecordingTransport { frames: tx });
        (MessageDispatcher::new(transport, Arc::new(config)), rx)
    }

    fn decode_outbound(frame: &[u8]) -> (Vec<String>, Payload) {
        let envelope = OutboundEnvelope::deser(&mut &frame[..]).unwrap();
        let payload = Payload::deser(&mut &envelope.payload[..]).unwrap();
        (envelope.destinations, payload)
    }

    fn id(b: u8) -> MessageId {
        MessageId::from_raw([b, b, b, b])
    }

    async fn settle(millis: u64) {
        time::sleep(Duration::from_millis(millis)).await;
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (dispatcher, _frames) = dispatcher();

        assert_eq!(
            dispatcher.send_message(vec!["bob".to_owned()], None, MessageBody::Text("x".to_owned()), None).await.err(),
            Some(ClientError::NotRunning),
        );

        assert!(dispatcher.spawn_loop().is_ok());
        assert_eq!(dispatcher.spawn_loop().err(), Some(ClientError::AlreadyRunning));

        assert!(dispatcher.stop().is_ok());
        assert_eq!(dispatcher.stop().err(), Some(ClientError::NotRunning));

        assert_eq!(
            dispatcher.send_message(vec!["bob".to_owned()], None, MessageBody::Text("x".to_owned()), None).await.err(),
            Some(ClientError::NotRunning),
        );
    }

    #[rstest]
    #[case::no_destinations(vec![], MessageBody::Text("x".to_owned()), ClientError::NoDestinations)]
    #[case::oversized(vec!["bob".to_owned()], MessageBody::Binary(Bytes::from_static(&[0u8; 32])), ClientError::UnsupportedPayload(32))]
    fn test_synchronous_rejections(#[case] destinations: Vec<String>, #[case] body: MessageBody, #[case] expected: ClientError) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (dispatcher, _frames) = dispatcher_with_config(ClientConfig {
                max_payload_len: 16,
                ..ClientConfig::default()
            });
            dispatcher.spawn_loop().unwrap();

            assert_eq!(dispatcher.send_message(destinations, None, body, None).await.err(), Some(expected));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_resolves_pending_job() {
        let (dispatcher, mut frames) = dispatcher();
        dispatcher.spawn_loop().unwrap();

        let mut receivers = dispatcher
            .send_message(vec!["bob".to_owned()], None, MessageBody::Text("Hello!".to_owned()), None)
            .await.unwrap();

        let (destinations, payload) = decode_outbound(&frames.recv().await.unwrap());
        assert_eq!(destinations, vec!["bob".to_owned()]);
        assert_eq!(payload.kind, PayloadKind::Text);
        assert_eq!(payload.reply_to, None);

        dispatcher.on_inbound("bob".to_owned(), Payload::text(id(9), Some(payload.message_id), true, "Text message reply!"));

        let reply = receivers.remove(0).await.unwrap().unwrap();
        assert_eq!(reply.source, "bob");
        assert_eq!(reply.body, Some(MessageBody::Text("Text message reply!".to_owned())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_partial_completion() {
        let (dispatcher, mut frames) = dispatcher();
        dispatcher.spawn_loop().unwrap();

        let mut receivers = dispatcher
            .send_message(vec!["bob".to_owned(), "carol".to_owned()], None, MessageBody::Text("ping".to_owned()), None)
            .await.unwrap();
        let (_, payload) = decode_outbound(&frames.recv().await.unwrap());

        // bob acknowledges; carol never does
        dispatcher.on_inbound("bob".to_owned(), Payload::ack(payload.message_id));

        let carol = receivers.remove(1);
        let bob = receivers.remove(0);

        let bob_outcome = bob.await.unwrap().unwrap();
        assert_eq!(bob_outcome.source, "bob");
        assert_eq!(bob_outcome.body, None);

        // carol's slot rejects with AckTimeout once the deadline passes,
        //  independent of bob's earlier resolution
        assert_eq!(carol.await.unwrap(), Err(ClientError::AckTimeout(payload.message_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_from_non_destination_is_unsolicited() {
        let (dispatcher, mut frames) = dispatcher();
        dispatcher.spawn_loop().unwrap();

        let mut receivers = dispatcher
            .send_message(vec!["bob".to_owned()], None, MessageBody::Text("ping".to_owned()), None)
            .await.unwrap();
        let (_, payload) = decode_outbound(&frames.recv().await.unwrap());

        // right reply-to id, wrong source: not a reply, gets auto-acked instead
        dispatcher.on_inbound("mallory".to_owned(), Payload::text(id(9), Some(payload.message_id), false, "spoof"));

        let (destinations, ack) = decode_outbound(&frames.recv().await.unwrap());
        assert_eq!(destinations, vec!["mallory".to_owned()]);
        assert_eq!(ack.kind, PayloadKind::Ack);
        assert_eq!(ack.reply_to, Some(id(9)));

        assert_eq!(receivers.remove(0).await.unwrap(), Err(ClientError::AckTimeout(payload.message_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_reply_is_sent_exactly_once() {
        let (dispatcher, mut frames) = dispatcher();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        dispatcher.on_message(move |message| {
            seen_tx.send(message).ok();
            Some(MessageBody::Text("Text message reply!".to_owned()))
        }).await;
        dispatcher.spawn_loop().unwrap();

        dispatcher.on_inbound("alice".to_owned(), Payload::text(id(7), None, false, "Hello!"));

        let (destinations, reply) = decode_outbound(&frames.recv().await.unwrap());
        assert_eq!(destinations, vec!["alice".to_owned()]);
        assert_eq!(reply.kind, PayloadKind::Text);
        assert_eq!(reply.reply_to, Some(id(7)));

        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen.source, "alice");
        assert_eq!(seen.body, Some(MessageBody::Text("Hello!".to_owned())));

        // the reply job is tracked but no additional ACK is sent
        settle(10).await;
        assert_eq!(frames.try_recv().err(), Some(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_ack_without_handler_reply() {
        let (dispatcher, mut frames) = dispatcher();
        dispatcher.spawn_loop().unwrap();

        dispatcher.on_inbound("alice".to_owned(), Payload::binary(id(7), None, false, Bytes::from_static(b"\xca\xfe")));

        let (destinations, ack) = decode_outbound(&frames.recv().await.unwrap());
        assert_eq!(destinations, vec!["alice".to_owned()]);
        assert_eq!(ack.kind, PayloadKind::Ack);
        assert_eq!(ack.reply_to, Some(id(7)));
        assert!(ack.no_ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ack_flag_suppresses_auto_ack() {
        let (dispatcher, mut frames) = dispatcher();
        dispatcher.spawn_loop().unwrap();

        dispatcher.on_inbound("alice".to_owned(), Payload::text(id(7), None, true, "no ack please"));

        settle(10).await;
        assert_eq!(frames.try_recv().err(), Some(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_ack_is_silent_noop() {
        let (dispatcher, mut frames) = dispatcher();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        dispatcher.on_message(move |message| {
            seen_tx.send(message).ok();
            None
        }).await;
        dispatcher.spawn_loop().unwrap();

        // stale ack: unknown reply-to id
        dispatcher.on_inbound("bob".to_owned(), Payload::ack(id(5)));

        settle(10).await;
        assert_eq!(frames.try_recv().err(), Some(TryRecvError::Empty));
        assert_eq!(seen_rx.try_recv().err(), Some(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_text_body_is_discarded() {
        let (dispatcher, mut frames) = dispatcher();
        dispatcher.spawn_loop().unwrap();

        let mut receivers = dispatcher
            .send_message(vec!["bob".to_owned()], None, MessageBody::Text("ping".to_owned()), None)
            .await.unwrap();
        let (_, payload) = decode_outbound(&frames.recv().await.unwrap());

        // TEXT reply whose body is not valid UTF-8: logged and discarded, the
        //  slot stays unresolved and the deadline still governs it
        dispatcher.on_inbound("bob".to_owned(), Payload {
            kind: PayloadKind::Text,
            message_id: id(9),
            reply_to: Some(payload.message_id),
            no_ack: true,
            body: Bytes::from_static(&[0xff, 0xfe]),
        });

        assert_eq!(receivers.remove(0).await.unwrap(), Err(ClientError::AckTimeout(payload.message_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_pending_deterministically() {
        let (dispatcher, mut frames) = dispatcher();
        dispatcher.spawn_loop().unwrap();

        let mut receivers = dispatcher
            .send_message(vec!["ghost".to_owned()], None, MessageBody::Text("anyone?".to_owned()), None)
            .await.unwrap();
        frames.recv().await.unwrap(); // transmitted, now pending

        dispatcher.stop().unwrap();

        assert_eq!(receivers.remove(0).await.unwrap(), Err(ClientError::NotRunning));
    }
}
