use crate::config::ClientConfig;
use crate::dispatch::{AckReceiver, MessageBody, MessageDispatcher, ReceivedMessage};
use crate::error::ClientError;
use crate::session::{Session, SessionNegotiation};
use crate::transport::{FrameTransport, TransportEvent, WorkerId};
use crate::wire::{InboundEnvelope, MessageId, Payload, PayloadKind, SessionFrame, SessionOp};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

type SessionKey = (String, Bytes);

/// The application boundary of the SDK: one message dispatcher on the primary
///  transport path, a table of byte-stream sessions spread over all paths,
///  and the demultiplexing of inbound frames between them.
///
/// Connection establishment, key management and the session-initiation
///  handshake live outside; their results are handed in through
///  [`Client::establish_session`] and the per-path event pumps.
pub struct Client {
    config: Arc<ClientConfig>,
    dispatcher: Arc<MessageDispatcher>,
    transports: Vec<Arc<dyn FrameTransport>>,
    sessions: Arc<RwLock<FxHashMap<SessionKey, Arc<Session>>>>,
}

impl Client {
    /// `transports` are the connected frame channels, one per worker path;
    ///  the first one carries the dispatcher's discrete messages.
    pub fn new(transports: Vec<Arc<dyn FrameTransport>>, config: ClientConfig) -> anyhow::Result<Client> {
        config.validate()?;
        if transports.is_empty() {
            anyhow::bail!("at least one transport path is required");
        }

        let config = Arc::new(config);
        let dispatcher = Arc::new(MessageDispatcher::new(transports[0].clone(), config.clone()));

        Ok(Client {
            config,
            dispatcher,
            transports,
            sessions: Arc::new(RwLock::new(FxHashMap::default())),
        })
    }

    pub fn start(&self) -> Result<(), ClientError> {
        self.dispatcher.spawn_loop()
    }

    /// Stops the dispatcher and gracefully closes every session.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let sessions = std::mem::take(&mut *self.sessions.write().await);
        for session in sessions.values() {
            session.close().await;
        }
        self.dispatcher.stop()
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Registers the handler for unsolicited inbound messages.
    pub async fn on_message(&self, handler: impl Fn(ReceivedMessage) -> Option<MessageBody> + Send + Sync + 'static) {
        self.dispatcher.on_message(handler).await;
    }

    pub fn set_suppress_auto_acks(&self, suppress: bool) {
        self.dispatcher.set_suppress_auto_acks(suppress);
    }

    pub async fn send_text(&self, destination: &str, text: &str) -> Result<AckReceiver, ClientError> {
        let mut receivers = self.dispatcher
            .send_message(vec![destination.to_owned()], None, MessageBody::Text(text.to_owned()), None)
            .await?;
        Ok(receivers.remove(0))
    }

    pub async fn send_binary(&self, destination: &str, data: Bytes) -> Result<AckReceiver, ClientError> {
        let mut receivers = self.dispatcher
            .send_message(vec![destination.to_owned()], None, MessageBody::Binary(data), None)
            .await?;
        Ok(receivers.remove(0))
    }

    /// Multicast send: one acknowledgment receiver per unique destination.
    pub async fn send_message(
        &self,
        destinations: Vec<String>,
        reply_to: Option<MessageId>,
        body: MessageBody,
    ) -> Result<Vec<AckReceiver>, ClientError> {
        self.dispatcher.send_message(destinations, reply_to, body, None).await
    }

    /// Registers a session whose initiation handshake a collaborator just
    ///  completed, and starts its worker loops. The negotiated parameters are
    ///  bounded by this client's configuration.
    pub async fn establish_session(
        &self,
        remote: &str,
        session_id: Bytes,
        negotiation: SessionNegotiation,
    ) -> Result<Arc<Session>, ClientError> {
        let key = (remote.to_owned(), session_id.clone());
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            return Err(ClientError::AlreadyRunning);
        }

        let session = Session::new(
            remote,
            session_id,
            negotiation,
            Arc::new(self.config.session.clone()),
            &self.transports,
        );
        session.mark_established().await;
        session.spawn_loops();

        sessions.insert(key, session.clone());
        Ok(session)
    }

    pub async fn session(&self, remote: &str, session_id: &Bytes) -> Option<Arc<Session>> {
        self.sessions.read().await
            .get(&(remote.to_owned(), session_id.clone()))
            .cloned()
    }

    /// Spawns a task feeding one transport path's events into the client:
    ///  frames are demultiplexed, connection loss tears the client down. This
    ///  is the notification hook the external connection owner drives.
    pub fn spawn_event_pump(self: &Arc<Client>, worker: WorkerId, mut events: mpsc::Receiver<TransportEvent>) {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Frame(frame) => client.on_inbound_frame(worker, &frame).await,
                    TransportEvent::ConnectionLost => {
                        client.on_connection_lost(worker).await;
                        break;
                    }
                }
            }
        });
    }

    /// Decodes and demultiplexes one inbound frame. Malformed frames are
    ///  logged and discarded; the connection stays alive.
    pub async fn on_inbound_frame(&self, worker: WorkerId, frame: &[u8]) {
        let envelope = match InboundEnvelope::deser(&mut &frame[..]) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("discarding malformed inbound frame: {}", e);
                return;
            }
        };

        let payload = match Payload::deser(&mut &envelope.payload[..]) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("discarding inbound frame from {} with malformed payload: {}", envelope.source, e);
                return;
            }
        };

        match payload.kind {
            PayloadKind::Session => self.route_session_frame(envelope.source, payload.body, worker).await,
            _ => self.dispatcher.on_inbound(envelope.source, payload),
        }
    }

    async fn route_session_frame(&self, source: String, body: Bytes, worker: WorkerId) {
        let frame = match SessionFrame::deser(&mut &body[..]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding malformed session frame from {}: {}", source, e);
                return;
            }
        };

        let session = {
            let sessions = self.sessions.read().await;
            // the source may carry the remote's worker prefix; retry with it stripped
            sessions.get(&(source.clone(), frame.session_id.clone()))
                .or_else(|| {
                    source.split_once('.')
                        .and_then(|(_, unprefixed)| sessions.get(&(unprefixed.to_owned(), frame.session_id.clone())))
                })
                .cloned()
        };

        let Some(session) = session else {
            debug!("session frame from {} for unknown session {:?} - dropping", source, frame.session_id);
            return;
        };

        match frame.op {
            SessionOp::Data { seq, data } => session.on_received_chunk(seq, data, worker).await,
            SessionOp::Ack { start_seq, count } => session.on_received_ack(start_seq, count).await,
            SessionOp::Close => {
                debug!("remote {} closed session {:?}", source, frame.session_id);
                session.close_abrupt().await;
            }
        }
    }

    /// Transport loss tears down every session immediately and stops the
    ///  dispatcher; re-establishment is the connection owner's business.
    pub async fn on_connection_lost(&self, worker: WorkerId) {
        warn!("connection lost on {:?}", worker);

        let sessions = std::mem::take(&mut *self.sessions.write().await);
        for session in sessions.values() {
            session.close_abrupt().await;
        }
        self.dispatcher.stop().ok();
    }
}
