use crate::session::chunk::DataChunk;
use crate::session::rtt::RttTracker;
use crate::session::session::Session;
use crate::transport::{FrameTransport, WorkerId};
use crate::wire::{OutboundEnvelope, Payload, SessionFrame, SessionOp};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, trace};

/// Safety-net wakeup for parked workers, so a worker holding the shared
///  admission queue lock hands it over periodically even without progress
///  notifications.
const IDLE_TICK: Duration = Duration::from_millis(25);

/// One transport path contributing to a session's aggregate throughput. Each
///  worker owns its path's latency estimate, so retransmission timing adapts
///  per path instead of punishing fast paths for a slow sibling.
pub(crate) struct WorkerContext {
    pub id: WorkerId,
    /// remote identifier as addressed over this path (worker prefix applied)
    pub remote_address: String,
    pub transport: Arc<dyn FrameTransport>,
    rtt: RwLock<RttTracker>,
}

impl WorkerContext {
    pub fn new(
        id: WorkerId,
        remote: &str,
        prefix: &str,
        transport: Arc<dyn FrameTransport>,
        rtt: RttTracker,
    ) -> WorkerContext {
        let remote_address = if prefix.is_empty() {
            remote.to_owned()
        }
        else {
            format!("{}.{}", prefix, remote)
        };

        WorkerContext {
            id,
            remote_address,
            transport,
            rtt: RwLock::new(rtt),
        }
    }

    pub async fn record_rtt(&self, rtt: Duration) {
        self.rtt.write().await.add_sample(rtt);
    }

    pub async fn rto(&self) -> Duration {
        self.rtt.read().await.rto()
    }

    #[cfg(test)]
    pub async fn rtt_sample_count(&self) -> usize {
        self.rtt.read().await.sample_count()
    }

    /// Wraps a session frame into a relay envelope addressed over this path
    ///  and hands it to the transport.
    pub async fn send_session_frame(&self, session_id: &Bytes, op: SessionOp) -> anyhow::Result<()> {
        let frame = SessionFrame {
            session_id: session_id.clone(),
            op,
        };
        let mut frame_buf = BytesMut::new();
        frame.ser(&mut frame_buf);

        let payload = Payload::session(frame_buf.freeze());
        let mut payload_buf = BytesMut::new();
        payload.ser(&mut payload_buf);

        let envelope = OutboundEnvelope {
            destinations: vec![self.remote_address.clone()],
            payload: payload_buf.freeze(),
            max_holding_secs: 0,
        };

        self.transport.send_frame(&envelope.ser()).await
    }
}

/// The per-path send loop: retransmissions first (lowest sequence number
///  first, preserving delivery order as far as possible), then fresh chunks
///  as long as the send window has room.
pub(crate) async fn run_worker(session: Arc<Session>, ctx: Arc<WorkerContext>) {
    debug!("starting session worker loop for {:?}", ctx.id);

    loop {
        if session.is_closed().await {
            break;
        }

        if let Some(chunk) = session.pop_resend().await {
            transmit(&session, &ctx, chunk, false).await;
            continue;
        }

        // conservatively assumes a full-MTU chunk; the actual chunk may be the
        //  stream's smaller tail
        if !session.window_has_room().await {
            let ack_progress = session.ack_progress.notified();
            let work_available = session.work_available.notified();
            tokio::select! {
                _ = ack_progress => {}
                _ = work_available => {}
                _ = time::sleep(IDLE_TICK) => {}
            }
            continue;
        }

        let chunk = {
            let mut queue = session.chunk_rx.lock().await;
            tokio::select! {
                maybe_chunk = queue.recv() => match maybe_chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
                _ = session.work_available.notified() => continue,
                _ = time::sleep(IDLE_TICK) => continue,
            }
        };

        transmit(&session, &ctx, chunk, true).await;
    }

    debug!("session worker loop for {:?} terminated", ctx.id);
}

async fn transmit(session: &Session, ctx: &WorkerContext, chunk: DataChunk, fresh: bool) {
    trace!("{:?} sending chunk #{} ({} bytes, fresh: {})", ctx.id, chunk.seq, chunk.data.len(), fresh);

    let op = SessionOp::Data {
        seq: chunk.seq,
        data: chunk.data.clone(),
    };
    if let Err(e) = ctx.send_session_frame(session.session_id(), op).await {
        error!("{:?} failed to send chunk #{}: {}", ctx.id, chunk.seq, e);
        // the chunk stays in the reliability bookkeeping and is retried after the RTO
    }

    session.record_transmission(chunk, ctx.id, fresh).await;
}

/// Periodically moves acknowledgment-overdue in-flight chunks onto the resend
///  queue. Each chunk's age is judged against the retransmission timeout of
///  the worker path that last transmitted it.
pub(crate) async fn run_resend_scan(session: Arc<Session>) {
    let mut ticker = time::interval(session.config().resend_scan_interval);

    loop {
        ticker.tick().await;
        if session.is_closed().await {
            break;
        }

        let newly_scheduled = session.schedule_overdue_resends().await;
        if newly_scheduled > 0 {
            debug!("scheduled {} chunks for retransmission", newly_scheduled);
            session.work_available.notify_waiters();
        }
    }
}

/// Periodically transmits the pending acknowledgment bundles, each as one
///  ack frame through the worker path the chunks arrived on.
pub(crate) async fn run_ack_flush(session: Arc<Session>) {
    let mut ticker = time::interval(session.config().ack_flush_interval);

    loop {
        ticker.tick().await;
        let closed = session.is_closed().await;

        session.flush_pending_acks().await;

        if closed {
            break;
        }
    }
}
