use crate::config::SessionConfig;
use crate::error::ClientError;
use crate::session::chunk::{register_pending_ack, AckBundle, DataChunk, SentLog};
use crate::session::reassembly::ReassemblyBuffer;
use crate::session::rtt::RttTracker;
use crate::session::worker::{run_ack_flush, run_resend_scan, run_worker, WorkerContext};
use crate::transport::{FrameTransport, WorkerId};
use crate::wire::SessionOp;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::cmp::{max, min};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Bounded fallback for the close drain's progress wait.
const DRAIN_RECHECK_TICK: std::time::Duration = std::time::Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Established,
    Closing,
    Closed,
}

/// Parameters produced by the session-initiation handshake, which is owned by
///  an external collaborator. The core only uses them as bounds.
#[derive(Debug, Clone)]
pub struct SessionNegotiation {
    pub mtu: usize,
    pub window_size: usize,
    /// Address prefixes announced by the remote for multi-worker fan-out.
    ///  Empty means single-path with unprefixed addressing.
    pub prefixes: Vec<String>,
}

pub(crate) struct SessionInner {
    state: SessionState,
    /// highest outbound sequence number assigned to a chunk (0 = none yet)
    next_assigned_seq: u64,
    latest_sent_seq: u64,
    latest_confirmed_seq: u64,

    /// unacknowledged transmitted chunks. The resend queue only ever holds
    ///  sequence numbers that are present here; removal is atomic across both.
    in_flight: FxHashMap<u64, (DataChunk, SentLog)>,
    resend_queue: BTreeSet<u64>,

    /// cumulative bytes assigned up to each sequence number, seeded with
    ///  `(0, 0)` and rebased on acknowledgment so the entry at
    ///  `latest_confirmed_seq` reads 0. Outstanding bytes for window
    ///  accounting are `index[latest_sent] - index[latest_confirmed]`.
    sent_bytes_index: BTreeMap<u64, u64>,

    pending_acks: Vec<AckBundle>,
    reassembly: ReassemblyBuffer,

    /// chunks assigned a sequence number but not yet transmitted
    queued_chunks: usize,

    established_callback: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SessionInner {
    fn outstanding_bytes(&self) -> u64 {
        let base = self.sent_bytes_index.get(&self.latest_confirmed_seq).copied().unwrap_or(0);
        let sent = self.sent_bytes_index.get(&self.latest_sent_seq).copied().unwrap_or(base);
        sent - base
    }
}

/// Ordered, flow-controlled byte stream to one remote peer, multiplexed over
///  several worker transport paths. Created once the remote accepted the
///  session-initiation handshake; destroyed on close or transport loss.
pub struct Session {
    config: Arc<SessionConfig>,
    remote: String,
    session_id: Bytes,
    mtu: usize,
    window_size: usize,

    pub(crate) inner: RwLock<SessionInner>,

    chunk_tx: mpsc::Sender<DataChunk>,
    pub(crate) chunk_rx: Mutex<mpsc::Receiver<DataChunk>>,
    /// serializes writers so admission-queue order equals sequence order
    write_gate: Mutex<()>,

    pub(crate) ack_progress: Notify,
    pub(crate) work_available: Notify,

    inbound: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    pub(crate) workers: Vec<Arc<WorkerContext>>,
    loops_spawned: AtomicBool,
}

impl Session {
    pub fn new(
        remote: &str,
        session_id: Bytes,
        negotiation: SessionNegotiation,
        config: Arc<SessionConfig>,
        transports: &[Arc<dyn FrameTransport>],
    ) -> Arc<Session> {
        let mtu = min(config.mtu, negotiation.mtu);
        let window_size = min(config.window_size, negotiation.window_size);

        let worker_count = [
            config.worker_count,
            transports.len(),
            max(negotiation.prefixes.len(), 1),
        ].into_iter().min().expect("worker count bounds are non-empty");

        let workers = (0..worker_count)
            .map(|i| Arc::new(WorkerContext::new(
                WorkerId(i),
                remote,
                negotiation.prefixes.get(i).map(String::as_str).unwrap_or(""),
                transports[i].clone(),
                RttTracker::new(config.initial_rto, config.min_rto, config.max_rto),
            )))
            .collect::<Vec<_>>();

        let admission_capacity = window_size / mtu * worker_count + config.admission_queue_slack;
        let (chunk_tx, chunk_rx) = mpsc::channel(max(admission_capacity, 1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let mut sent_bytes_index = BTreeMap::new();
        sent_bytes_index.insert(0, 0);

        debug!("creating session {:?} with {} (mtu {}, window {}, {} workers)", session_id, remote, mtu, window_size, worker_count);

        Arc::new(Session {
            config,
            remote: remote.to_owned(),
            session_id,
            mtu,
            window_size,
            inner: RwLock::new(SessionInner {
                state: SessionState::Negotiating,
                next_assigned_seq: 0,
                latest_sent_seq: 0,
                latest_confirmed_seq: 0,
                in_flight: FxHashMap::default(),
                resend_queue: BTreeSet::default(),
                sent_bytes_index,
                pending_acks: Vec::new(),
                reassembly: ReassemblyBuffer::new(inbound_tx),
                queued_chunks: 0,
                established_callback: None,
            }),
            chunk_tx,
            chunk_rx: Mutex::new(chunk_rx),
            write_gate: Mutex::new(()),
            ack_progress: Notify::new(),
            work_available: Notify::new(),
            inbound: std::sync::Mutex::new(Some(inbound_rx)),
            workers,
            loops_spawned: AtomicBool::new(false),
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn session_id(&self) -> &Bytes {
        &self.session_id
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.inner.read().await.state == SessionState::Closed
    }

    /// The ordered inbound byte stream. Yields each delivered chunk's bytes in
    ///  sequence order; can be taken exactly once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.lock().expect("inbound receiver lock poisoned").take()
    }

    /// Spawns the per-path worker loops and the session maintenance loops.
    ///  All of them terminate once the session reaches `Closed`.
    pub(crate) fn spawn_loops(self: &Arc<Session>) {
        if self.loops_spawned.swap(true, Ordering::SeqCst) {
            return;
        }

        for ctx in &self.workers {
            tokio::spawn(run_worker(self.clone(), ctx.clone()));
        }
        tokio::spawn(run_resend_scan(self.clone()));
        tokio::spawn(run_ack_flush(self.clone()));
    }

    pub(crate) async fn mark_established(&self) {
        let callback = {
            let mut inner = self.inner.write().await;
            if inner.state != SessionState::Negotiating {
                return;
            }
            inner.state = SessionState::Established;
            inner.established_callback.take()
        };

        debug!("session {:?} with {} established", self.session_id, self.remote);
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Registers a callback invoked exactly once when the session becomes
    ///  established; invoked immediately if it already is.
    pub async fn on_established(&self, callback: impl FnOnce() + Send + Sync + 'static) {
        let invoke_now = {
            let mut inner = self.inner.write().await;
            match inner.state {
                SessionState::Negotiating => {
                    inner.established_callback = Some(Box::new(callback));
                    return;
                }
                SessionState::Established => true,
                SessionState::Closing | SessionState::Closed => false,
            }
        };

        if invoke_now {
            callback();
        }
    }

    /// Splits `data` into MTU-sized chunks with strictly increasing sequence
    ///  numbers and places them on the admission queue, suspending while the
    ///  queue is full. Fails unless the session is established.
    pub async fn write(&self, mut data: Bytes) -> Result<(), ClientError> {
        let _gate = self.write_gate.lock().await;

        while !data.is_empty() {
            let chunk_data = data.split_to(min(self.mtu, data.len()));

            let seq = {
                let mut inner = self.inner.write().await;
                match inner.state {
                    SessionState::Negotiating => return Err(ClientError::SessionNotEstablished),
                    SessionState::Closing | SessionState::Closed => return Err(ClientError::NotRunning),
                    SessionState::Established => {}
                }

                inner.next_assigned_seq += 1;
                let seq = inner.next_assigned_seq;

                let assigned_total = inner.sent_bytes_index.values().next_back().copied().unwrap_or(0);
                inner.sent_bytes_index.insert(seq, assigned_total + chunk_data.len() as u64);
                inner.queued_chunks += 1;
                seq
            };

            trace!("queueing chunk #{} ({} bytes) for {}", seq, chunk_data.len(), self.remote);
            if self.chunk_tx.send(DataChunk { seq, data: chunk_data }).await.is_err() {
                self.inner.write().await.queued_chunks -= 1;
                return Err(ClientError::NotRunning);
            }
        }

        Ok(())
    }

    /// Whether a further full-MTU chunk fits into the negotiated window of
    ///  unacknowledged bytes.
    pub(crate) async fn window_has_room(&self) -> bool {
        let inner = self.inner.read().await;
        inner.outstanding_bytes() + self.mtu as u64 <= self.window_size as u64
    }

    #[cfg(test)]
    pub(crate) async fn outstanding_bytes(&self) -> u64 {
        self.inner.read().await.outstanding_bytes()
    }

    /// Takes the lowest-sequence chunk scheduled for retransmission, if any.
    pub(crate) async fn pop_resend(&self) -> Option<DataChunk> {
        let mut inner = self.inner.write().await;
        let seq = inner.resend_queue.pop_first()?;
        inner.in_flight.get(&seq).map(|(chunk, _)| chunk.clone())
    }

    /// Records that `worker` transmitted `chunk` just now. For a fresh chunk
    ///  this moves it from the admission queue into the in-flight map; for a
    ///  retransmission it restarts the chunk's acknowledgment clock.
    pub(crate) async fn record_transmission(&self, chunk: DataChunk, worker: WorkerId, fresh: bool) {
        let mut inner = self.inner.write().await;

        if fresh {
            inner.latest_sent_seq = max(inner.latest_sent_seq, chunk.seq);
            inner.queued_chunks -= 1;
        }

        let log = SentLog {
            sent_at: Instant::now(),
            worker,
        };
        if fresh {
            inner.in_flight.insert(chunk.seq, (chunk, log));
        }
        else if let Some(entry) = inner.in_flight.get_mut(&chunk.seq) {
            // an ack may have retired the chunk while it was being resent; a
            //  retired chunk must not re-enter the in-flight map
            entry.1 = log;
        }
    }

    /// Moves in-flight chunks whose age exceeds their sending path's RTO onto
    ///  the resend queue. Returns the number of newly scheduled chunks.
    pub(crate) async fn schedule_overdue_resends(&self) -> usize {
        let mut rtos = Vec::with_capacity(self.workers.len());
        for ctx in &self.workers {
            rtos.push(ctx.rto().await);
        }

        let mut inner = self.inner.write().await;
        let SessionInner { in_flight, resend_queue, .. } = &mut *inner;

        let mut newly_scheduled = 0;
        for (&seq, (_, log)) in in_flight.iter() {
            if resend_queue.contains(&seq) {
                continue;
            }
            if log.sent_at.elapsed() >= rtos[log.worker.0] {
                trace!("chunk #{} overdue on {:?} - scheduling resend", seq, log.worker);
                resend_queue.insert(seq);
                newly_scheduled += 1;
            }
        }
        newly_scheduled
    }

    /// Acknowledges the contiguous sequence range `[start_seq, start_seq + count)`.
    ///
    /// Removes the range from the in-flight map and the resend queue, reports
    ///  each removed chunk's round-trip time to the worker path that sent it,
    ///  advances the confirmed sequence number, and trims and rebases the
    ///  cumulative-bytes index that backs send-window accounting. Re-delivered
    ///  ack ranges are a no-op.
    pub(crate) async fn on_received_ack(&self, start_seq: u64, count: u64) {
        if count == 0 {
            return;
        }
        let end = start_seq.saturating_add(count);
        trace!("received ack for chunks [{}, {})", start_seq, end);

        let mut rtt_reports: Vec<(WorkerId, std::time::Duration)> = Vec::new();
        {
            let mut inner = self.inner.write().await;

            if start_seq == inner.latest_confirmed_seq + 1 {
                inner.latest_confirmed_seq = end - 1;
            }

            for seq in start_seq..end {
                if let Some((_, log)) = inner.in_flight.remove(&seq) {
                    inner.resend_queue.remove(&seq);
                    rtt_reports.push((log.worker, log.sent_at.elapsed()));
                }
            }

            inner.latest_confirmed_seq = match inner.in_flight.keys().min() {
                Some(&min_outstanding) => min_outstanding - 1,
                None => inner.latest_sent_seq,
            };

            let confirmed = inner.latest_confirmed_seq;
            let base = inner.sent_bytes_index.get(&confirmed).copied().unwrap_or(0);
            inner.sent_bytes_index.retain(|&seq, _| seq >= confirmed);
            for cumulative in inner.sent_bytes_index.values_mut() {
                *cumulative -= base;
            }
        }

        for (worker, rtt) in rtt_reports {
            self.workers[worker.0].record_rtt(rtt).await;
        }
        self.ack_progress.notify_waiters();
    }

    /// Hands a received chunk to the reassembly buffer and registers it with
    ///  the pending acknowledgment bundles for the path it arrived on.
    pub(crate) async fn on_received_chunk(&self, seq: u64, data: Bytes, from_worker: WorkerId) {
        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Closed {
            debug!("dropping chunk #{} for closed session {:?}", seq, self.session_id);
            return;
        }

        trace!("received chunk #{} ({} bytes) on {:?}", seq, data.len(), from_worker);
        inner.reassembly.on_chunk(seq, data);
        register_pending_ack(&mut inner.pending_acks, from_worker, seq);
    }

    /// Sends every pending acknowledgment bundle as one ack frame over the
    ///  worker path its chunks arrived on.
    pub(crate) async fn flush_pending_acks(&self) {
        let bundles = std::mem::take(&mut self.inner.write().await.pending_acks);

        for bundle in bundles {
            let op = SessionOp::Ack {
                start_seq: bundle.start_seq,
                count: bundle.count,
            };
            // chunks can arrive on more inbound paths than this session has
            //  outbound workers; fall back to the first path for those
            let worker = self.workers.get(bundle.worker.0).unwrap_or(&self.workers[0]);
            if let Err(e) = worker.send_session_frame(&self.session_id, op).await {
                error!("failed to send ack bundle [{}, {}): {}", bundle.start_seq, bundle.start_seq + bundle.count, e);
            }
        }
    }

    /// Graceful close. No-op when already closing or closed; before the
    ///  session is established it jumps straight to `Closed`. Established
    ///  sessions drain: no new writes are admitted, workers keep transmitting
    ///  and retransmitting until everything outstanding is acknowledged or the
    ///  drain timeout elapses, then the remote is notified best-effort.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.write().await;
            match inner.state {
                SessionState::Closing | SessionState::Closed => return,
                SessionState::Negotiating => {
                    inner.state = SessionState::Closed;
                    debug!("closing session {:?} before establishment", self.session_id);
                    self.work_available.notify_waiters();
                    return;
                }
                SessionState::Established => inner.state = SessionState::Closing,
            }
        }

        debug!("draining session {:?} with {}", self.session_id, self.remote);
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            {
                let inner = self.inner.read().await;
                if inner.queued_chunks == 0 && inner.in_flight.is_empty() {
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!("session {:?} drain timed out - abandoning outstanding chunks", self.session_id);
                break;
            }

            let ack_progress = self.ack_progress.notified();
            tokio::select! {
                _ = ack_progress => {}
                // an ack can slip in between the check above and the wait
                //  registering; the bounded re-check keeps the drain live
                _ = time::sleep(DRAIN_RECHECK_TICK) => {}
                _ = time::sleep_until(deadline) => {}
            }
        }

        self.flush_pending_acks().await;
        if let Err(e) = self.workers[0].send_session_frame(&self.session_id, SessionOp::Close).await {
            debug!("failed to notify remote of session close: {}", e);
        }

        self.inner.write().await.state = SessionState::Closed;
        debug!("session {:?} with {} closed", self.session_id, self.remote);
        self.ack_progress.notify_waiters();
        self.work_available.notify_waiters();
    }

    /// Immediate teardown without drain or remote notification, used on
    ///  transport loss and on a close notification from the remote.
    pub(crate) async fn close_abrupt(&self) {
        {
            let mut inner = self.inner.write().await;
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
        }

        debug!("session {:?} with {} closed abruptly", self.session_id, self.remote);
        self.ack_progress.notify_waiters();
        self.work_available.notify_waiters();
    }
}
