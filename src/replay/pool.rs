//! Target-side connection pool
//!
//! Owns one [`ClientSession`] per `(node, connection, channel)` composite
//! key. Each session is stamped with a generation counter and runs a single
//! worker task that executes its scheduled work strictly in scheduled-time
//! order, so all per-connection serialization lives here rather than in
//! nested future chains.
//!
//! Looking a session up with a higher generation does NOT cancel the cached
//! session: eager cancellation on a generation bump races in-flight
//! completions. Supersession is instead resolved along the synthetic-close
//! path (`invalidate_session` + a scheduled close on the old session), which
//! runs only after no one else can be referencing the superseded session.

use crate::capture::ReplayerRequestKey;
use crate::error::{Result, ReverbError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Composite identity of one target-side session.
///
/// The raw connection id is only unique per node; the node id always travels
/// with it so operations on node A's connections can never touch node B's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub node_id: String,
    pub connection_id: String,
    pub channel_index: usize,
}

impl SessionKey {
    pub fn new(
        node_id: impl Into<String>,
        connection_id: impl Into<String>,
        channel_index: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            connection_id: connection_id.into(),
            channel_index,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.node_id, self.connection_id, self.channel_index)
    }
}

/// Abstract target transport: write the packets of one request, finish and
/// collect the raw response bytes, close. The concrete TCP/TLS binding is
/// injected by the embedder.
#[async_trait]
pub trait PacketChannel: Send {
    async fn write_packet(&mut self, data: Bytes) -> Result<()>;

    /// Flush the request and read back the aggregated raw response
    async fn finish(&mut self) -> Result<Bytes>;

    async fn close(&mut self) -> Result<()>;
}

/// Channel-creation capability injected into the pool
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(&self, key: &SessionKey) -> Result<Box<dyn PacketChannel>>;
}

/// Raw response aggregated from one request's send
#[derive(Debug)]
pub struct AggregatedRawResponse {
    pub response: Bytes,
    pub duration: Duration,
}

/// One request's packets scheduled onto a session
pub(crate) struct ScheduledRequest {
    pub key: ReplayerRequestKey,
    pub generation: u32,
    pub start: Instant,
    pub inter_packet_delay: Duration,
    pub packets: Vec<Bytes>,
    pub timeout: Duration,
    pub respond: oneshot::Sender<Result<AggregatedRawResponse>>,
    seq: u64,
}

struct ScheduledClose {
    at: Instant,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct QueueState {
    /// Pending requests sorted by (start, seq); the worker always runs the
    /// front, so requests execute in scheduled order even when the
    /// scheduling calls arrived out of order.
    requests: Vec<ScheduledRequest>,
    close: Option<ScheduledClose>,
    /// Set once the close has executed or the session was cancelled
    shut: bool,
}

struct SessionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    seq: AtomicU64,
}

/// A pooled target-side session: generation stamp plus the ordered work
/// queue its worker task drains.
pub struct ClientSession {
    key: SessionKey,
    generation: u32,
    queue: Arc<SessionQueue>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    fn spawn(key: SessionKey, generation: u32, factory: Arc<dyn ChannelFactory>) -> Arc<Self> {
        let queue = Arc::new(SessionQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            key.clone(),
            generation,
            queue.clone(),
            factory,
            cancel.clone(),
        ));

        Arc::new(Self {
            key,
            generation,
            queue,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Number of requests waiting on this session's queue
    pub fn pending_requests(&self) -> usize {
        self.queue.state.lock().requests.len()
    }

    /// Enqueue one request; it will run when its start time is reached and
    /// all earlier-scheduled work has completed.
    pub(crate) fn enqueue_request(
        &self,
        key: ReplayerRequestKey,
        generation: u32,
        start: Instant,
        inter_packet_delay: Duration,
        packets: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<AggregatedRawResponse>>> {
        let (respond, rx) = oneshot::channel();
        {
            let mut state = self.queue.state.lock();
            if state.shut || state.close.is_some() {
                return Err(ReverbError::SessionClosed);
            }
            let seq = self.queue.seq.fetch_add(1, Ordering::Relaxed);
            let request = ScheduledRequest {
                key,
                generation,
                start,
                inter_packet_delay,
                packets,
                timeout,
                respond,
                seq,
            };
            let pos = state
                .requests
                .partition_point(|r| (r.start, r.seq) <= (start, seq));
            state.requests.insert(pos, request);
        }
        self.queue.notify.notify_one();
        Ok(rx)
    }

    /// Schedule connection teardown at `at`, chained after every pending
    /// request regardless of their start times.
    pub(crate) fn schedule_close(&self, at: Instant) -> Result<oneshot::Receiver<Result<()>>> {
        let (done, rx) = oneshot::channel();
        {
            let mut state = self.queue.state.lock();
            if state.shut || state.close.is_some() {
                return Err(ReverbError::SessionClosed);
            }
            state.close = Some(ScheduledClose { at, done });
        }
        self.queue.notify.notify_one();
        Ok(rx)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn join(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

enum NextAction {
    Run(ScheduledRequest),
    Close(ScheduledClose),
    WaitUntil(Instant),
    WaitForWork,
}

fn pick_next(queue: &SessionQueue, now: Instant) -> NextAction {
    let mut state = queue.state.lock();
    if !state.requests.is_empty() {
        if state.requests[0].start <= now {
            return NextAction::Run(state.requests.remove(0));
        }
        return NextAction::WaitUntil(state.requests[0].start);
    }
    if let Some(close) = state.close.as_ref() {
        if close.at <= now {
            state.shut = true;
            return NextAction::Close(state.close.take().expect("close present"));
        }
        return NextAction::WaitUntil(close.at);
    }
    NextAction::WaitForWork
}

async fn run_worker(
    key: SessionKey,
    generation: u32,
    queue: Arc<SessionQueue>,
    factory: Arc<dyn ChannelFactory>,
    cancel: CancellationToken,
) {
    let mut channel: Option<Box<dyn PacketChannel>> = None;

    loop {
        match pick_next(&queue, Instant::now()) {
            NextAction::Run(request) => {
                if request.generation < generation {
                    trace!(
                        "Rejecting stale work {} (generation {} < session {})",
                        request.key,
                        request.generation,
                        generation
                    );
                    let _ = request.respond.send(Err(ReverbError::SessionSuperseded {
                        work: request.generation,
                        session: generation,
                    }));
                    continue;
                }

                let result = execute_request(&key, &factory, &mut channel, &request).await;
                if result.is_err() {
                    // The transport is suspect after any failure; the next
                    // attempt reconnects.
                    channel = None;
                }
                let _ = request.respond.send(result);
            }
            NextAction::Close(close) => {
                debug!("Closing session {}", key);
                if let Some(mut ch) = channel.take() {
                    if let Err(e) = ch.close().await {
                        warn!("Error closing channel for {}: {}", key, e);
                    }
                }
                let _ = close.done.send(Ok(()));
                break;
            }
            NextAction::WaitUntil(when) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(when) => {}
                    _ = queue.notify.notified() => {}
                    _ = cancel.cancelled() => break,
                }
            }
            NextAction::WaitForWork => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    // Cancellation or close: fail whatever is still queued and tear down.
    let (requests, close) = {
        let mut state = queue.state.lock();
        state.shut = true;
        (std::mem::take(&mut state.requests), state.close.take())
    };
    for request in requests {
        let _ = request.respond.send(Err(ReverbError::Cancelled));
    }
    if let Some(close) = close {
        let _ = close.done.send(Err(ReverbError::Cancelled));
    }
    if let Some(mut ch) = channel.take() {
        let _ = ch.close().await;
    }
}

async fn execute_request(
    key: &SessionKey,
    factory: &Arc<dyn ChannelFactory>,
    channel: &mut Option<Box<dyn PacketChannel>>,
    request: &ScheduledRequest,
) -> Result<AggregatedRawResponse> {
    let started = Instant::now();

    if channel.is_none() {
        trace!("Connecting channel for {}", key);
        *channel = Some(factory.connect(key).await?);
    }
    let ch = channel.as_mut().expect("channel just connected");

    let send = async {
        for (i, packet) in request.packets.iter().enumerate() {
            if i > 0 && !request.inter_packet_delay.is_zero() {
                tokio::time::sleep(request.inter_packet_delay).await;
            }
            ch.write_packet(packet.clone()).await?;
        }
        ch.finish().await
    };

    let response = tokio::time::timeout(request.timeout, send)
        .await
        .map_err(|_| ReverbError::Timeout)??;

    Ok(AggregatedRawResponse {
        response,
        duration: started.elapsed(),
    })
}

/// Pool of target-side sessions keyed by `(node, connection, channel)`
pub struct ClientConnectionPool {
    sessions: DashMap<SessionKey, Arc<ClientSession>>,
    factory: Arc<dyn ChannelFactory>,
    max_sessions: usize,
    shutting_down: AtomicBool,
}

impl ClientConnectionPool {
    pub fn new(factory: Arc<dyn ChannelFactory>, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            max_sessions,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Return the cached session for the key, or create one stamped with
    /// `generation`. A request for a higher generation than the cached
    /// session's returns the cached session unchanged; supersession is the
    /// caller's move via [`invalidate_session`](Self::invalidate_session).
    pub fn get_cached_session(&self, key: &SessionKey, generation: u32) -> Result<Arc<ClientSession>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ReverbError::Shutdown);
        }
        if self.sessions.len() >= self.max_sessions && !self.sessions.contains_key(key) {
            return Err(ReverbError::Internal(format!(
                "Session limit {} reached creating {}",
                self.max_sessions, key
            )));
        }

        let session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Creating session {} at generation {}", key, generation);
                ClientSession::spawn(key.clone(), generation, self.factory.clone())
            })
            .clone();
        Ok(session)
    }

    /// Look up the cached session for the key without creating one
    pub fn peek_session(&self, key: &SessionKey) -> Option<Arc<ClientSession>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Evict the cache entry for exactly this composite key without touching
    /// the session itself. The next `get_cached_session` constructs a fresh
    /// session at whatever generation it is given.
    pub fn invalidate_session(&self, key: &SessionKey) -> Option<Arc<ClientSession>> {
        self.sessions.remove(key).map(|(_, session)| {
            debug!("Invalidated session {}", key);
            session
        })
    }

    /// Evict and gracefully close exactly this composite key's session,
    /// completing once its teardown has finished.
    pub async fn close_connection(&self, key: &SessionKey) -> Result<()> {
        let Some(session) = self.invalidate_session(key) else {
            return Ok(());
        };
        match session.schedule_close(Instant::now()) {
            Ok(done) => {
                let _ = done.await;
            }
            Err(_) => {
                // Already closing; fall through to join
            }
        }
        session.join().await;
        Ok(())
    }

    /// Evict and cancel exactly this composite key's session, failing any
    /// queued work.
    pub fn cancel_connection(&self, key: &SessionKey) -> Option<Arc<ClientSession>> {
        let session = self.invalidate_session(key)?;
        session.cancel();
        Some(session)
    }

    /// Cancel every session and complete only once all teardowns have
    /// finished. The pool refuses new sessions afterwards.
    pub async fn shutdown_now(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let sessions: Vec<Arc<ClientSession>> = {
            let keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
            keys.iter()
                .filter_map(|k| self.sessions.remove(k).map(|(_, s)| s))
                .collect()
        };

        for session in &sessions {
            session.cancel();
        }
        futures::future::join_all(sessions.iter().map(|s| s.join())).await;
        debug!("Connection pool shut down ({} sessions)", sessions.len());
    }
}
