use chrono::{DateTime, Utc};
use presence_core::{
    CoreError, FrameObservation, Identity, IdentityId, Pipeline, SessionEvent, Stats, Store,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("frame queue full; frame dropped")]
    QueueFull,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Snapshot of registry statistics plus engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub stats: Stats,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub failed_ticks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Frame(FrameObservation),
    Sweep {
        reply: oneshot::Sender<Result<Vec<SessionEvent>, EngineError>>,
    },
    Depart {
        identity_id: IdentityId,
        reply: oneshot::Sender<Result<SessionEvent, EngineError>>,
    },
    Label {
        identity_id: IdentityId,
        name: Option<String>,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    counters: Arc<Counters>,
}

impl EngineHandle {
    /// Offer a frame without waiting. A full queue drops this frame.
    pub fn try_submit(&self, frame: FrameObservation) -> Result<(), EngineError> {
        match self.tx.try_send(EngineRequest::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "engine queue full, dropping newest frame");
                Err(EngineError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::ChannelClosed),
        }
    }

    /// Submit a frame, waiting for queue space.
    pub async fn submit(&self, frame: FrameObservation) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::Frame(frame))
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Close sessions past the exit timeout and wait until they are committed.
    pub async fn sweep(&self) -> Result<Vec<SessionEvent>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Sweep { reply }, rx).await
    }

    /// Explicit check-out.
    pub async fn depart(&self, identity_id: IdentityId) -> Result<SessionEvent, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Depart { identity_id, reply }, rx)
            .await
    }

    pub async fn label(
        &self,
        identity_id: IdentityId,
        name: Option<String>,
    ) -> Result<Identity, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            EngineRequest::Label {
                identity_id,
                name,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Status { reply }, rx).await
    }

    async fn request<T>(
        &self,
        req: EngineRequest,
        rx: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        self.tx
            .send(req)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Time source for sweeps.
///
/// Follows frame timestamps: the current time is the latest frame's
/// timestamp plus the wall time elapsed since that frame arrived. With
/// live frames this tracks the wall clock; with replayed frames it tracks
/// the recording.
struct EngineClock {
    anchor: Option<(DateTime<Utc>, Instant)>,
}

impl EngineClock {
    fn new() -> Self {
        Self { anchor: None }
    }

    /// Time for a frame: its own timestamp, or the clock's current reading.
    fn stamp(&mut self, frame: &FrameObservation) -> DateTime<Utc> {
        let at = frame.timestamp.unwrap_or_else(|| self.now());
        self.anchor = Some((at, Instant::now()));
        at
    }

    fn now(&self) -> DateTime<Utc> {
        match self.anchor {
            Some((at, received)) => {
                let elapsed = chrono::Duration::from_std(received.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                at + elapsed
            }
            None => Utc::now(),
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The pipeline is moved onto the thread and is only ever touched there, so
/// every mutation is serialized. `capacity` bounds the request queue.
pub fn spawn_engine<S>(
    pipeline: Pipeline<S>,
    capacity: usize,
) -> Result<EngineHandle, EngineError>
where
    S: Store + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(capacity);
    let counters = Arc::new(Counters::default());
    let thread_counters = Arc::clone(&counters);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut engine = Engine {
                pipeline,
                clock: EngineClock::new(),
                counters: thread_counters,
                retry: None,
            };
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, counters })
}

struct Engine<S: Store> {
    pipeline: Pipeline<S>,
    clock: EngineClock,
    counters: Arc<Counters>,
    /// Frame whose tick failed on storage, retried once before the next request.
    retry: Option<(FrameObservation, DateTime<Utc>)>,
}

impl<S: Store> Engine<S> {
    fn handle(&mut self, req: EngineRequest) {
        if let Some((frame, now)) = self.retry.take() {
            tracing::info!(%now, "retrying failed frame");
            self.tick(&frame, now, false);
        }

        match req {
            EngineRequest::Frame(frame) => {
                let now = self.clock.stamp(&frame);
                self.tick(&frame, now, true);
            }
            EngineRequest::Sweep { reply } => {
                let result = self.pipeline.sweep(self.clock.now()).map_err(EngineError::from);
                if let Err(e) = &result {
                    tracing::error!(error = %e, "sweep failed");
                }
                let _ = reply.send(result);
            }
            EngineRequest::Depart { identity_id, reply } => {
                let result = self
                    .pipeline
                    .depart(identity_id, self.clock.now())
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Label {
                identity_id,
                name,
                reply,
            } => {
                let result = self
                    .pipeline
                    .label(identity_id, name)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Status { reply } => {
                let result = self
                    .pipeline
                    .stats()
                    .map(|stats| EngineStatus {
                        stats,
                        frames_processed: self.counters.processed.load(Ordering::Relaxed),
                        frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
                        failed_ticks: self.counters.failed.load(Ordering::Relaxed),
                    })
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
        }
    }

    /// Run one frame tick. Errors are logged, never propagated.
    fn tick(&mut self, frame: &FrameObservation, now: DateTime<Utc>, may_retry: bool) {
        match self.pipeline.process_frame(frame, now) {
            Ok(report) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    %now,
                    faces = report.resolutions.len(),
                    events = report.events.len(),
                    rejected = report.rejected,
                    "frame processed"
                );
            }
            Err(e) if e.is_storage() && may_retry => {
                tracing::warn!(error = %e, "tick failed on storage; will retry frame");
                self.retry = Some((frame.clone(), now));
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %e,
                    detections = frame.detections.len(),
                    "tick failed; frame dropped"
                );
            }
        }
    }
}
