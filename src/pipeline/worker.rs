use crate::{
    common::{Frame, FrameResult},
    config::Configuration,
    error::SourceError,
    intake::{FrameSource, SourceFactory},
    pipeline::{decode::Decoder, executor::TimedDecodeExecutor, segmenter::WorkUnit},
};
use futures::StreamExt;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::{AbortHandle, JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a worker. Transitions only move forward, except that a
/// live worker cycles between `Idle` and `Running` once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Crashed,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl From<&Configuration> for WorkerSettings {
    fn from(configuration: &Configuration) -> Self {
        Self {
            batch_size: configuration.batch_size,
            concurrency: configuration.decode_concurrency,
            timeout: configuration.decode_timeout(),
        }
    }
}

/// What a worker did before it exited on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub unit: Option<WorkUnit>,
    pub frames_emitted: u64,
    pub unreadable: u64,
    pub batches: u64,
    /// The whole segment was walked (file mode) or the inbox was closed
    /// normally (live mode).
    pub completed: bool,
}

/// Owns one decoder instance and pushes every decoded frame onto the shared
/// result channel.
pub struct Worker {
    id: usize,
    decoder: Arc<dyn Decoder>,
    executor: TimedDecodeExecutor,
    batch_size: usize,
    results: mpsc::Sender<FrameResult>,
    state: watch::Sender<WorkerState>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        decoder: Arc<dyn Decoder>,
        settings: WorkerSettings,
        results: mpsc::Sender<FrameResult>,
        cancel: CancellationToken,
    ) -> Self {
        let executor =
            TimedDecodeExecutor::new(Arc::clone(&decoder), settings.concurrency, settings.timeout);
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            id,
            decoder,
            executor,
            batch_size: settings.batch_size.max(1),
            results,
            state,
            cancel,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Walk `unit` in batches. Once the cancellation token fires the worker
    /// stops, dropping whatever part of the current batch is unpublished.
    #[instrument(skip(self, sources), fields(worker = self.id, start = unit.start, end = unit.end))]
    pub async fn run_segment(
        self,
        unit: WorkUnit,
        sources: Arc<dyn SourceFactory>,
    ) -> WorkerReport {
        let mut report = WorkerReport {
            worker: self.id,
            unit: Some(unit),
            ..Default::default()
        };
        self.set_state(WorkerState::Running);

        let mut source = match open_at(sources.as_ref(), unit.start).await {
            Ok(source) => source,
            Err(e) => {
                error!("Worker {} could not open its segment: {}", self.id, e);
                self.finish();
                return report;
            }
        };

        let mut next = unit.start;
        let mut interrupted = false;
        let mut end_of_stream = false;
        while next < unit.end && !end_of_stream {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let batch_start = next;
            let batch_end = (batch_start + self.batch_size as u64).min(unit.end);
            let mut frames = Vec::with_capacity((batch_end - batch_start) as usize);
            for index in batch_start..batch_end {
                let read = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        interrupted = true;
                        break;
                    }
                    read = source.next_frame() => read,
                };
                match read {
                    Ok(Some(frame)) => frames.push(frame.with_index(index)),
                    Ok(None) => {
                        warn!(
                            "Source ended at frame {}, before segment end {}",
                            index, unit.end
                        );
                        end_of_stream = true;
                        break;
                    }
                    Err(e) => {
                        report.unreadable += 1;
                        warn!("Failed to read frame {}, skipping: {}", index, e);
                    }
                }
            }
            if interrupted {
                break;
            }
            next = batch_end;

            if !self.process(frames, &mut report).await {
                interrupted = true;
                break;
            }
            if batch_start.div_ceil(100) * 100 < batch_end {
                info!("Processed frame {}", batch_end - 1);
            }
        }

        report.completed = !interrupted && !end_of_stream && next >= unit.end;
        drop(source);
        self.finish();
        report
    }

    /// Process batches handed over through `inbox`, announcing on `idle`
    /// whenever this worker is ready for the next one.
    #[instrument(skip_all, fields(worker = self.id))]
    pub async fn run_live(
        self,
        mut inbox: mpsc::Receiver<Vec<Frame>>,
        idle: mpsc::Sender<usize>,
    ) -> WorkerReport {
        let mut report = WorkerReport {
            worker: self.id,
            ..Default::default()
        };
        let mut interrupted = false;
        loop {
            self.set_state(WorkerState::Idle);
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                announced = idle.send(self.id) => {
                    if announced.is_err() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            interrupted = true;
                            break;
                        }
                        batch = inbox.recv() => match batch {
                            Some(batch) => batch,
                            None => break,
                        },
                    }
                }
            };

            self.set_state(WorkerState::Running);
            debug!("Worker {} took a batch of {} frames", self.id, batch.len());
            if !self.process(batch, &mut report).await {
                interrupted = true;
                break;
            }
        }

        report.completed = !interrupted;
        self.finish();
        report
    }

    /// Decode `frames` and publish each result as soon as it is ready.
    /// Returns false when cancelled or when the result channel is gone; the
    /// rest of the batch is then dropped.
    async fn process(&self, frames: Vec<Frame>, report: &mut WorkerReport) -> bool {
        let mut results = self.executor.stream_batch(frames);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Worker {} cancelled mid-batch", self.id);
                    return false;
                }
                next = results.next() => next,
            };
            let Some(result) = next else {
                report.batches += 1;
                return true;
            };
            if self.results.send(result).await.is_err() {
                warn!("Worker {} lost its result channel", self.id);
                return false;
            }
            report.frames_emitted += 1;
        }
    }

    fn finish(&self) {
        self.set_state(WorkerState::Draining);
        self.decoder.release();
        self.set_state(WorkerState::Terminated);
    }
}

// A worker dropped before reaching `Terminated` panicked or was aborted.
impl Drop for Worker {
    fn drop(&mut self) {
        if *self.state.borrow() != WorkerState::Terminated {
            self.state.send_replace(WorkerState::Crashed);
        }
    }
}

async fn open_at(
    sources: &dyn SourceFactory,
    start: u64,
) -> Result<Box<dyn FrameSource>, SourceError> {
    let mut source = sources.open()?;
    if let Some(len) = source.frame_count() {
        if start >= len {
            return Err(SourceError::OutOfRange { index: start, len });
        }
    }
    source.seek(start).await?;
    Ok(source)
}

/// How a worker task ended.
#[derive(Debug)]
pub enum WorkerExit {
    Finished(WorkerReport),
    Crashed {
        worker: usize,
        unit: Option<WorkUnit>,
        reason: String,
    },
    Aborted {
        worker: usize,
        unit: Option<WorkUnit>,
    },
}

impl WorkerExit {
    pub fn worker(&self) -> usize {
        match self {
            WorkerExit::Finished(report) => report.worker,
            WorkerExit::Crashed { worker, .. } | WorkerExit::Aborted { worker, .. } => *worker,
        }
    }

    /// The segment this worker did not finish, if any.
    pub fn incomplete_unit(&self) -> Option<WorkUnit> {
        match self {
            WorkerExit::Finished(report) if report.completed => None,
            WorkerExit::Finished(report) => report.unit,
            WorkerExit::Crashed { unit, .. } | WorkerExit::Aborted { unit, .. } => *unit,
        }
    }
}

/// Controller side of a spawned worker task.
pub struct WorkerHandle {
    id: usize,
    unit: Option<WorkUnit>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    pub fn spawn_segment(worker: Worker, unit: WorkUnit, sources: Arc<dyn SourceFactory>) -> Self {
        let id = worker.id();
        let state = worker.subscribe();
        let task = tokio::spawn(worker.run_segment(unit, sources));
        Self {
            id,
            unit: Some(unit),
            state,
            task,
        }
    }

    pub fn spawn_live(
        worker: Worker,
        inbox: mpsc::Receiver<Vec<Frame>>,
        idle: mpsc::Sender<usize>,
    ) -> Self {
        let id = worker.id();
        let state = worker.subscribe();
        let task = tokio::spawn(worker.run_live(inbox, idle));
        Self {
            id,
            unit: None,
            state,
            task,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn unit(&self) -> Option<WorkUnit> {
        self.unit
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Hard-terminate the task without waiting for it to notice.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Wait for the task to end on its own.
    pub async fn join(self) -> WorkerExit {
        let joined = self.task.await;
        classify(self.id, self.unit, joined)
    }

    /// Give the worker `grace` to observe cancellation, then abort it.
    pub async fn shutdown(mut self, grace: Duration) -> WorkerExit {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(joined) => classify(self.id, self.unit, joined),
            Err(_) => {
                warn!(
                    "Worker {} did not stop within {:?}, terminating it",
                    self.id, grace
                );
                self.task.abort();
                let joined = (&mut self.task).await;
                classify(self.id, self.unit, joined)
            }
        }
    }
}

fn classify(
    worker: usize,
    unit: Option<WorkUnit>,
    joined: Result<WorkerReport, JoinError>,
) -> WorkerExit {
    match joined {
        Ok(report) => WorkerExit::Finished(report),
        Err(e) if e.is_panic() => WorkerExit::Crashed {
            worker,
            unit,
            reason: panic_message(e.into_panic()),
        },
        Err(_) => WorkerExit::Aborted { worker, unit },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
