use crate::{
    common::{Frame, FrameResult},
    config::Configuration,
    error::{PipelineError, SourceError},
    export::ResultSink,
    intake::{
        spawn_frame_reader, BoundedFrameBuffer, FrameRange, FrameSource, PopError, ReaderReport,
        SourceFactory,
    },
    pipeline::{
        aggregator::{DetectionIndex, FirstSeenPolicy, LocationMap, ResultAggregator},
        decode::{Decoder, DecoderFactory},
        progress::{LogProgressSink, Phase, ProgressSink, ProgressSnapshot},
        segmenter::{next_batch, segment, WorkUnit},
        worker::{Worker, WorkerExit, WorkerHandle, WorkerSettings},
    },
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Why the controller loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Every selected frame was processed, or every segment ran to its end.
    Completed,
    /// All workers exited and the result channel drained, with work left.
    WorkersExited,
    /// The stop signal fired.
    Interrupted,
    /// No result arrived within the stall timeout.
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Processing,
    Draining,
    Finalizing,
    Finished(Termination),
}

impl From<ControllerState> for Phase {
    fn from(state: ControllerState) -> Self {
        match state {
            ControllerState::Initializing => Phase::Initializing,
            ControllerState::Processing => Phase::Processing,
            ControllerState::Draining => Phase::Draining,
            ControllerState::Finalizing => Phase::Finalizing,
            ControllerState::Finished(Termination::Completed | Termination::WorkersExited) => {
                Phase::Completed
            }
            ControllerState::Finished(Termination::Interrupted) => Phase::Interrupted,
            ControllerState::Finished(Termination::Stalled) => Phase::Stalled,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Frames selected for the run; unknown for live sources.
    pub frames_total: Option<u64>,
    pub frames_processed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub unreadable: u64,
    /// Frames the live reader took from the source.
    pub frames_read: u64,
    /// Frames evicted from the live buffer before any worker saw them.
    pub dropped: u64,
    pub worker_crashes: u64,
    pub worker_replacements: u64,
    /// File segments whose worker stopped before reaching the segment end.
    pub incomplete_segments: Vec<WorkUnit>,
    pub elapsed: Duration,
}

/// Everything a run accumulated. Returned on every termination path.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub termination: Termination,
    pub detection_index: DetectionIndex,
    pub location_map: LocationMap,
    pub summary: RunSummary,
}

/// Caller side of the stop signal.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the run on the first Ctrl-C.
    pub fn stop_on_ctrl_c(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        info!("Interrupt received, stopping run");
                        token.cancel();
                    }
                    Err(e) => warn!("Failed to listen for interrupt: {}", e),
                },
            }
        })
    }
}

/// Owns worker lifecycles and the aggregation loop for one source.
pub struct Coordinator {
    configuration: Configuration,
    decoders: Arc<dyn DecoderFactory>,
    progress: Arc<dyn ProgressSink>,
    results: Option<Arc<dyn ResultSink>>,
    cancel: CancellationToken,
    #[cfg(test)]
    live_workers: std::sync::Mutex<Vec<tokio::task::AbortHandle>>,
}

impl Coordinator {
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.cancel.clone(),
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Process a finite, seekable source split into one segment per worker.
    pub async fn run_file(
        &self,
        sources: Arc<dyn SourceFactory>,
    ) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        self.drive_file(run_id, sources)
            .instrument(info_span!("run", %run_id, mode = "file"))
            .await
    }

    /// Process an unbounded source through the drop-oldest frame buffer.
    pub async fn run_live(
        &self,
        source: Box<dyn FrameSource>,
    ) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        self.drive_live(run_id, source)
            .instrument(info_span!("run", %run_id, mode = "live"))
            .await
    }

    async fn drive_file(
        &self,
        run_id: Uuid,
        sources: Arc<dyn SourceFactory>,
    ) -> Result<RunOutcome, PipelineError> {
        let cfg = &self.configuration;
        let mut run = RunContext::new(run_id, cfg.first_seen);

        let probe = sources.open()?;
        let total = probe.frame_count().ok_or(SourceError::UnknownLength)?;
        let range = self.resolve_range(total, probe.fps())?;
        drop(probe);

        let units = segment(range, cfg.workers);
        let decoders = self.create_decoders(units.len())?;
        run.frames_total = Some(range.len());
        info!(
            "Processing frames {}..{} of {} with {} workers",
            range.start,
            range.end,
            total,
            units.len()
        );
        run.emit(self.progress.as_ref());

        let (result_tx, mut result_rx) = mpsc::channel(cfg.result_buffer);
        let cancel = self.cancel.child_token();
        let settings = WorkerSettings::from(cfg);
        let mut workers: Vec<WorkerHandle> = units
            .iter()
            .zip(decoders)
            .enumerate()
            .map(|(id, (unit, decoder))| {
                let worker = Worker::new(id, decoder, settings, result_tx.clone(), cancel.child_token());
                WorkerHandle::spawn_segment(worker, *unit, Arc::clone(&sources))
            })
            .collect();
        // Workers hold the only senders: the channel closes once they all exit.
        drop(result_tx);

        run.state = ControllerState::Processing;
        let mut progress = ticker(cfg.progress_interval());
        let mut liveness = ticker(cfg.liveness_interval());
        let mut last_result = Instant::now();
        let frames_total = range.len();

        let termination = loop {
            if run.aggregator.frames_processed() >= frames_total {
                break Termination::Completed;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Stop requested, finalizing");
                    break Termination::Interrupted;
                }
                received = result_rx.recv() => match received {
                    Some(result) => {
                        run.ingest_available(result, &mut result_rx);
                        last_result = Instant::now();
                    }
                    None => break Termination::WorkersExited,
                },
                _ = progress.tick() => run.report(self.progress.as_ref(), self.results.as_ref()),
                _ = liveness.tick() => {
                    reap_finished(&mut workers, &mut run).await;
                    if let Some(stall) = cfg.stall_timeout() {
                        if last_result.elapsed() >= stall {
                            warn!("No frame result for {:?}, giving up on remaining work", stall);
                            break Termination::Stalled;
                        }
                    }
                }
            }
        };

        run.state = ControllerState::Draining;
        cancel.cancel();
        let exits = shutdown_draining(workers, cfg.shutdown_grace(), &mut result_rx, &mut run).await;
        for exit in exits {
            run.record_exit(exit);
        }
        run.state = ControllerState::Finalizing;

        let termination = match termination {
            Termination::WorkersExited if run.summary.incomplete_segments.is_empty() => {
                Termination::Completed
            }
            other => other,
        };
        Ok(self.finalize(run, termination).await)
    }

    async fn drive_live(
        &self,
        run_id: Uuid,
        source: Box<dyn FrameSource>,
    ) -> Result<RunOutcome, PipelineError> {
        let cfg = &self.configuration;
        let mut run = RunContext::new(run_id, cfg.first_seen);
        let decoders = self.create_decoders(cfg.workers)?;
        run.emit(self.progress.as_ref());

        let cancel = self.cancel.child_token();
        let buffer = Arc::new(BoundedFrameBuffer::new(cfg.frame_buffer_capacity));
        let mut reader = spawn_frame_reader(
            source,
            Arc::clone(&buffer),
            cfg.reconnect_backoff(),
            cancel.child_token(),
        );
        let mut reader_done = false;

        let (result_tx, mut result_rx) = mpsc::channel(cfg.result_buffer);
        let mut pool = LivePool::new(
            WorkerSettings::from(cfg),
            Arc::clone(&self.decoders),
            result_tx,
            cancel.clone(),
            cfg.workers,
        );
        for decoder in decoders {
            pool.spawn(decoder);
        }
        #[cfg(test)]
        self.track_live_workers(&pool);
        info!("Live run started with {} workers", pool.len());

        run.state = ControllerState::Processing;
        let mut progress = ticker(cfg.progress_interval());
        let mut liveness = ticker(cfg.liveness_interval());
        let mut pending: Option<Vec<Frame>> = None;
        let mut source_open = true;

        let termination = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Stop requested, finalizing");
                    break Termination::Interrupted;
                }
                received = result_rx.recv() => match received {
                    Some(result) => run.ingest_available(result, &mut result_rx),
                    None => break Termination::WorkersExited,
                },
                _ = progress.tick() => run.report(self.progress.as_ref(), self.results.as_ref()),
                joined = &mut reader, if !reader_done => {
                    reader_done = true;
                    run.record_reader(joined);
                    // Lets the buffer drain and report Closed even when the
                    // reader died before closing it.
                    buffer.close();
                }
                Some(id) = pool.idle.recv(), if pending.is_some() => {
                    if let Some(batch) = pending.take() {
                        pending = pool.assign(id, batch, &mut run).await.err();
                    }
                }
                drawn = next_batch(&buffer, cfg.batch_size, cfg.frame_wait()), if pending.is_none() && source_open => {
                    match drawn {
                        Ok(batch) => pending = Some(batch),
                        Err(PopError::Empty) => debug!("No frame within {:?}", cfg.frame_wait()),
                        Err(PopError::Closed) => {
                            info!("Live source ended, letting workers finish");
                            source_open = false;
                            pool.close();
                        }
                    }
                }
                _ = liveness.tick() => {
                    pool.replace_dead(&mut run).await;
                    if pool.is_empty() && source_open {
                        error!("No live worker left and none could be started");
                        break Termination::WorkersExited;
                    }
                }
            }
        };

        run.state = ControllerState::Draining;
        cancel.cancel();
        pool.close();
        let grace = cfg.shutdown_grace();
        if !reader_done {
            match tokio::time::timeout(grace, &mut reader).await {
                Ok(joined) => run.record_reader(joined),
                Err(_) => {
                    warn!("Frame reader did not stop within {:?}, terminating it", grace);
                    reader.abort();
                }
            }
        }
        let workers = pool.into_handles();
        let exits = shutdown_draining(workers, grace, &mut result_rx, &mut run).await;
        for exit in exits {
            run.record_exit(exit);
        }
        run.state = ControllerState::Finalizing;
        run.summary.dropped = buffer.dropped();
        if let Some(batch) = pending {
            debug!("Discarding undispatched batch of {} frames", batch.len());
        }

        Ok(self.finalize(run, termination).await)
    }

    fn resolve_range(&self, total: u64, fps: Option<f64>) -> Result<FrameRange, PipelineError> {
        match self.configuration.time_window() {
            Some((start, end)) => {
                let fps = fps.ok_or_else(|| {
                    PipelineError::InvalidConfig(
                        "a time window needs a source that reports its frame rate".to_string(),
                    )
                })?;
                FrameRange::from_time_window(start, end, fps, total)
            }
            None => FrameRange::from_fraction(total, self.configuration.fraction),
        }
    }

    // All decoders are acquired before any work starts; one failure aborts
    // the run.
    fn create_decoders(&self, count: usize) -> Result<Vec<Arc<dyn Decoder>>, PipelineError> {
        let mut decoders = Vec::with_capacity(count);
        for _ in 0..count {
            match self.decoders.create() {
                Ok(decoder) => decoders.push(decoder),
                Err(e) => {
                    error!("Failed to acquire decoder: {}", e);
                    for decoder in &decoders {
                        decoder.release();
                    }
                    return Err(PipelineError::Initialization(e));
                }
            }
        }
        Ok(decoders)
    }

    async fn finalize(&self, mut run: RunContext, termination: Termination) -> RunOutcome {
        run.state = ControllerState::Finished(termination);
        run.emit(self.progress.as_ref());
        if let Some(checkpoint) = run.checkpoint.take() {
            if let Err(e) = checkpoint.await {
                error!("Checkpoint task failed: {}", e);
            }
        }
        let outcome = run.finish(termination);

        if let Some(sink) = &self.results {
            let sink = Arc::clone(sink);
            let index = outcome.detection_index.clone();
            let locations = outcome.location_map.clone();
            match tokio::task::spawn_blocking(move || sink.finalize(&index, &locations)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Failed to persist final results: {}", e),
                Err(e) => error!("Final export task failed: {}", e),
            }
        }
        info!(
            "Run finished ({:?}): {} frames, {} unique labels, {} timed out, {} incomplete segments",
            termination,
            outcome.summary.frames_processed,
            outcome.detection_index.len(),
            outcome.summary.timed_out,
            outcome.summary.incomplete_segments.len()
        );
        outcome
    }
}

#[cfg(test)]
impl Coordinator {
    fn track_live_workers(&self, pool: &LivePool) {
        if let Ok(mut tracked) = self.live_workers.lock() {
            tracked.extend(pool.slots.values().map(|slot| slot.handle.abort_handle()));
        }
    }

    /// Abort the first worker of the current live run, as a crash would.
    fn kill_live_worker(&self) -> bool {
        self.live_workers
            .lock()
            .ok()
            .and_then(|tracked| tracked.first().map(|handle| handle.abort()))
            .is_some()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn reap_finished(workers: &mut Vec<WorkerHandle>, run: &mut RunContext) {
    let mut i = 0;
    while i < workers.len() {
        if workers[i].is_finished() {
            let exit = workers.swap_remove(i).join().await;
            run.record_exit(exit);
        } else {
            i += 1;
        }
    }
}

// Results keep flowing while workers shut down, so none of them can block on
// a full channel past its grace period.
async fn shutdown_draining(
    workers: Vec<WorkerHandle>,
    grace: Duration,
    result_rx: &mut mpsc::Receiver<FrameResult>,
    run: &mut RunContext,
) -> Vec<WorkerExit> {
    let shutdown = futures::future::join_all(workers.into_iter().map(|w| w.shutdown(grace)));
    tokio::pin!(shutdown);
    let exits = loop {
        tokio::select! {
            exits = &mut shutdown => break exits,
            Some(result) = result_rx.recv() => run.aggregator.ingest(result),
        }
    };
    while let Ok(result) = result_rx.try_recv() {
        run.aggregator.ingest(result);
    }
    exits
}

/// Controller-owned state of one run.
struct RunContext {
    run_id: Uuid,
    started: Instant,
    state: ControllerState,
    aggregator: ResultAggregator,
    frames_total: Option<u64>,
    summary: RunSummary,
    checkpoint: Option<JoinHandle<()>>,
}

impl RunContext {
    fn new(run_id: Uuid, policy: FirstSeenPolicy) -> Self {
        Self {
            run_id,
            started: Instant::now(),
            state: ControllerState::Initializing,
            aggregator: ResultAggregator::new(policy),
            frames_total: None,
            summary: RunSummary::default(),
            checkpoint: None,
        }
    }

    // Drain what is already queued without waiting for more.
    fn ingest_available(&mut self, first: FrameResult, rx: &mut mpsc::Receiver<FrameResult>) {
        self.aggregator.ingest(first);
        while let Ok(result) = rx.try_recv() {
            self.aggregator.ingest(result);
        }
    }

    fn snapshot(&mut self) -> ProgressSnapshot {
        let interval = self.aggregator.take_interval();
        ProgressSnapshot::compute(
            self.state.into(),
            &self.aggregator.stats(),
            interval,
            self.frames_total,
            self.started.elapsed(),
        )
    }

    fn emit(&mut self, progress: &dyn ProgressSink) {
        let snapshot = self.snapshot();
        progress.emit(&snapshot);
    }

    // Checkpoints run on the blocking pool; a tick that finds the previous
    // one still writing skips its own.
    fn report(&mut self, progress: &dyn ProgressSink, results: Option<&Arc<dyn ResultSink>>) {
        self.emit(progress);
        let Some(sink) = results else {
            return;
        };
        if self.checkpoint.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Previous checkpoint still being written, skipping");
            return;
        }
        let sink = Arc::clone(sink);
        let index = self.aggregator.detection_index().clone();
        let locations = self.aggregator.location_map().clone();
        self.checkpoint = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = sink.checkpoint(&index, &locations) {
                warn!("Failed to write checkpoint: {}", e);
            }
        }));
    }

    fn record_reader(&mut self, joined: Result<ReaderReport, JoinError>) {
        match joined {
            Ok(report) => {
                debug!("Frame reader finished after {} frames", report.frames_read);
                self.summary.frames_read = report.frames_read;
                self.summary.unreadable += report.read_failures;
            }
            Err(e) => error!("Frame reader stopped unexpectedly: {}", e),
        }
    }

    fn record_exit(&mut self, exit: WorkerExit) {
        let incomplete = exit.incomplete_unit();
        match exit {
            WorkerExit::Finished(report) => {
                self.summary.unreadable += report.unreadable;
                if let Some(unit) = incomplete {
                    warn!(
                        "Worker {} stopped before finishing frames {}..{}",
                        report.worker, unit.start, unit.end
                    );
                }
            }
            WorkerExit::Crashed { worker, reason, .. } => {
                self.summary.worker_crashes += 1;
                match incomplete {
                    Some(unit) => error!(
                        "Worker {} crashed ({}), frames {}..{} are incomplete",
                        worker, reason, unit.start, unit.end
                    ),
                    None => error!("Worker {} crashed: {}", worker, reason),
                }
            }
            WorkerExit::Aborted { worker, .. } => {
                warn!("Worker {} was terminated", worker);
            }
        }
        if let Some(unit) = incomplete {
            self.summary.incomplete_segments.push(unit);
        }
    }

    fn finish(self, termination: Termination) -> RunOutcome {
        let stats = self.aggregator.stats();
        let mut summary = self.summary;
        summary.frames_total = self.frames_total;
        summary.frames_processed = stats.frames_processed;
        summary.timed_out = stats.timed_out;
        summary.failed = stats.failed;
        summary.elapsed = self.started.elapsed();
        summary.incomplete_segments.sort_by_key(|unit| unit.start);
        let (detection_index, location_map) = self.aggregator.finish();
        RunOutcome {
            run_id: self.run_id,
            termination,
            detection_index,
            location_map,
            summary,
        }
    }
}

struct LiveSlot {
    handle: WorkerHandle,
    inbox: Option<mpsc::Sender<Vec<Frame>>>,
}

/// Fixed-size pool of live workers. Each worker announces on `idle` when
/// it can take a batch; worker ids are never reused, so an announcement
/// from a replaced worker cannot reach its successor.
struct LivePool {
    settings: WorkerSettings,
    decoders: Arc<dyn DecoderFactory>,
    results: Option<mpsc::Sender<FrameResult>>,
    cancel: CancellationToken,
    size: usize,
    next_id: usize,
    slots: BTreeMap<usize, LiveSlot>,
    idle_tx: mpsc::Sender<usize>,
    idle: mpsc::Receiver<usize>,
}

impl LivePool {
    fn new(
        settings: WorkerSettings,
        decoders: Arc<dyn DecoderFactory>,
        results: mpsc::Sender<FrameResult>,
        cancel: CancellationToken,
        size: usize,
    ) -> Self {
        let (idle_tx, idle) = mpsc::channel(size.max(1) * 2);
        Self {
            settings,
            decoders,
            results: Some(results),
            cancel,
            size: size.max(1),
            next_id: 0,
            slots: BTreeMap::new(),
            idle_tx,
            idle,
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn spawn(&mut self, decoder: Arc<dyn Decoder>) -> bool {
        let Some(results) = &self.results else {
            return false;
        };
        let id = self.next_id;
        self.next_id += 1;
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let worker = Worker::new(id, decoder, self.settings, results.clone(), self.cancel.child_token());
        let handle = WorkerHandle::spawn_live(worker, inbox_rx, self.idle_tx.clone());
        self.slots.insert(
            id,
            LiveSlot {
                handle,
                inbox: Some(inbox_tx),
            },
        );
        true
    }

    /// Hand `batch` to worker `id`. The batch comes back when that worker
    /// is gone or cannot take it.
    fn dispatch(&mut self, id: usize, batch: Vec<Frame>) -> Result<(), Vec<Frame>> {
        let Some(inbox) = self.slots.get(&id).and_then(|slot| slot.inbox.as_ref()) else {
            debug!("Ignoring idle announcement from retired worker {}", id);
            return Err(batch);
        };
        inbox.try_send(batch).map_err(|e| e.into_inner())
    }

    /// Replace any dead worker, then hand `batch` to worker `id`.
    async fn assign(
        &mut self,
        id: usize,
        batch: Vec<Frame>,
        run: &mut RunContext,
    ) -> Result<(), Vec<Frame>> {
        self.replace_dead(run).await;
        self.dispatch(id, batch)
    }

    async fn replace_dead(&mut self, run: &mut RunContext) {
        let dead: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(slot) = self.slots.remove(&id) {
                run.record_exit(slot.handle.join().await);
            }
        }

        if self.results.is_none() || self.cancel.is_cancelled() {
            return;
        }
        while self.slots.len() < self.size {
            match self.decoders.create() {
                Ok(decoder) => {
                    if !self.spawn(decoder) {
                        return;
                    }
                    run.summary.worker_replacements += 1;
                    info!("Started replacement worker {}", self.next_id - 1);
                }
                Err(e) => {
                    error!("Failed to acquire decoder for a replacement worker: {}", e);
                    return;
                }
            }
        }
    }

    /// Stop handing out work: inboxes close once drained and no new worker
    /// gets a result sender.
    fn close(&mut self) {
        self.results = None;
        for slot in self.slots.values_mut() {
            slot.inbox = None;
        }
    }

    fn into_handles(self) -> Vec<WorkerHandle> {
        self.slots.into_values().map(|slot| slot.handle).collect()
    }
}

pub struct CoordinatorBuilder {
    configuration: Configuration,
    decoders: Option<Arc<dyn DecoderFactory>>,
    progress: Option<Arc<dyn ProgressSink>>,
    results: Option<Arc<dyn ResultSink>>,
}

impl CoordinatorBuilder {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            decoders: None,
            progress: None,
            results: None,
        }
    }

    // Sets the worker count, this will override the configuration.
    pub fn workers(mut self, workers: usize) -> Self {
        self.configuration.workers = workers;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.configuration.batch_size = batch_size;
        self
    }

    pub fn decode_concurrency(mut self, concurrency: usize) -> Self {
        self.configuration.decode_concurrency = concurrency;
        self
    }

    // Per-frame decode timeout.
    pub fn decode_timeout(mut self, timeout: Duration) -> Self {
        self.configuration.decode_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.configuration.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.configuration.liveness_interval_ms = interval.as_millis() as u64;
        self
    }

    // `None` disables stall detection.
    pub fn stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.configuration.stall_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.configuration.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn frame_buffer_capacity(mut self, capacity: usize) -> Self {
        self.configuration.frame_buffer_capacity = capacity;
        self
    }

    pub fn frame_wait(mut self, wait: Duration) -> Self {
        self.configuration.frame_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn fraction(mut self, fraction: f64) -> Self {
        self.configuration.fraction = fraction;
        self
    }

    // Restricts a file run to `[start_secs, end_secs)`, this takes precedence
    // over the fraction.
    pub fn time_window(mut self, start_secs: f64, end_secs: f64) -> Self {
        self.configuration.start_secs = Some(start_secs);
        self.configuration.end_secs = Some(end_secs);
        self
    }

    pub fn first_seen(mut self, policy: FirstSeenPolicy) -> Self {
        self.configuration.first_seen = policy;
        self
    }

    pub fn decoder_factory(mut self, factory: impl DecoderFactory) -> Self {
        self.decoders = Some(Arc::new(factory));
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.results = Some(sink);
        self
    }

    pub fn build(self) -> Result<Coordinator, PipelineError> {
        self.configuration.validate()?;
        let decoders = self
            .decoders
            .ok_or_else(|| PipelineError::InvalidConfig("decoder factory not set".to_string()))?;
        Ok(Coordinator {
            configuration: self.configuration,
            decoders,
            progress: self
                .progress
                .unwrap_or_else(|| Arc::new(LogProgressSink) as Arc<dyn ProgressSink>),
            results: self.results,
            cancel: CancellationToken::new(),
            #[cfg(test)]
            live_workers: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::testing::{synthetic_sources, RecordingSink, ScriptedDecoder, SyntheticSource};

    fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new(Configuration::default())
            .workers(4)
            .batch_size(5)
            .decode_concurrency(5)
            .decode_timeout(Duration::from_secs(5))
            .progress_interval(Duration::from_secs(60))
            .liveness_interval(Duration::from_millis(20))
            .shutdown_grace(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn file_run_finds_each_label_once() {
        let (decoder, factory) = ScriptedDecoder::new()
            .with_label(10, "A")
            .with_label(50, "B")
            .into_factory();
        let sink = Arc::new(RecordingSink::default());
        let coordinator = builder()
            .decoder_factory(factory)
            .result_sink(sink.clone())
            .build()
            .unwrap();

        let outcome = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(100)))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.detection_index.len(), 2);
        assert_eq!(outcome.detection_index.get("A"), Some(&10));
        assert_eq!(outcome.detection_index.get("B"), Some(&50));
        assert_eq!(outcome.location_map.keys().copied().collect::<Vec<_>>(), vec![10, 50]);
        assert_eq!(outcome.summary.frames_processed, 100);
        assert_eq!(outcome.summary.frames_total, Some(100));
        assert!(outcome.summary.incomplete_segments.is_empty());
        assert_eq!(outcome.summary.worker_crashes, 0);
        assert_eq!(decoder.calls(), 100);

        let (index, locations) = sink.finalized().unwrap();
        assert_eq!(index, outcome.detection_index);
        assert_eq!(locations, outcome.location_map);
    }

    #[tokio::test]
    async fn hung_frame_times_out_and_run_completes() {
        let (_, factory) = ScriptedDecoder::new()
            .with_label(10, "A")
            .with_label(50, "B")
            .with_hang(42, Duration::from_millis(600))
            .into_factory();
        let coordinator = builder()
            .decode_timeout(Duration::from_millis(100))
            .decoder_factory(factory)
            .build()
            .unwrap();

        let outcome = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(100)))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.summary.frames_processed, 100);
        assert_eq!(outcome.summary.timed_out, 1);
        assert!(!outcome.location_map.contains_key(&42));
        assert_eq!(outcome.detection_index.len(), 2);
    }

    #[tokio::test]
    async fn stop_keeps_partial_results() {
        let (_, factory) = ScriptedDecoder::new()
            .with_label(0, "first")
            .with_default_delay(Duration::from_millis(15))
            .into_factory();
        let sink = Arc::new(RecordingSink::default());
        let coordinator = builder()
            .workers(2)
            .decoder_factory(factory)
            .result_sink(sink.clone())
            .build()
            .unwrap();
        let stop = coordinator.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            stop.stop();
        });

        let outcome = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(400)))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Interrupted);
        assert!(coordinator.stop_handle().is_stopped());
        assert!(outcome.summary.frames_processed > 0);
        assert!(outcome.summary.frames_processed < 400);
        assert_eq!(outcome.detection_index.get("first"), Some(&0));
        assert_eq!(outcome.summary.incomplete_segments.len(), 2);
        assert!(sink.finalized().is_some());
    }

    #[tokio::test]
    async fn decoder_acquisition_failure_is_fatal() {
        let coordinator = builder()
            .decoder_factory(|| -> Result<Arc<dyn Decoder>, DecodeError> {
                Err(DecodeError::Unavailable("no license".to_string()))
            })
            .build()
            .unwrap();
        let result = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(10)))
            .await;
        assert!(matches!(result, Err(PipelineError::Initialization(_))));
    }

    #[tokio::test]
    async fn unknown_length_source_cannot_run_as_file() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let coordinator = builder().decoder_factory(factory).build().unwrap();
        let result = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(10).live()))
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Source(SourceError::UnknownLength))
        ));
    }

    #[tokio::test]
    async fn time_window_selects_frames_by_fps() {
        let (decoder, factory) = ScriptedDecoder::new()
            .with_label(5, "before")
            .with_label(25, "inside")
            .into_factory();
        let coordinator = builder()
            .time_window(2.0, 5.0)
            .decoder_factory(factory)
            .build()
            .unwrap();

        let outcome = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(100).with_fps(10.0)))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.summary.frames_total, Some(30));
        assert_eq!(outcome.summary.frames_processed, 30);
        assert_eq!(decoder.calls(), 30);
        assert!(outcome.detection_index.contains_key("inside"));
        assert!(!outcome.detection_index.contains_key("before"));
    }

    #[tokio::test]
    async fn time_window_without_fps_is_rejected() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let coordinator = builder()
            .time_window(1.0, 2.0)
            .decoder_factory(factory)
            .build()
            .unwrap();
        let result = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(100)))
            .await;
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn crashed_worker_leaves_a_reported_gap() {
        let (_, factory) = ScriptedDecoder::new().with_label(60, "C").into_factory();
        let coordinator = builder().decoder_factory(factory).build().unwrap();

        let outcome = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(100).with_panic_at(30)))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::WorkersExited);
        assert_eq!(outcome.summary.worker_crashes, 1);
        assert_eq!(
            outcome.summary.incomplete_segments,
            vec![WorkUnit { start: 25, end: 50 }]
        );
        assert_eq!(outcome.summary.frames_processed, 80);
        assert_eq!(outcome.detection_index.get("C"), Some(&60));
    }

    #[tokio::test]
    async fn silent_workers_end_the_run_as_stalled() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let coordinator = builder()
            .workers(1)
            .batch_size(3)
            .decode_timeout(Duration::from_millis(100))
            .stall_timeout(Some(Duration::from_millis(300)))
            .decoder_factory(factory)
            .build()
            .unwrap();

        // The worker is stuck waiting on its source, not on a decode.
        let source = SyntheticSource::new(3).with_pace(Duration::from_secs(30));
        let started = std::time::Instant::now();
        let outcome = coordinator.run_file(synthetic_sources(source)).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(outcome.termination, Termination::Stalled);
        assert_eq!(outcome.summary.frames_processed, 0);
        assert_eq!(
            outcome.summary.incomplete_segments,
            vec![WorkUnit { start: 0, end: 3 }]
        );
    }

    #[tokio::test]
    async fn slow_batches_that_keep_delivering_are_not_stalled() {
        // One batch takes 400ms, longer than the stall timeout, but every
        // frame is published as soon as it is decoded.
        let (_, factory) = ScriptedDecoder::new()
            .with_default_delay(Duration::from_millis(100))
            .into_factory();
        let coordinator = builder()
            .workers(1)
            .batch_size(4)
            .decode_concurrency(1)
            .decode_timeout(Duration::from_millis(250))
            .stall_timeout(Some(Duration::from_millis(300)))
            .decoder_factory(factory)
            .build()
            .unwrap();

        let outcome = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(8)))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.summary.frames_processed, 8);
        assert_eq!(outcome.summary.timed_out, 0);
    }

    #[tokio::test]
    async fn stall_timeout_within_one_decode_is_rejected() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let result = builder()
            .decode_timeout(Duration::from_secs(1))
            .stall_timeout(Some(Duration::from_millis(300)))
            .decoder_factory(factory)
            .build();
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn snapshots_track_progress_to_completion() {
        let (_, factory) = ScriptedDecoder::new()
            .with_default_delay(Duration::from_millis(20))
            .into_factory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink::default());
        let coordinator = builder()
            .workers(2)
            .progress_interval(Duration::from_millis(20))
            .progress_sink(Arc::new(tx))
            .result_sink(sink.clone())
            .decoder_factory(factory)
            .build()
            .unwrap();

        coordinator
            .run_file(synthetic_sources(SyntheticSource::new(60)))
            .await
            .unwrap();

        let snapshots: Vec<ProgressSnapshot> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(snapshots.len() >= 3, "{} snapshots", snapshots.len());
        let first = snapshots.first().unwrap();
        assert_eq!(first.phase, Phase::Initializing);
        assert_eq!(first.overall_progress, 0.0);
        let last = snapshots.last().unwrap();
        assert_eq!(last.phase, Phase::Completed);
        assert_eq!(last.overall_progress, 100.0);
        assert_eq!(last.frames_total, Some(60));
        assert!(snapshots
            .iter()
            .all(|s| s.overall_progress.is_finite() && s.estimated_remaining_secs.is_finite()));
        assert_eq!(
            snapshots.iter().map(|s| s.frames_in_interval).sum::<u64>(),
            60
        );
        // At most one checkpoint per periodic snapshot, none for the first
        // and last.
        assert!(sink.checkpoint_count() >= 1);
        assert!(sink.checkpoint_count() <= snapshots.len() - 2);
    }

    #[tokio::test]
    async fn slow_checkpoints_do_not_hold_up_the_run() {
        let (_, factory) = ScriptedDecoder::new()
            .with_default_delay(Duration::from_millis(30))
            .into_factory();
        let sink = Arc::new(RecordingSink::with_checkpoint_delay(Duration::from_millis(250)));
        let coordinator = builder()
            .workers(2)
            .progress_interval(Duration::from_millis(20))
            .result_sink(sink.clone())
            .decoder_factory(factory)
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let outcome = coordinator
            .run_file(synthetic_sources(SyntheticSource::new(60)))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.summary.frames_processed, 60);
        // Blocking on each tick would cost 250ms per 20ms of progress.
        assert!(elapsed < Duration::from_millis(1200), "{elapsed:?}");
        assert!(sink.checkpoint_count() >= 1);
        assert!(sink.checkpoint_count() <= 3);
        assert!(sink.finalized().is_some());
    }

    #[tokio::test]
    async fn live_run_drains_after_end_of_stream() {
        let (_, factory) = ScriptedDecoder::new().with_label(7, "L").into_factory();
        let coordinator = builder()
            .workers(2)
            .frame_buffer_capacity(64)
            .frame_wait(Duration::from_millis(20))
            .decoder_factory(factory)
            .build()
            .unwrap();

        let source = SyntheticSource::new(30).live().with_pace(Duration::from_millis(1));
        let outcome = coordinator.run_live(Box::new(source)).await.unwrap();

        assert_eq!(outcome.termination, Termination::WorkersExited);
        assert_eq!(outcome.summary.frames_processed, 30);
        assert_eq!(outcome.summary.frames_read, 30);
        assert_eq!(outcome.summary.dropped, 0);
        assert_eq!(outcome.summary.frames_total, None);
        assert_eq!(outcome.detection_index.get("L"), Some(&7));
    }

    #[tokio::test]
    async fn live_run_stops_on_signal() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let coordinator = builder()
            .workers(2)
            .frame_wait(Duration::from_millis(10))
            .decoder_factory(factory)
            .build()
            .unwrap();
        let stop = coordinator.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            stop.stop();
        });

        let source = SyntheticSource::endless().with_pace(Duration::from_millis(1));
        let outcome = coordinator.run_live(Box::new(source)).await.unwrap();

        assert_eq!(outcome.termination, Termination::Interrupted);
        assert!(outcome.summary.frames_processed > 0);
    }

    #[tokio::test]
    async fn live_overload_drops_oldest_frames() {
        let (_, factory) = ScriptedDecoder::new()
            .with_default_delay(Duration::from_millis(20))
            .into_factory();
        let coordinator = builder()
            .workers(1)
            .batch_size(1)
            .decode_concurrency(1)
            .frame_buffer_capacity(2)
            .frame_wait(Duration::from_millis(20))
            .decoder_factory(factory)
            .build()
            .unwrap();

        let outcome = coordinator
            .run_live(Box::new(SyntheticSource::new(40).live()))
            .await
            .unwrap();

        let summary = &outcome.summary;
        assert_eq!(outcome.termination, Termination::WorkersExited);
        assert_eq!(summary.frames_read, 40);
        assert!(summary.dropped > 0);
        assert!(summary.frames_processed > 0);
        assert_eq!(summary.frames_processed + summary.dropped, summary.frames_read);
    }

    #[tokio::test]
    async fn live_run_ends_when_the_reader_dies() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let coordinator = builder()
            .workers(2)
            .frame_wait(Duration::from_millis(20))
            .decoder_factory(factory)
            .build()
            .unwrap();

        let source = SyntheticSource::endless().live().with_panic_at(5);
        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            coordinator.run_live(Box::new(source)),
        )
        .await
        .expect("live run hung after its reader died")
        .unwrap();

        assert_eq!(outcome.termination, Termination::WorkersExited);
        assert_eq!(outcome.summary.frames_processed, 5);
        assert_eq!(outcome.summary.dropped, 0);
    }

    #[tokio::test]
    async fn live_run_replaces_a_killed_worker() {
        let (_, factory) = ScriptedDecoder::new()
            .with_default_delay(Duration::from_millis(2))
            .into_factory();
        let coordinator = builder()
            .workers(2)
            .batch_size(2)
            .frame_buffer_capacity(256)
            .frame_wait(Duration::from_millis(20))
            .decoder_factory(factory)
            .build()
            .unwrap();

        let source = SyntheticSource::new(80).live().with_pace(Duration::from_millis(2));
        let kill = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            coordinator.kill_live_worker()
        };
        let (outcome, killed) = tokio::join!(coordinator.run_live(Box::new(source)), kill);
        let outcome = outcome.unwrap();

        assert!(killed);
        assert_eq!(outcome.termination, Termination::WorkersExited);
        assert!(outcome.summary.worker_replacements >= 1);
        assert_eq!(outcome.summary.worker_crashes, 0);
        assert!(outcome.summary.frames_processed > 0);
        assert!(outcome.summary.frames_processed <= 80);
    }

    #[tokio::test]
    async fn live_pool_replaces_dead_workers_before_dispatch() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let factory: Arc<dyn DecoderFactory> = Arc::new(factory);
        let (result_tx, _result_rx) = mpsc::channel(8);
        let settings = WorkerSettings {
            batch_size: 2,
            concurrency: 1,
            timeout: Duration::from_secs(1),
        };
        let mut pool = LivePool::new(
            settings,
            Arc::clone(&factory),
            result_tx,
            CancellationToken::new(),
            2,
        );
        for _ in 0..2 {
            pool.spawn(factory.create().unwrap());
        }
        if let Some(slot) = pool.slots.get(&0) {
            slot.handle.abort();
        }
        while pool.slots.get(&0).is_some_and(|slot| !slot.handle.is_finished()) {
            tokio::task::yield_now().await;
        }

        let mut run = RunContext::new(Uuid::new_v4(), FirstSeenPolicy::Arrival);
        let assigned = pool.assign(1, crate::testing::blank_frames(0..2), &mut run).await;

        assert!(assigned.is_ok());
        assert_eq!(pool.len(), 2);
        assert_eq!(run.summary.worker_replacements, 1);
        pool.close();
    }

    #[tokio::test]
    async fn live_pool_replaces_dead_workers() {
        let (_, factory) = ScriptedDecoder::new().into_factory();
        let factory: Arc<dyn DecoderFactory> = Arc::new(factory);
        let (result_tx, _result_rx) = mpsc::channel(8);
        let settings = WorkerSettings {
            batch_size: 2,
            concurrency: 1,
            timeout: Duration::from_secs(1),
        };
        let mut pool = LivePool::new(
            settings,
            Arc::clone(&factory),
            result_tx,
            CancellationToken::new(),
            2,
        );
        for _ in 0..2 {
            pool.spawn(factory.create().unwrap());
        }

        if let Some(slot) = pool.slots.get(&0) {
            slot.handle.abort();
        }
        while pool.slots.get(&0).is_some_and(|slot| !slot.handle.is_finished()) {
            tokio::task::yield_now().await;
        }

        let mut run = RunContext::new(Uuid::new_v4(), FirstSeenPolicy::Arrival);
        pool.replace_dead(&mut run).await;

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.slots.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(run.summary.worker_replacements, 1);

        // An announcement from the retired worker must not consume a batch.
        let batch = crate::testing::blank_frames(0..2);
        assert!(pool.dispatch(0, batch).is_err());
        pool.close();
    }
}
