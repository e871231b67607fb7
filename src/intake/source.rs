use crate::{
    common::Frame,
    error::{PipelineError, SourceError},
};
use async_trait::async_trait;

/// Sequential access to frames.
///
/// File sources are finite and seekable: every worker opens its own handle
/// and seeks to the start of its segment. Live sources are read by a single
/// producer and only ever pulled forward; transient read failures are
/// reported as errors so the producer can back off and retry.
#[async_trait]
pub trait FrameSource: Send {
    /// Total number of frames, `None` for unbounded sources.
    fn frame_count(&self) -> Option<u64>;

    /// Frames per second, when the container reports it.
    fn fps(&self) -> Option<f64> {
        None
    }

    /// Position the source so the next read yields frame `index`.
    async fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        let _ = index;
        Err(SourceError::NotSeekable)
    }

    /// Read the next frame. `Ok(None)` marks the end of the stream.
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Opens independent source handles, one per worker or producer.
pub trait SourceFactory: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError>;
}

impl<F> SourceFactory for F
where
    F: Fn() -> Result<Box<dyn FrameSource>, SourceError> + Send + Sync + 'static,
{
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        self()
    }
}

/// Half-open range of frame indices `[start, end)` selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u64,
    pub end: u64,
}

impl FrameRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn full(total: u64) -> Self {
        Self::new(0, total)
    }

    /// The leading `fraction` of a source of `total` frames.
    pub fn from_fraction(total: u64, fraction: f64) -> Result<Self, PipelineError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "fraction must be in (0, 1], got {fraction}"
            )));
        }
        let end = ((total as f64) * fraction).floor() as u64;
        Self::non_empty(0, end.min(total))
    }

    /// Frames covering `[start_secs, end_secs)` at the given frame rate,
    /// clamped to the source length.
    pub fn from_time_window(
        start_secs: f64,
        end_secs: f64,
        fps: f64,
        total: u64,
    ) -> Result<Self, PipelineError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "time window needs a positive frame rate, got {fps}"
            )));
        }
        if !(start_secs >= 0.0 && end_secs > start_secs) {
            return Err(PipelineError::InvalidConfig(format!(
                "invalid time window [{start_secs}, {end_secs})"
            )));
        }
        let start = (start_secs * fps).floor() as u64;
        let end = ((end_secs * fps).floor() as u64).min(total);
        Self::non_empty(start, end)
    }

    fn non_empty(start: u64, end: u64) -> Result<Self, PipelineError> {
        if start >= end {
            return Err(PipelineError::EmptyRange { start, end });
        }
        Ok(Self::new(start, end))
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
