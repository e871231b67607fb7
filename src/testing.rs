//! Deterministic collaborators shared by the unit tests.

use crate::{
    common::{Detection, Frame},
    error::{DecodeError, ExportError, SourceError},
    export::ResultSink,
    intake::{FrameSource, SourceFactory},
    pipeline::{
        aggregator::{DetectionIndex, LocationMap},
        decode::{Decoder, DecoderFactory},
    },
};
use async_trait::async_trait;
use image::{DynamicImage, RgbImage};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

pub fn blank_frame(index: u64) -> Frame {
    Frame::new(index, DynamicImage::ImageRgb8(RgbImage::new(1, 1)))
}

pub fn blank_frames(range: Range<u64>) -> Vec<Frame> {
    range.map(blank_frame).collect()
}

/// In-memory frame source. Seekable and finite unless made `live` or
/// `endless`.
#[derive(Debug, Clone, Default)]
pub struct SyntheticSource {
    len: Option<u64>,
    cursor: u64,
    seekable: bool,
    fps: Option<f64>,
    unreadable: HashSet<u64>,
    panic_at: Option<u64>,
    pace: Option<Duration>,
}

impl SyntheticSource {
    pub fn new(len: u64) -> Self {
        Self {
            len: Some(len),
            seekable: true,
            ..Default::default()
        }
    }

    pub fn endless() -> Self {
        Self::default()
    }

    pub fn live(mut self) -> Self {
        self.seekable = false;
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_unreadable(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.unreadable.extend(indices);
        self
    }

    pub fn with_panic_at(mut self, index: u64) -> Self {
        self.panic_at = Some(index);
        self
    }

    /// Sleep between frames, like a camera delivering at a fixed rate.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    fn frame_count(&self) -> Option<u64> {
        if self.seekable {
            self.len
        } else {
            None
        }
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    async fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        if !self.seekable {
            return Err(SourceError::NotSeekable);
        }
        if let Some(len) = self.len {
            if index >= len {
                return Err(SourceError::OutOfRange { index, len });
            }
        }
        self.cursor = index;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        match self.pace {
            Some(pace) => tokio::time::sleep(pace).await,
            None => tokio::task::yield_now().await,
        }
        let index = self.cursor;
        if self.len.is_some_and(|len| index >= len) {
            return Ok(None);
        }
        if self.panic_at == Some(index) {
            panic!("synthetic source failed at frame {index}");
        }
        self.cursor += 1;
        if self.unreadable.contains(&index) {
            return Err(SourceError::Read {
                index: Some(index),
                reason: "corrupt synthetic frame".to_string(),
            });
        }
        Ok(Some(blank_frame(index)))
    }
}

/// Every `open` hands out a fresh copy of `source`.
pub fn synthetic_sources(source: SyntheticSource) -> Arc<dyn SourceFactory> {
    Arc::new(move || -> Result<Box<dyn FrameSource>, SourceError> { Ok(Box::new(source.clone())) })
}

/// Decoder whose behavior is scripted per frame index.
#[derive(Debug, Default)]
pub struct ScriptedDecoder {
    labels: HashMap<u64, String>,
    delays: HashMap<u64, Duration>,
    default_delay: Option<Duration>,
    failures: HashSet<u64>,
    panics: HashSet<u64>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    released: AtomicBool,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, index: u64, label: &str) -> Self {
        self.labels.insert(index, label.to_string());
        self
    }

    pub fn with_delay(mut self, index: u64, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    /// Blocks the decode thread for `duration`, well past any test timeout.
    pub fn with_hang(self, index: u64, duration: Duration) -> Self {
        self.with_delay(index, duration)
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    pub fn with_failure(mut self, index: u64) -> Self {
        self.failures.insert(index);
        self
    }

    pub fn with_panic(mut self, index: u64) -> Self {
        self.panics.insert(index);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Share this decoder between every worker of a run.
    pub fn into_factory(self) -> (Arc<Self>, impl DecoderFactory) {
        let shared = Arc::new(self);
        let handed_out = Arc::clone(&shared);
        let factory = move || -> Result<Arc<dyn Decoder>, DecodeError> {
            Ok(Arc::clone(&handed_out) as Arc<dyn Decoder>)
        };
        (shared, factory)
    }
}

impl Decoder for ScriptedDecoder {
    fn decode(&self, frame: &Frame) -> Result<Vec<Detection>, DecodeError> {
        let index = frame.index();
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(&index).copied().or(self.default_delay) {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panics.contains(&index) {
            panic!("scripted decoder panic at frame {index}");
        }
        if self.failures.contains(&index) {
            return Err(DecodeError::Backend(format!("scripted failure at frame {index}")));
        }
        Ok(self
            .labels
            .get(&index)
            .map(|label| vec![Detection::new(label.clone(), square())])
            .unwrap_or_default())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

pub fn square() -> Vec<(i32, i32)> {
    vec![(0, 0), (1, 0), (1, 1), (0, 1)]
}

/// Keeps every checkpoint and the final hand-off in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    checkpoint_delay: Option<Duration>,
    checkpoints: Mutex<Vec<(DetectionIndex, LocationMap)>>,
    finalized: Mutex<Option<(DetectionIndex, LocationMap)>>,
}

impl RecordingSink {
    /// Every checkpoint blocks its thread for `delay`, like a slow disk.
    pub fn with_checkpoint_delay(delay: Duration) -> Self {
        Self {
            checkpoint_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn finalized(&self) -> Option<(DetectionIndex, LocationMap)> {
        self.finalized.lock().ok().and_then(|f| f.clone())
    }
}

impl ResultSink for RecordingSink {
    fn checkpoint(&self, index: &DetectionIndex, locations: &LocationMap) -> Result<(), ExportError> {
        if let Some(delay) = self.checkpoint_delay {
            std::thread::sleep(delay);
        }
        if let Ok(mut checkpoints) = self.checkpoints.lock() {
            checkpoints.push((index.clone(), locations.clone()));
        }
        Ok(())
    }

    fn finalize(&self, index: &DetectionIndex, locations: &LocationMap) -> Result<(), ExportError> {
        if let Ok(mut finalized) = self.finalized.lock() {
            *finalized = Some((index.clone(), locations.clone()));
        }
        Ok(())
    }
}
