use crate::{
    common::Frame,
    intake::{BoundedFrameBuffer, FrameRange, PopError},
};
use serde::Serialize;
use std::time::Duration;

/// Contiguous half-open frame range `[start, end)` owned by one file worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkUnit {
    pub start: u64,
    pub end: u64,
}

impl WorkUnit {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index < self.end
    }
}

/// Partition `range` into at most `workers` contiguous units.
///
/// Every unit has `len / workers` frames except the last, which absorbs the
/// remainder. Units that would be empty (fewer frames than workers) are
/// omitted, so the result covers `range` exactly with no gaps or overlaps.
pub fn segment(range: FrameRange, workers: usize) -> Vec<WorkUnit> {
    let total = range.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.max(1) as u64;
    let segment_size = total / workers;

    (0..workers)
        .map(|i| {
            let start = range.start + i * segment_size;
            let end = if i + 1 == workers {
                range.end
            } else {
                start + segment_size
            };
            WorkUnit { start, end }
        })
        .filter(|unit| !unit.is_empty())
        .collect()
}

/// Draw one live batch: wait up to `wait` for the first frame, then take
/// whatever else is already queued, up to `batch_size` frames in total.
pub async fn next_batch(
    buffer: &BoundedFrameBuffer,
    batch_size: usize,
    wait: Duration,
) -> Result<Vec<Frame>, PopError> {
    let first = buffer.pop(wait).await?;
    let mut batch = Vec::with_capacity(batch_size.max(1));
    batch.push(first);
    while batch.len() < batch_size {
        match buffer.try_pop() {
            Some(frame) => batch.push(frame),
            None => break,
        }
    }
    Ok(batch)
}
