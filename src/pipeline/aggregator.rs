use crate::common::{Detection, FrameOutcome, FrameResult};
use indexmap::{map::Entry, IndexMap};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Label to first-seen frame, in insertion order.
pub type DetectionIndex = IndexMap<String, u64>;

/// Frame to every detection found in it. Only frames with at least one
/// detection have an entry.
pub type LocationMap = BTreeMap<u64, Vec<Detection>>;

/// Which frame counts as "first seen" for a label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstSeenPolicy {
    /// Whichever result reaches the aggregator first. Workers run in
    /// parallel, so this is not necessarily the lowest frame index.
    #[default]
    Arrival,
    /// The lowest frame index observed; the final index is sorted by frame.
    LowestFrame,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub frames_processed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub unique_labels: usize,
    pub frames_with_detections: usize,
}

/// Counters accumulated since the previous `take_interval` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalStats {
    pub frames: u64,
    pub new_unique: u64,
}

/// Single consumer of the result channel. Owns the detection index and the
/// location map for the whole run.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    policy: FirstSeenPolicy,
    index: DetectionIndex,
    locations: LocationMap,
    frames_processed: u64,
    timed_out: u64,
    failed: u64,
    interval: IntervalStats,
}

impl ResultAggregator {
    pub fn new(policy: FirstSeenPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn ingest(&mut self, result: FrameResult) {
        let FrameResult {
            frame_index,
            detections,
            outcome,
        } = result;

        self.frames_processed += 1;
        self.interval.frames += 1;
        match outcome {
            FrameOutcome::Decoded => {}
            FrameOutcome::TimedOut => self.timed_out += 1,
            FrameOutcome::Failed => self.failed += 1,
        }

        for detection in &detections {
            match self.index.entry(detection.label.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(frame_index);
                    self.interval.new_unique += 1;
                }
                Entry::Occupied(mut entry) => {
                    if self.policy == FirstSeenPolicy::LowestFrame && frame_index < *entry.get() {
                        entry.insert(frame_index);
                    }
                }
            }
        }

        if detections.is_empty() {
            return;
        }
        if self.locations.contains_key(&frame_index) {
            warn!(
                "Frame {} was reported twice, keeping the first result",
                frame_index
            );
            return;
        }
        self.locations.insert(frame_index, detections);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn unique_count(&self) -> usize {
        self.index.len()
    }

    /// Return and reset the per-interval counters.
    pub fn take_interval(&mut self) -> IntervalStats {
        std::mem::take(&mut self.interval)
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            frames_processed: self.frames_processed,
            timed_out: self.timed_out,
            failed: self.failed,
            unique_labels: self.index.len(),
            frames_with_detections: self.locations.len(),
        }
    }

    pub fn detection_index(&self) -> &DetectionIndex {
        &self.index
    }

    pub fn location_map(&self) -> &LocationMap {
        &self.locations
    }

    pub fn finish(self) -> (DetectionIndex, LocationMap) {
        let mut index = self.index;
        if self.policy == FirstSeenPolicy::LowestFrame {
            index.sort_by(|_, a, _, b| a.cmp(b));
        }
        (index, self.locations)
    }
}
