use serde::{Deserialize, Serialize};

/// A recognized marking: its decoded label and the polygon it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub polygon: Vec<(i32, i32)>,
}

impl Detection {
    pub fn new(label: impl Into<String>, polygon: Vec<(i32, i32)>) -> Self {
        Self {
            label: label.into(),
            polygon,
        }
    }
}

/// How a frame left the decode executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOutcome {
    Decoded,
    TimedOut,
    Failed,
}

/// Detections for one processed frame. Timed out and failed frames carry
/// no detections but are still reported so the frame counts as processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameResult {
    pub frame_index: u64,
    pub detections: Vec<Detection>,
    pub outcome: FrameOutcome,
}

impl FrameResult {
    pub fn decoded(frame_index: u64, detections: Vec<Detection>) -> Self {
        Self {
            frame_index,
            detections,
            outcome: FrameOutcome::Decoded,
        }
    }

    pub fn timed_out(frame_index: u64) -> Self {
        Self {
            frame_index,
            detections: Vec::new(),
            outcome: FrameOutcome::TimedOut,
        }
    }

    pub fn failed(frame_index: u64) -> Self {
        Self {
            frame_index,
            detections: Vec::new(),
            outcome: FrameOutcome::Failed,
        }
    }
}
