use crate::pipeline::aggregator::{AggregatorStats, IntervalStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Run phase as seen from outside. Always derived from the controller's
/// state, never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Processing,
    Draining,
    Finalizing,
    Completed,
    Interrupted,
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    /// Percentage in `[0, 100]`; zero while the total is unknown.
    pub overall_progress: f64,
    pub frames_processed: u64,
    pub frames_total: Option<u64>,
    pub unique_count: usize,
    pub frames_in_interval: u64,
    pub new_unique_in_interval: u64,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: f64,
}

impl ProgressSnapshot {
    pub fn compute(
        phase: Phase,
        stats: &AggregatorStats,
        interval: IntervalStats,
        frames_total: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let processed = stats.frames_processed;

        let (overall_progress, estimated_remaining_secs) = match frames_total {
            Some(total) if total > 0 && processed > 0 => {
                let done = (processed.min(total) as f64) / (total as f64);
                let remaining = elapsed_secs * (1.0 - done) / done;
                (done * 100.0, finite_or_zero(remaining))
            }
            _ => (0.0, 0.0),
        };

        Self {
            timestamp: Utc::now(),
            phase,
            overall_progress,
            frames_processed: processed,
            frames_total,
            unique_count: stats.unique_labels,
            frames_in_interval: interval.frames,
            new_unique_in_interval: interval.new_unique,
            elapsed_secs,
            estimated_remaining_secs,
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

/// Consumer of periodic progress snapshots: a UI, a log, an orchestrator.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, snapshot: &ProgressSnapshot);
}

/// Writes each snapshot as one JSON log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn emit(&self, snapshot: &ProgressSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(line) => info!(target: "framesweep::progress", "{}", line),
            Err(e) => warn!("Failed to serialize progress snapshot: {}", e),
        }
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressSnapshot> {
    fn emit(&self, snapshot: &ProgressSnapshot) {
        // A dropped receiver just means nobody is watching anymore.
        let _ = self.send(snapshot.clone());
    }
}
