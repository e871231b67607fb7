use crate::{error::PipelineError, pipeline::aggregator::FirstSeenPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "FRAMESWEEP";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub workers: usize,
    pub batch_size: usize,
    pub decode_concurrency: usize,
    pub decode_timeout_ms: u64,
    pub progress_interval_ms: u64,
    pub result_buffer: usize,
    pub frame_buffer_capacity: usize,
    pub frame_wait_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub liveness_interval_ms: u64,
    pub stall_timeout_ms: Option<u64>,
    pub shutdown_grace_ms: u64,
    pub fraction: f64,
    pub start_secs: Option<f64>,
    pub end_secs: Option<f64>,
    pub first_seen: FirstSeenPolicy,
    pub log_level: String,
}

impl Default for Configuration {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            workers: cpus.saturating_sub(1).max(1),
            batch_size: 10,
            decode_concurrency: 10,
            decode_timeout_ms: 10_000,
            progress_interval_ms: 5_000,
            result_buffer: 1_024,
            frame_buffer_capacity: 100,
            frame_wait_ms: 1_000,
            reconnect_backoff_ms: 100,
            liveness_interval_ms: 500,
            stall_timeout_ms: Some(60_000),
            shutdown_grace_ms: 2_000,
            fraction: 1.0,
            start_secs: None,
            end_secs: None,
            first_seen: FirstSeenPolicy::Arrival,
            log_level: "info".to_string(),
        }
    }
}

impl Configuration {
    /// Defaults, overridden by `path` (any format the `config` crate knows
    /// from the extension) and then by `FRAMESWEEP_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let configuration: Configuration = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let positive = [
            ("workers", self.workers as u64),
            ("batch_size", self.batch_size as u64),
            ("decode_concurrency", self.decode_concurrency as u64),
            ("decode_timeout_ms", self.decode_timeout_ms),
            ("progress_interval_ms", self.progress_interval_ms),
            ("result_buffer", self.result_buffer as u64),
            ("frame_buffer_capacity", self.frame_buffer_capacity as u64),
            ("liveness_interval_ms", self.liveness_interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(PipelineError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }
        // Results stream out frame by frame, so a healthy worker is silent
        // for at most one decode timeout.
        if let Some(stall) = self.stall_timeout_ms {
            if stall <= self.decode_timeout_ms {
                return Err(PipelineError::InvalidConfig(format!(
                    "stall_timeout_ms ({stall}) must exceed decode_timeout_ms ({})",
                    self.decode_timeout_ms
                )));
            }
        }
        if !(self.fraction > 0.0 && self.fraction <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "fraction must be in (0, 1], got {}",
                self.fraction
            )));
        }
        match (self.start_secs, self.end_secs) {
            (Some(start), Some(end)) if !(start >= 0.0 && end > start) => {
                Err(PipelineError::InvalidConfig(format!(
                    "invalid time window [{start}, {end})"
                )))
            }
            (Some(_), None) | (None, Some(_)) => Err(PipelineError::InvalidConfig(
                "start_secs and end_secs must be set together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn time_window(&self) -> Option<(f64, f64)> {
        self.start_secs.zip(self.end_secs)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
