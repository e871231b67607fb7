use crate::{config::Configuration, error::PipelineError};
use std::str::FromStr;
use tracing::Level;

/// Install the `fmt` subscriber for the host process at `level`.
///
/// Calling this again after a subscriber is installed is a no-op. The
/// pipeline itself only emits events and never installs a subscriber.
pub fn init_logging(level: &str) -> Result<(), PipelineError> {
    let level = Level::from_str(level)
        .map_err(|e| PipelineError::Logging(format!("unknown log level {level:?}: {e}")))?;
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
    Ok(())
}

/// Install the subscriber at the configured `log_level`.
pub fn init_logging_from(configuration: &Configuration) -> Result<(), PipelineError> {
    init_logging(&configuration.log_level)
}
