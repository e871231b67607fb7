use thiserror::Error;

// Run level error type, only returned before any work starts.

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to initialize decoder: {0}")]
    Initialization(#[source] DecodeError),
    #[error("Frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Frame range [{start}, {end}) is empty")]
    EmptyRange { start: u64, end: u64 },
    #[error("Failed to install logging: {0}")]
    Logging(String),
}

// Decode capability errors, contained per frame.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Decoder backend failed: {0}")]
    Backend(String),
    #[error("Decoder unavailable: {0}")]
    Unavailable(String),
    #[error("Decode task panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Failed to open frame source: {0}")]
    Open(String),
    #[error("Frame {index} is out of range for a source of {len} frames")]
    OutOfRange { index: u64, len: u64 },
    #[error("Failed to read frame {index:?}: {reason}")]
    Read { index: Option<u64>, reason: String },
    #[error("Source has no frame available yet")]
    Exhausted,
    #[error("Source does not support seeking")]
    NotSeekable,
    #[error("Source does not report a frame count")]
    UnknownLength,
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
