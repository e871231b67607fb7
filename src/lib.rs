pub mod common;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod intake;
pub mod pipeline;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use common::{Detection, Frame, FrameOutcome, FrameResult};
pub use config::Configuration;
pub use coordinator::{
    Coordinator, CoordinatorBuilder, RunOutcome, RunSummary, StopHandle, Termination,
};
pub use error::{DecodeError, ExportError, PipelineError, SourceError};
pub use export::{FileExporter, ResultSink};
pub use intake::{FrameRange, FrameSource, SourceFactory};
pub use pipeline::{
    Decoder, DecoderFactory, DetectionIndex, FirstSeenPolicy, LocationMap, ProgressSink,
    ProgressSnapshot,
};
