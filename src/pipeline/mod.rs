pub mod aggregator;
pub mod decode;
pub mod executor;
pub mod progress;
pub mod segmenter;
pub mod worker;

pub use aggregator::{DetectionIndex, FirstSeenPolicy, LocationMap, ResultAggregator};
pub use decode::{DecodeService, Decoder, DecoderFactory};
pub use executor::TimedDecodeExecutor;
pub use progress::{LogProgressSink, Phase, ProgressSink, ProgressSnapshot};
pub use segmenter::{next_batch, segment, WorkUnit};
pub use worker::{Worker, WorkerExit, WorkerHandle, WorkerReport, WorkerSettings, WorkerState};
