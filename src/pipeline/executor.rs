use crate::{
    common::{Frame, FrameResult},
    pipeline::decode::{DecodeService, Decoder},
};
use futures::stream::{FuturesOrdered, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tower::{
    limit::ConcurrencyLimit, timeout::error::Elapsed, timeout::Timeout, Service, ServiceBuilder,
    ServiceExt,
};
use tracing::warn;

type DecodeStack = ConcurrencyLimit<Timeout<DecodeService>>;

/// Applies a decoder to a batch of frames with at most `concurrency` calls
/// in flight and a hard per-frame `timeout`.
///
/// Every frame yields exactly one [`FrameResult`], in batch order. A frame
/// that exceeds the timeout or whose decode fails becomes an empty result;
/// sibling frames keep running and are not cancelled.
///
/// A timed-out frame gives its permit back at once, but its blocking call
/// keeps running until the decoder returns. After timeouts the number of
/// calls actually executing inside one [`Decoder`] can therefore exceed
/// `concurrency`.
pub struct TimedDecodeExecutor {
    service: DecodeStack,
    concurrency: usize,
    timeout: Duration,
}

impl TimedDecodeExecutor {
    pub fn new(decoder: Arc<dyn Decoder>, concurrency: usize, timeout: Duration) -> Self {
        let concurrency = concurrency.max(1);
        let service = ServiceBuilder::new()
            .concurrency_limit(concurrency)
            .timeout(timeout)
            .service(DecodeService::new(decoder));
        Self {
            service,
            concurrency,
            timeout,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decode the batch, yielding each result in batch order as soon as it
    /// and every frame before it are done.
    pub fn stream_batch(&self, frames: Vec<Frame>) -> impl Stream<Item = FrameResult> + '_ {
        frames
            .into_iter()
            .map(|frame| self.decode(frame))
            .collect::<FuturesOrdered<_>>()
    }

    pub async fn run_batch(&self, frames: Vec<Frame>) -> Vec<FrameResult> {
        self.stream_batch(frames).collect().await
    }

    async fn decode(&self, frame: Frame) -> FrameResult {
        // Each clone acquires its own permit from the shared limit.
        let mut service = self.service.clone();
        let index = frame.index();
        let outcome = match service.ready().await {
            Ok(ready) => ready.call(frame).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(detections) => FrameResult::decoded(index, detections),
            Err(e) if e.is::<Elapsed>() => {
                warn!(
                    "Timeout processing frame {} after {:?}",
                    index, self.timeout
                );
                FrameResult::timed_out(index)
            }
            Err(e) => {
                warn!("Error processing frame {}: {}", index, e);
                FrameResult::failed(index)
            }
        }
    }
}
