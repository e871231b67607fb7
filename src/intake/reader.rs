use crate::{
    error::SourceError,
    intake::{buffer::BoundedFrameBuffer, source::FrameSource},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters reported by the live reader when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderReport {
    pub frames_read: u64,
    pub read_failures: u64,
}

/// Spawn the single producer that fills `buffer` from a live source.
///
/// Read failures and empty polls are retried after `backoff`; they never end
/// the run. The buffer is closed when the source reports end of stream or
/// the token is cancelled.
pub fn spawn_frame_reader(
    mut source: Box<dyn FrameSource>,
    buffer: Arc<BoundedFrameBuffer>,
    backoff: Duration,
    cancel: CancellationToken,
) -> JoinHandle<ReaderReport> {
    tokio::spawn(async move {
        let mut report = ReaderReport::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Frame reader cancelled");
                    break;
                }
                next = source.next_frame() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    report.frames_read += 1;
                    if let Some(evicted) = buffer.push(frame) {
                        debug!("Frame buffer full, dropped frame {}", evicted.index());
                    }
                }
                Ok(None) => {
                    info!("Live source reached end of stream");
                    break;
                }
                Err(SourceError::Exhausted) => {
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    report.read_failures += 1;
                    warn!("Failed to read frame from stream: {}", e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        buffer.close();
        info!(
            "Frame reader stopped after {} frames ({} read failures, {} dropped)",
            report.frames_read,
            report.read_failures,
            buffer.dropped()
        );
        report
    })
}
