use crate::{
    common::{Detection, Frame},
    error::DecodeError,
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::Service;

/// The external recognition capability: one frame in, detections out.
///
/// Instances are owned by a single worker. A worker may run several decode
/// calls at once on the blocking pool, hence `Sync`.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, frame: &Frame) -> Result<Vec<Detection>, DecodeError>;

    /// Return backend resources once the owning worker is done with them.
    fn release(&self) {}
}

/// Acquires one decoder instance per worker.
pub trait DecoderFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Arc<dyn Decoder>, DecodeError>;
}

impl<F> DecoderFactory for F
where
    F: Fn() -> Result<Arc<dyn Decoder>, DecodeError> + Send + Sync + 'static,
{
    fn create(&self) -> Result<Arc<dyn Decoder>, DecodeError> {
        self()
    }
}

/// Runs a decoder call on the blocking pool so a slow frame never holds an
/// async worker thread.
#[derive(Clone)]
pub struct DecodeService {
    decoder: Arc<dyn Decoder>,
}

impl DecodeService {
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self { decoder }
    }
}

impl Service<Frame> for DecodeService {
    type Response = Vec<Detection>;
    type Error = DecodeError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, frame: Frame) -> Self::Future {
        let decoder = Arc::clone(&self.decoder);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || decoder.decode(&frame))
                .await
                .map_err(|e| DecodeError::Panicked(e.to_string()))?
        })
    }
}
