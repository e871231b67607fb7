use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;

/// One indexed image sample read from a video file or live stream.
///
/// The pixel payload is shared, so cloning a frame never copies the image.
#[derive(Clone)]
pub struct Frame {
    index: u64,
    image: Arc<DynamicImage>,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(index: u64, image: DynamicImage) -> Self {
        Self {
            index,
            image: Arc::new(image),
            captured_at: Utc::now(),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    // Re-stamps the position; file workers own the authoritative frame counter.
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}
