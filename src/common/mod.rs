pub mod detection;
pub mod frame;

pub use detection::{Detection, FrameOutcome, FrameResult};
pub use frame::Frame;
