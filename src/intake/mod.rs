pub mod buffer;
pub mod reader;
pub mod source;

pub use buffer::{BoundedFrameBuffer, PopError};
pub use reader::{spawn_frame_reader, ReaderReport};
pub use source::{FrameRange, FrameSource, SourceFactory};
