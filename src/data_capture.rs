pub mod stream_capture;
pub mod transcript;

pub use stream_capture::{copy_open, copy_stream, Direction};
pub use transcript::Transcript;
