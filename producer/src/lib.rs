//! Frame sources: sequential, forward-only access to decoded frames.

pub mod ffmpeg;
pub mod memory;
pub mod sequence;

use slide_sieve_common::config::{SourceConfig, SourceKind};
use slide_sieve_common::frame::Frame;

pub use ffmpeg::{check_ffmpeg_available, FfmpegSource};
pub use memory::MemorySource;
pub use sequence::ImageSequenceSource;

/// A readable, forward-only stream of decoded frames.
pub trait FrameSource: Send {
    /// Total number of frames, when the source knows it upfront.
    fn total_frames(&self) -> Option<u64>;

    /// Decode the next frame. `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn total_frames(&self) -> Option<u64> {
        (**self).total_frames()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }
}

/// Open the source described by the `[source]` config section.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match config.kind {
        SourceKind::Video => Ok(Box::new(FfmpegSource::open(&config.path)?)),
        SourceKind::Images => Ok(Box::new(ImageSequenceSource::open(&config.path)?)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("failed to probe video: {0}")]
    Probe(String),
    #[error("no video stream in {0}")]
    NoVideoStream(String),
    #[error("failed to spawn decoder: {0}")]
    Spawn(String),
    #[error("failed to read from decoder: {0}")]
    Read(String),
    #[error("stream ended mid-frame: got {got} of {expected} bytes")]
    Truncated { got: usize, expected: usize },
    #[error("failed to decode frame {index}: {reason}")]
    Decode { index: u64, reason: String },
}
