use image::RgbImage;
use slide_sieve_common::frame::Frame;
use std::collections::VecDeque;

use crate::{FrameSource, SourceError};

/// Frames held in memory. Handy for tests and for callers that decode elsewhere.
pub struct MemorySource {
    frames: VecDeque<RgbImage>,
    total: Option<u64>,
    next_index: u64,
}

impl MemorySource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        let total = Some(frames.len() as u64);
        Self {
            frames: frames.into(),
            total,
            next_index: 0,
        }
    }

    /// Hide the frame count, as a live or unindexed stream would.
    pub fn without_total(mut self) -> Self {
        self.total = None;
        self
    }
}

impl FrameSource for MemorySource {
    fn total_frames(&self) -> Option<u64> {
        self.total
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(self.frames.pop_front().map(|image| {
            let frame = Frame::new(self.next_index, image);
            self.next_index += 1;
            frame
        }))
    }
}
