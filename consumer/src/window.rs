use slide_sieve_common::frame::Frame;
use std::collections::VecDeque;

use crate::filter::DuplicateDetector;

/// Bounded FIFO of the most recently accepted frames, each kept with its
/// duplicate-test signature so members are never re-downscaled.
pub struct RecencyWindow<S> {
    entries: VecDeque<(Frame, S)>,
    capacity: usize,
}

/// The window member a candidate was found to duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateHit {
    pub frame_index: u64,
}

impl<S> RecencyWindow<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an accepted frame, evicting and returning the oldest one when full.
    pub fn push(&mut self, frame: Frame, signature: S) -> Option<Frame> {
        if self.capacity == 0 {
            return Some(frame);
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|(frame, _)| frame)
        } else {
            None
        };
        self.entries.push_back((frame, signature));
        evicted
    }

    /// Members in acceptance order, oldest first.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.iter().map(|(frame, _)| frame)
    }

    /// First member (oldest first) the candidate duplicates, if any.
    pub fn find_duplicate<D>(&self, detector: &D, candidate: &S) -> Option<DuplicateHit>
    where
        D: DuplicateDetector<Signature = S>,
    {
        self.entries
            .iter()
            .find(|(_, signature)| detector.is_duplicate(signature, candidate))
            .map(|(frame, _)| DuplicateHit {
                frame_index: frame.index,
            })
    }
}
