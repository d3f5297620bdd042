use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::window::RecencyWindow;

/// Controller lifecycle: `Idle → Running → {Completed, Cancelled, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Per-run tallies. Only the controller mutates these, and only upwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub frame_count: u64,
    pub sampled_count: u64,
    pub saved_count: u64,
    pub duplicate_count: u64,
    pub trained_match_count: u64,
}

impl RunCounters {
    /// Every sampled frame ends up saved, duplicate or trained match.
    pub fn is_consistent(&self) -> bool {
        self.saved_count + self.duplicate_count + self.trained_match_count == self.sampled_count
    }
}

/// Mutable state owned by one run: counters plus the recency window.
pub struct RunState<S> {
    pub counters: RunCounters,
    pub window: RecencyWindow<S>,
}

impl<S> RunState<S> {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            counters: RunCounters::default(),
            window: RecencyWindow::new(window_capacity),
        }
    }
}

/// Shared stop request. Setting it is idempotent and cannot be undone.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
