use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use super::state::RunCounters;

/// Snapshot emitted once per sampled frame, after its verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub counters: RunCounters,
    pub frames_total: Option<u64>,
    pub elapsed: Duration,
    /// `None` when the total is unknown or no time has elapsed yet.
    pub remaining: Option<Duration>,
    /// Frames observed per second, under the same conditions as `remaining`.
    pub rate: Option<f64>,
}

impl ProgressEvent {
    pub fn new(counters: RunCounters, frames_total: Option<u64>, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let (rate, remaining) = match frames_total {
            Some(total) if secs > 0.0 => {
                let rate = counters.frame_count as f64 / secs;
                let left = total.saturating_sub(counters.frame_count);
                let remaining = if left == 0 {
                    Some(Duration::ZERO)
                } else if rate > 0.0 {
                    Duration::try_from_secs_f64(left as f64 / rate).ok()
                } else {
                    None
                };
                (Some(rate), remaining)
            }
            _ => (None, None),
        };

        Self {
            counters,
            frames_total,
            elapsed,
            remaining,
            rate,
        }
    }

    /// Share of the known total observed so far, 0 to 100.
    pub fn percent(&self) -> Option<f64> {
        match self.frames_total {
            Some(total) if total > 0 => {
                Some((self.counters.frame_count as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

/// `HH:MM:SS`, or `--:--:--` when unknown.
pub fn format_hms(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => {
            let secs = d.as_secs();
            format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
        }
        None => "--:--:--".to_string(),
    }
}

/// Receives progress events on the worker's thread. Must not block.
pub trait ProgressSink {
    fn report(&mut self, event: ProgressEvent);
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn report(&mut self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(event);
    }
}

impl ProgressSink for Vec<ProgressEvent> {
    fn report(&mut self, event: ProgressEvent) {
        self.push(event);
    }
}

impl ProgressSink for () {
    fn report(&mut self, _event: ProgressEvent) {}
}
