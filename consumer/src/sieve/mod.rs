//! The sampling loop: strided iteration over a frame source, the two
//! rejection tests, slide persistence and progress events.

pub mod keys;
pub mod progress;
pub mod state;

use serde::Serialize;
use slide_sieve_common::config::{CheckOrder, Config, OutputConfig};
use slide_sieve_common::frame::Frame;
use slide_sieve_producer::{FrameSource, SourceError};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::filter::{
    CorrelationDetector, DescriptorMatcher, DuplicateDetector, OrbExtractor, ReferenceError,
    ReferenceMatcher, TrainedReferenceSet,
};
use crate::storage::{SlideRecord, SlideStore, StorageError};
use crate::window::DuplicateHit;

pub use progress::{format_hms, ProgressEvent, ProgressSink};
pub use state::{CancellationFlag, RunCounters, RunPhase, RunState};

/// How a run that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub counters: RunCounters,
    pub slides: Vec<SlideRecord>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(SourceError),
    #[error("slide storage failed: {0}")]
    Storage(StorageError),
}

/// Immutable per-run settings.
#[derive(Debug, Clone)]
pub struct SieveSettings {
    pub frame_skip: u64,
    pub check_order: CheckOrder,
    pub window_capacity: usize,
    pub output: OutputConfig,
}

impl SieveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_skip: config.sieve.frame_skip,
            check_order: config.sieve.check_order,
            window_capacity: config.duplicate.window_capacity,
            output: config.output.clone(),
        }
    }
}

enum Verdict {
    Duplicate(DuplicateHit),
    TrainedMatch,
    Accept,
}

/// Drives one run at a time over a frame source.
///
/// Owns the two rejection strategies and the run settings. Per-run state
/// (counters and recency window) is created fresh by each call to
/// [`Controller::run`]; the only thing shared with other threads is the
/// [`CancellationFlag`].
pub struct Controller<D, M> {
    detector: D,
    matcher: M,
    settings: SieveSettings,
    phase: RunPhase,
}

impl Controller<CorrelationDetector, DescriptorMatcher> {
    /// Correlation duplicate test plus ORB trained-match test, as configured.
    pub fn from_config(config: &Config, references: TrainedReferenceSet) -> Self {
        let detector =
            CorrelationDetector::new(config.duplicate.thumbnail_size, config.duplicate.threshold);
        let extractor = OrbExtractor::new((&config.trained).into());
        let matcher = DescriptorMatcher::new(
            extractor,
            references,
            config.trained.match_ratio,
            config.trained.max_match_distance,
        );
        Self::new(detector, matcher, SieveSettings::from_config(config))
    }

    /// Rescan the reference directory between runs.
    pub fn reload_references(&mut self, dir: &Path) -> Result<(), ReferenceError> {
        self.matcher.reload(dir)?;
        info!(references = self.matcher.references().len(), "trained references reloaded");
        Ok(())
    }
}

impl<D, M> Controller<D, M>
where
    D: DuplicateDetector,
    M: ReferenceMatcher,
{
    pub fn new(detector: D, matcher: M, settings: SieveSettings) -> Self {
        Self {
            detector,
            matcher,
            settings,
            phase: RunPhase::Idle,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, to: RunPhase, reason: &str) {
        info!("{}→{}: {}", self.phase, to, reason);
        self.phase = to;
    }

    /// Run the sampling loop over the source produced by `open` until it is
    /// exhausted or `cancel` is set.
    ///
    /// A source that cannot be opened fails the run before any counter moves
    /// or any progress event is sent.
    pub fn run<S, F, P>(
        &mut self,
        open: F,
        cancel: &CancellationFlag,
        progress: &mut P,
    ) -> Result<RunReport, RunError>
    where
        F: FnOnce() -> Result<S, SourceError>,
        S: FrameSource,
        P: ProgressSink + ?Sized,
    {
        let mut source = match open() {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "failed to open frame source");
                self.transition(RunPhase::Failed, "source unavailable");
                return Err(RunError::SourceUnavailable(e));
            }
        };

        let output = &self.settings.output;
        let mut store = match SlideStore::new(&output.dir, &output.prefix, output.digits) {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "failed to prepare slide store");
                self.transition(RunPhase::Failed, "output unavailable");
                return Err(RunError::Storage(e));
            }
        };

        let frames_total = source.total_frames();
        let stride = self.settings.frame_skip.max(1);
        info!(
            frames_total = ?frames_total,
            frame_skip = stride,
            window_capacity = self.settings.window_capacity,
            detector = self.detector.name(),
            matcher = self.matcher.name(),
            "starting run"
        );
        self.transition(RunPhase::Running, "source opened");

        let started = Instant::now();
        let mut state = RunState::new(self.settings.window_capacity);
        let mut slides = Vec::new();

        let status = loop {
            if cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break RunStatus::Completed,
                Err(e) => {
                    warn!(
                        error = %e,
                        frames = state.counters.frame_count,
                        "frame source failed mid-stream, ending run"
                    );
                    break RunStatus::Completed;
                }
            };

            let position = state.counters.frame_count;
            state.counters.frame_count += 1;
            if position % stride != 0 {
                continue;
            }
            state.counters.sampled_count += 1;

            match self.evaluate(&mut state, &mut store, frame) {
                Ok(Some(record)) => slides.push(record),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, counters = ?state.counters, "failed to store slide");
                    self.transition(RunPhase::Failed, "slide storage failed");
                    return Err(RunError::Storage(e));
                }
            }

            progress.report(ProgressEvent::new(
                state.counters,
                frames_total,
                started.elapsed(),
            ));
        };

        // Release the decoder before reporting.
        drop(source);

        let counters = state.counters;
        match status {
            RunStatus::Completed => self.transition(RunPhase::Completed, "end of stream"),
            RunStatus::Cancelled => self.transition(RunPhase::Cancelled, "cancellation requested"),
        }
        info!(
            frames = counters.frame_count,
            sampled = counters.sampled_count,
            saved = counters.saved_count,
            duplicates = counters.duplicate_count,
            trained_matches = counters.trained_match_count,
            elapsed = %format_hms(Some(started.elapsed())),
            "run finished"
        );

        Ok(RunReport {
            status,
            counters,
            slides,
        })
    }

    /// Classify one sampled frame and apply the outcome. Returns the stored
    /// slide when the frame was accepted.
    fn evaluate(
        &self,
        state: &mut RunState<D::Signature>,
        store: &mut SlideStore,
        frame: Frame,
    ) -> Result<Option<SlideRecord>, StorageError> {
        let signature = self.detector.signature(&frame);

        let verdict = match self.settings.check_order {
            CheckOrder::DuplicateFirst => {
                if let Some(hit) = state.window.find_duplicate(&self.detector, &signature) {
                    Verdict::Duplicate(hit)
                } else if self.matcher.matches(&frame) {
                    Verdict::TrainedMatch
                } else {
                    Verdict::Accept
                }
            }
            CheckOrder::TrainedFirst => {
                if self.matcher.matches(&frame) {
                    Verdict::TrainedMatch
                } else if let Some(hit) = state.window.find_duplicate(&self.detector, &signature) {
                    Verdict::Duplicate(hit)
                } else {
                    Verdict::Accept
                }
            }
        };

        match verdict {
            Verdict::Duplicate(hit) => {
                state.counters.duplicate_count += 1;
                debug!(
                    frame = frame.index,
                    of = hit.frame_index,
                    "duplicate of recent slide"
                );
                Ok(None)
            }
            Verdict::TrainedMatch => {
                state.counters.trained_match_count += 1;
                debug!(frame = frame.index, "matches trained reference");
                Ok(None)
            }
            Verdict::Accept => {
                let record = store.put_slide(&frame)?;
                state.counters.saved_count += 1;
                info!(
                    frame = frame.index,
                    file = record.file_name,
                    saved = state.counters.saved_count,
                    "new slide"
                );
                state.window.push(frame, signature);
                Ok(Some(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use slide_sieve_producer::MemorySource;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("slide-sieve-run-{}-{n}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn gradient(horizontal: bool) -> RgbImage {
        RgbImage::from_fn(320, 240, |x, y| {
            let v = (if horizontal { x * 255 / 319 } else { y * 255 / 239 }) as u8;
            Rgb([v, v, v])
        })
    }

    fn solid(v: u8) -> RgbImage {
        RgbImage::from_pixel(64, 48, Rgb([v, v, v]))
    }

    fn config(dir: &std::path::Path, frame_skip: u64, threshold: f64) -> Config {
        let mut config = Config::default();
        config.sieve.frame_skip = frame_skip;
        config.duplicate.threshold = threshold;
        config.output.dir = dir.join("unique_slides");
        config.trained.reference_dir = dir.join("trainer");
        config
    }

    /// Matches every frame from a given source index on.
    struct FromIndexMatcher(u64);

    impl ReferenceMatcher for FromIndexMatcher {
        fn matches(&self, frame: &Frame) -> bool {
            frame.index >= self.0
        }
    }

    fn controller_with<M: ReferenceMatcher>(
        config: &Config,
        matcher: M,
    ) -> Controller<CorrelationDetector, M> {
        let detector =
            CorrelationDetector::new(config.duplicate.thumbnail_size, config.duplicate.threshold);
        Controller::new(detector, matcher, SieveSettings::from_config(config))
    }

    /// Cancels the run once it has seen `after` events.
    struct CancelAfter {
        flag: CancellationFlag,
        after: usize,
        events: Vec<ProgressEvent>,
    }

    impl ProgressSink for CancelAfter {
        fn report(&mut self, event: ProgressEvent) {
            self.events.push(event);
            if self.events.len() == self.after {
                self.flag.cancel();
            }
        }
    }

    /// Yields `frames` and then a decode error.
    struct FailingSource {
        inner: MemorySource,
    }

    impl FrameSource for FailingSource {
        fn total_frames(&self) -> Option<u64> {
            None
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            match self.inner.next_frame()? {
                Some(frame) => Ok(Some(frame)),
                None => Err(SourceError::Decode {
                    index: 99,
                    reason: "corrupt packet".into(),
                }),
            }
        }
    }

    #[test]
    fn two_scenes_end_to_end() {
        let dir = scratch_dir();
        let config = config(&dir, 10, 0.98);
        let frames: Vec<RgbImage> = (0..100).map(|i| gradient(i < 50)).collect();

        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let mut events = Vec::new();
        let report = controller
            .run(|| Ok(MemorySource::new(frames)), &CancellationFlag::new(), &mut events)
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(controller.phase(), RunPhase::Completed);
        assert_eq!(report.counters.frame_count, 100);
        assert_eq!(report.counters.sampled_count, 10);
        assert_eq!(report.counters.saved_count, 2);
        assert_eq!(report.counters.duplicate_count, 8);
        assert_eq!(report.counters.trained_match_count, 0);
        assert_eq!(events.len(), 10);

        let taken: Vec<(u64, &str)> = report
            .slides
            .iter()
            .map(|s| (s.frame_index, s.file_name.as_str()))
            .collect();
        assert_eq!(taken, vec![(0, "slide_00000.jpg"), (50, "slide_00001.jpg")]);
        assert!(config.output.dir.join("slide_00001.jpg").is_file());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn sampled_count_follows_stride() {
        let dir = scratch_dir();
        let config = config(&dir, 10, 0.98);
        let frames: Vec<RgbImage> = (0..95).map(|i| solid((i / 20 * 40) as u8)).collect();

        let mut controller = controller_with(&config, FromIndexMatcher(60));
        let report = controller
            .run(|| Ok(MemorySource::new(frames)), &CancellationFlag::new(), &mut ())
            .unwrap();

        let c = report.counters;
        assert_eq!(c.frame_count, 95);
        assert_eq!(c.sampled_count, 10);
        assert_eq!(c.sampled_count, c.frame_count.div_ceil(10));
        assert!(c.is_consistent());
        assert!(c.trained_match_count > 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn identical_consecutive_frames_at_threshold_one() {
        let dir = scratch_dir();
        let config = config(&dir, 1, 1.0);
        let image = gradient(true);

        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let report = controller
            .run(
                || Ok(MemorySource::new(vec![image.clone(), image])),
                &CancellationFlag::new(),
                &mut (),
            )
            .unwrap();

        assert_eq!(report.counters.saved_count, 1);
        assert_eq!(report.counters.duplicate_count, 1);
        assert_eq!(report.slides[0].frame_index, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cancellation_stops_reading_and_reporting() {
        let dir = scratch_dir();
        let config = config(&dir, 10, 0.98);
        let frames: Vec<RgbImage> = (0..100).map(|i| gradient(i < 50)).collect();

        let flag = CancellationFlag::new();
        let mut sink = CancelAfter {
            flag: flag.clone(),
            after: 2,
            events: Vec::new(),
        };
        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let report = controller
            .run(|| Ok(MemorySource::new(frames)), &flag, &mut sink)
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(controller.phase(), RunPhase::Cancelled);
        assert_eq!(sink.events.len(), 2);
        let last = sink.events.last().unwrap();
        assert_eq!(report.counters, last.counters);
        assert_eq!(report.counters.frame_count, 11);
        assert_eq!(report.counters.sampled_count, 2);
        assert!(report.counters.is_consistent());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cancelled_before_start_reads_nothing() {
        let dir = scratch_dir();
        let config = config(&dir, 1, 0.98);
        let flag = CancellationFlag::new();
        flag.cancel();

        let mut events = Vec::new();
        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let report = controller
            .run(|| Ok(MemorySource::new(vec![solid(1)])), &flag, &mut events)
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.counters, RunCounters::default());
        assert!(events.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unavailable_source_fails_without_progress() {
        let dir = scratch_dir();
        let config = config(&dir, 10, 0.98);
        let mut events = Vec::new();

        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let result = controller.run(
            || -> Result<MemorySource, SourceError> {
                Err(SourceError::NotFound("video.mp4".into()))
            },
            &CancellationFlag::new(),
            &mut events,
        );

        assert!(matches!(result, Err(RunError::SourceUnavailable(_))));
        assert_eq!(controller.phase(), RunPhase::Failed);
        assert!(events.is_empty());
        assert!(!config.output.dir.exists());
    }

    #[test]
    fn mid_stream_error_completes_the_run() {
        let dir = scratch_dir();
        let config = config(&dir, 1, 0.98);
        let source = FailingSource {
            inner: MemorySource::new(vec![solid(10), solid(10), solid(200)]),
        };

        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let report = controller
            .run(|| Ok(source), &CancellationFlag::new(), &mut ())
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.counters.frame_count, 3);
        assert_eq!(report.counters.saved_count, 2);
        assert_eq!(report.counters.duplicate_count, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn check_order_decides_overlapping_verdicts() {
        let frames = || vec![solid(80), solid(80)];

        let dir = scratch_dir();
        let config = config(&dir, 1, 0.98);
        let mut controller = controller_with(&config, FromIndexMatcher(1));
        let report = controller
            .run(|| Ok(MemorySource::new(frames())), &CancellationFlag::new(), &mut ())
            .unwrap();
        assert_eq!(report.counters.duplicate_count, 1);
        assert_eq!(report.counters.trained_match_count, 0);

        let mut trained_first = config.clone();
        trained_first.sieve.check_order = CheckOrder::TrainedFirst;
        let mut controller = controller_with(&trained_first, FromIndexMatcher(1));
        let report = controller
            .run(|| Ok(MemorySource::new(frames())), &CancellationFlag::new(), &mut ())
            .unwrap();
        assert_eq!(report.counters.duplicate_count, 0);
        assert_eq!(report.counters.trained_match_count, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn low_feature_reference_never_suppresses() {
        let dir = scratch_dir();
        let config = config(&dir, 1, 0.98);
        std::fs::create_dir_all(&config.trained.reference_dir).unwrap();
        let blank = RgbImage::from_pixel(800, 600, Rgb([250, 250, 250]));
        blank.save(config.trained.reference_dir.join("blank.png")).unwrap();

        let extractor = OrbExtractor::new((&config.trained).into());
        let references =
            TrainedReferenceSet::load(&config.trained.reference_dir, &extractor).unwrap();
        assert!(references.is_empty());

        let mut controller = Controller::from_config(&config, references);
        let report = controller
            .run(|| Ok(MemorySource::new(vec![blank])), &CancellationFlag::new(), &mut ())
            .unwrap();
        assert_eq!(report.counters.saved_count, 1);
        assert_eq!(report.counters.trained_match_count, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn window_only_holds_accepted_frames() {
        let dir = scratch_dir();
        let mut config = config(&dir, 1, 0.98);
        config.duplicate.window_capacity = 2;
        // 10, 20, 30 accepted; 10 has left the two-slot window by the time it returns.
        let frames = vec![solid(10), solid(20), solid(20), solid(30), solid(10)];

        let mut controller = controller_with(&config, FromIndexMatcher(u64::MAX));
        let report = controller
            .run(|| Ok(MemorySource::new(frames)), &CancellationFlag::new(), &mut ())
            .unwrap();

        assert_eq!(report.counters.saved_count, 4);
        assert_eq!(report.counters.duplicate_count, 1);
        let accepted: Vec<u64> = report.slides.iter().map(|s| s.frame_index).collect();
        assert_eq!(accepted, vec![0, 1, 3, 4]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unwritable_output_fails_the_run() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = config(&dir, 1, 0.98);
        config.output.dir = dir.join("occupied");
        std::fs::write(&config.output.dir, b"a file, not a directory").unwrap();

        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let result = controller.run(
            || Ok(MemorySource::new(vec![solid(1)])),
            &CancellationFlag::new(),
            &mut (),
        );
        assert!(matches!(result, Err(RunError::Storage(_))));
        assert_eq!(controller.phase(), RunPhase::Failed);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_total_reports_no_rate_or_eta() {
        let dir = scratch_dir();
        let config = config(&dir, 2, 0.98);
        let frames: Vec<RgbImage> = (0..12).map(|i| solid(i * 20)).collect();

        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let mut events = Vec::new();
        let report = controller
            .run(
                || Ok(MemorySource::new(frames).without_total()),
                &CancellationFlag::new(),
                &mut events,
            )
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(events.len(), 6);
        for event in &events {
            assert_eq!(event.frames_total, None);
            assert_eq!(event.rate, None);
            assert_eq!(event.remaining, None);
            assert_eq!(event.percent(), None);
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reloaded_references_apply_to_the_next_run() {
        let dir = scratch_dir();
        let config = config(&dir, 1, 0.98);
        let overlay = crate::filter::orb::tests::blocks(800, 600, 24, 5);

        let mut controller = Controller::from_config(&config, TrainedReferenceSet::empty());
        let first = controller
            .run(
                || Ok(MemorySource::new(vec![overlay.clone()])),
                &CancellationFlag::new(),
                &mut (),
            )
            .unwrap();
        assert_eq!(first.counters.saved_count, 1);

        std::fs::create_dir_all(&config.trained.reference_dir).unwrap();
        overlay.save(config.trained.reference_dir.join("overlay.png")).unwrap();
        controller.reload_references(&config.trained.reference_dir).unwrap();

        // Each run starts with an empty window, so only the matcher can reject it.
        let second = controller
            .run(|| Ok(MemorySource::new(vec![overlay])), &CancellationFlag::new(), &mut ())
            .unwrap();
        assert_eq!(second.counters.saved_count, 0);
        assert_eq!(second.counters.trained_match_count, 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
