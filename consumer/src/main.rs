use slide_sieve::filter::{OrbExtractor, TrainedReferenceSet};
use slide_sieve::sieve::format_hms;
use slide_sieve::storage::{write_manifest, RunManifest};
use slide_sieve::{CancellationFlag, Controller, ProgressEvent, RunStatus};
use slide_sieve_common::config::{Config, SourceKind};
use slide_sieve_producer::{check_ffmpeg_available, open_source};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "slide-sieve.toml";

/// Sampled frames between progress lines when the total is unknown.
const UNKNOWN_TOTAL_REPORT_EVERY: u64 = 100;

#[tokio::main]
async fn main() {
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match load_config(explicit_path.as_deref()) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        source = %config.source.path.display(),
        frame_skip = config.sieve.frame_skip,
        check_order = ?config.sieve.check_order,
        duplicate_threshold = config.duplicate.threshold,
        window_capacity = config.duplicate.window_capacity,
        match_ratio = config.trained.match_ratio,
        max_match_distance = config.trained.max_match_distance,
        min_descriptors = config.trained.min_descriptors,
        reference_dir = %config.trained.reference_dir.display(),
        output_dir = %config.output.dir.display(),
        "starting slide-sieve"
    );

    // Decoding will fail without ffmpeg.
    if config.source.kind == SourceKind::Video {
        let _ = tokio::task::spawn_blocking(check_ffmpeg_available).await;
    }

    let extractor = OrbExtractor::new((&config.trained).into());
    let reference_dir = config.trained.reference_dir.clone();
    let references = match tokio::task::spawn_blocking(move || {
        TrainedReferenceSet::load(&reference_dir, &extractor)
    })
    .await
    {
        Ok(Ok(set)) => set,
        Ok(Err(e)) => {
            error!(error = %e, "failed to load trained reference set");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "reference loading task panicked");
            std::process::exit(1);
        }
    };

    let cancel = CancellationFlag::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            interrupt.cancel();
        }
        // A second interrupt abandons a run stuck in a frame read.
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt received, exiting");
            std::process::exit(130);
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report_progress(rx));

    let started_at = chrono::Utc::now();
    let run_config = config.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut progress = tx;
        let mut controller = Controller::from_config(&run_config, references);
        controller.run(|| open_source(&run_config.source), &cancel, &mut progress)
    })
    .await;

    // The sender went away with the run task, so the reporter drains and exits.
    let _ = reporter.await;

    let report = match outcome {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            error!(error = %e, "run failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "run task panicked");
            std::process::exit(1);
        }
    };

    if config.output.manifest {
        let manifest = RunManifest {
            status: report.status,
            started_at: started_at.to_rfc3339(),
            counters: report.counters,
            slides: &report.slides,
        };
        if let Err(e) = write_manifest(&config.output.dir, &manifest) {
            warn!(error = %e, "failed to write run manifest");
        }
    }

    let c = report.counters;
    match report.status {
        RunStatus::Completed => info!(
            saved = c.saved_count,
            duplicates = c.duplicate_count,
            trained_matches = c.trained_match_count,
            sampled = c.sampled_count,
            frames = c.frame_count,
            output_dir = %config.output.dir.display(),
            "extraction complete"
        ),
        RunStatus::Cancelled => info!(
            saved = c.saved_count,
            frames = c.frame_count,
            output_dir = %config.output.dir.display(),
            "extraction cancelled; slides saved so far are kept"
        ),
    }
}

/// An explicitly named config must load. The default file is optional.
fn load_config(explicit: Option<&Path>) -> Result<Config, String> {
    let path = match explicit {
        Some(path) => path,
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if !default.exists() {
                return Ok(Config::default());
            }
            default
        }
    };
    Config::load(path).map_err(|e| format!("Failed to load config from {}: {e}", path.display()))
}

/// Log progress at most once per whole percent, or every
/// `UNKNOWN_TOTAL_REPORT_EVERY` sampled frames when the total is unknown.
async fn report_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
    let mut last_percent: Option<u64> = None;
    while let Some(event) = rx.recv().await {
        let percent = event.percent().map(|p| p.floor() as u64);
        let due = match percent {
            Some(p) => last_percent != Some(p),
            None => event.counters.sampled_count % UNKNOWN_TOTAL_REPORT_EVERY == 1,
        };
        if !due {
            continue;
        }
        last_percent = percent;

        info!(
            percent = ?percent,
            frames = event.counters.frame_count,
            frames_total = ?event.frames_total,
            saved = event.counters.saved_count,
            duplicates = event.counters.duplicate_count,
            trained_matches = event.counters.trained_match_count,
            elapsed = %format_hms(Some(event.elapsed)),
            remaining = %format_hms(event.remaining),
            rate = ?event.rate,
            "progress"
        );
    }
}
