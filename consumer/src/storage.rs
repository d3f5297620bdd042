use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use slide_sieve_common::frame::Frame;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::sieve::keys::slide_file_name;
use crate::sieve::{RunCounters, RunStatus};

const JPEG_QUALITY: u8 = 100;
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create output directory: {0}")]
    CreateDir(String),
    #[error("failed to write slide: {0}")]
    Write(String),
    #[error("failed to encode slide: {0}")]
    Encode(String),
    #[error("failed to write manifest: {0}")]
    Manifest(String),
}

/// One accepted slide on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlideRecord {
    /// Position in acceptance order, starting at 0 each run.
    pub index: u64,
    /// Index of the source frame the slide was taken from.
    pub frame_index: u64,
    pub file_name: String,
}

/// Summary written next to the slides after a run.
#[derive(Debug, Serialize)]
pub struct RunManifest<'a> {
    pub status: RunStatus,
    pub started_at: String,
    pub counters: RunCounters,
    pub slides: &'a [SlideRecord],
}

/// Directory of sequentially numbered JPEG slides.
pub struct SlideStore {
    dir: PathBuf,
    prefix: String,
    digits: usize,
    next_index: u64,
}

impl SlideStore {
    /// Open `dir` for a new run, creating it if missing. Numbering starts at 0.
    pub fn new(dir: &Path, prefix: &str, digits: usize) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StorageError::CreateDir(format!("{}: {e}", dir.display())))?;
        info!(dir = %dir.display(), "slide store ready");
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            digits,
            next_index: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of slides written so far in this run.
    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    /// Encode `frame` at maximum JPEG quality under the next slide name.
    pub fn put_slide(&mut self, frame: &Frame) -> Result<SlideRecord, StorageError> {
        let file_name = slide_file_name(&self.prefix, self.next_index, self.digits);
        let path = self.dir.join(&file_name);

        let file = File::create(&path)
            .map_err(|e| StorageError::Write(format!("{}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
            .encode_image(&frame.image)
            .map_err(|e| StorageError::Encode(format!("{}: {e}", path.display())))?;
        writer
            .flush()
            .map_err(|e| StorageError::Write(format!("{}: {e}", path.display())))?;

        let record = SlideRecord {
            index: self.next_index,
            frame_index: frame.index,
            file_name,
        };
        self.next_index += 1;
        debug!(file = record.file_name, frame = frame.index, "stored slide");
        Ok(record)
    }
}

/// Write `manifest.json` into `dir`.
pub fn write_manifest(dir: &Path, manifest: &RunManifest<'_>) -> Result<PathBuf, StorageError> {
    let path = dir.join(MANIFEST_FILE);
    let json =
        serde_json::to_vec_pretty(manifest).map_err(|e| StorageError::Manifest(e.to_string()))?;
    std::fs::write(&path, json)
        .map_err(|e| StorageError::Manifest(format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), "manifest written");
    Ok(path)
}
