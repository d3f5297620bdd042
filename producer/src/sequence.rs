use slide_sieve_common::frame::Frame;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{FrameSource, SourceError};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// A directory of still images treated as consecutive frames, ordered by file name.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next_index: usize,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        if !dir.is_dir() {
            return Err(SourceError::NotFound(dir.display().to_string()));
        }

        let entries = std::fs::read_dir(dir)
            .map_err(|e| SourceError::Read(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        paths.sort();

        info!(dir = %dir.display(), frames = paths.len(), "opened image sequence");
        Ok(Self {
            paths,
            next_index: 0,
        })
    }
}

/// Whether the file has one of the recognized still-image extensions (case-insensitive).
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

impl FrameSource for ImageSequenceSource {
    fn total_frames(&self) -> Option<u64> {
        Some(self.paths.len() as u64)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.get(self.next_index) else {
            return Ok(None);
        };
        let index = self.next_index as u64;
        self.next_index += 1;

        let image = image::open(path).map_err(|e| SourceError::Decode {
            index,
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(Some(Frame::new(index, image.to_rgb8())))
    }
}
