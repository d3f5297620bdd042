use slide_sieve_common::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use super::matcher::{match_ratio, MatchError};
use super::orb::{DescriptorSet, OrbExtractor};
use super::traits::ReferenceMatcher;

const REFERENCE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("failed to create reference directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to read reference directory {0}: {1}")]
    ReadDir(String, std::io::Error),
}

/// Descriptor sets of known non-slide imagery, one per usable reference image.
#[derive(Debug, Clone, Default)]
pub struct TrainedReferenceSet {
    sets: Vec<DescriptorSet>,
    skipped: usize,
}

impl TrainedReferenceSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scan `dir` once, keeping every image that yields a descriptor set.
    ///
    /// A missing directory is created and gives an empty set. Images that fail
    /// to decode or have too few features are skipped.
    pub fn load(dir: &Path, extractor: &OrbExtractor) -> Result<Self, ReferenceError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .map_err(|e| ReferenceError::CreateDir(dir.display().to_string(), e))?;
            info!(dir = %dir.display(), "created empty reference directory");
            return Ok(Self::empty());
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| ReferenceError::ReadDir(dir.display().to_string(), e))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_reference_image(path))
            .collect();
        paths.sort();

        let mut set = Self::empty();
        for path in paths {
            let image = match image::open(&path) {
                Ok(image) => image.to_rgb8(),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable reference image");
                    set.skipped += 1;
                    continue;
                }
            };
            match extractor.extract(&Frame::new(0, image)) {
                Some(descriptors) => {
                    debug!(path = %path.display(), descriptors = descriptors.len(), "loaded reference image");
                    set.sets.push(descriptors);
                }
                None => {
                    debug!(path = %path.display(), "skipping reference image with too few features");
                    set.skipped += 1;
                }
            }
        }

        info!(
            dir = %dir.display(),
            references = set.len(),
            skipped = set.skipped,
            "trained reference set loaded"
        );
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DescriptorSet> {
        self.sets.iter()
    }

    #[cfg(test)]
    pub(crate) fn from_sets(sets: Vec<DescriptorSet>) -> Self {
        Self { sets, skipped: 0 }
    }
}

fn is_reference_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| REFERENCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Trained-match test: a frame matches when its descriptors agree with any
/// single reference at or above the ratio threshold. Only mutual pairs within
/// `max_distance` bits count toward the ratio.
pub struct DescriptorMatcher {
    extractor: OrbExtractor,
    references: TrainedReferenceSet,
    ratio_threshold: f64,
    max_distance: u32,
}

impl DescriptorMatcher {
    pub fn new(
        extractor: OrbExtractor,
        references: TrainedReferenceSet,
        ratio_threshold: f64,
        max_distance: u32,
    ) -> Self {
        Self {
            extractor,
            references,
            ratio_threshold,
            max_distance,
        }
    }

    pub fn references(&self) -> &TrainedReferenceSet {
        &self.references
    }

    /// Rebuild the reference set from `dir`, replacing the current one.
    pub fn reload(&mut self, dir: &Path) -> Result<(), ReferenceError> {
        self.references = TrainedReferenceSet::load(dir, &self.extractor)?;
        Ok(())
    }

    fn matches_any(&self, frame_index: u64, descriptors: &DescriptorSet) -> bool {
        for (i, reference) in self.references.iter().enumerate() {
            match match_ratio(descriptors, reference, self.max_distance) {
                Ok(ratio) if ratio >= self.ratio_threshold => {
                    debug!(
                        frame = frame_index,
                        reference = i,
                        ratio,
                        threshold = self.ratio_threshold,
                        "frame matches trained reference"
                    );
                    return true;
                }
                Ok(_) => {}
                Err(MatchError::EmptySet) => {
                    debug!(frame = frame_index, reference = i, "empty descriptor set, treating as no match");
                }
            }
        }
        false
    }
}

impl ReferenceMatcher for DescriptorMatcher {
    fn matches(&self, frame: &Frame) -> bool {
        if self.references.is_empty() {
            return false;
        }
        match self.extractor.extract(frame) {
            Some(descriptors) => self.matches_any(frame.index, &descriptors),
            None => false,
        }
    }

    fn name(&self) -> &str {
        "orb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::orb::tests::blocks;
    use crate::filter::orb::OrbConfig;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicU32, Ordering};

    const MAX_DISTANCE: u32 = 64;

    static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("slide-sieve-ref-{}-{n}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn extractor() -> OrbExtractor {
        OrbExtractor::new(OrbConfig::default())
    }

    fn matcher_with(extractor: OrbExtractor, references: TrainedReferenceSet) -> DescriptorMatcher {
        DescriptorMatcher::new(extractor, references, 0.25, MAX_DISTANCE)
    }

    /// Independent random pixels: dense in corners, unrelated to any block pattern.
    fn noise(width: u32, height: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        RgbImage::from_fn(width, height, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
    }

    #[test]
    fn missing_directory_is_created_empty() {
        let dir = scratch_dir().join("trainer");
        let set = TrainedReferenceSet::load(&dir, &extractor()).unwrap();
        assert!(set.is_empty());
        assert!(dir.is_dir());
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn low_feature_and_corrupt_images_are_skipped() {
        let dir = scratch_dir();
        blocks(800, 600, 24, 11).save(dir.join("overlay.png")).unwrap();
        RgbImage::from_pixel(320, 240, Rgb([90, 90, 90]))
            .save(dir.join("blank.png"))
            .unwrap();
        std::fs::write(dir.join("broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let set = TrainedReferenceSet::load(&dir, &extractor()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.skipped, 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn frame_matching_a_reference_is_suppressed() {
        let extractor = extractor();
        let overlay = blocks(800, 600, 24, 5);
        let reference = extractor.extract(&Frame::new(0, overlay.clone())).unwrap();
        let matcher = matcher_with(extractor, TrainedReferenceSet::from_sets(vec![reference]));

        assert!(matcher.matches(&Frame::new(40, overlay)));
    }

    #[test]
    fn unrelated_frame_is_not_a_match() {
        let extractor = extractor();
        let reference = extractor.extract(&Frame::new(0, blocks(800, 600, 24, 5))).unwrap();
        let unrelated = Frame::new(1, noise(800, 600, 9));
        // The frame must reach the ratio test rather than fail the feature floor.
        let descriptors = extractor.extract(&unrelated).unwrap();
        let ratio = match_ratio(&descriptors, &reference, MAX_DISTANCE).unwrap();
        assert!(ratio < 0.25, "unrelated ratio {ratio}");

        let matcher = matcher_with(extractor, TrainedReferenceSet::from_sets(vec![reference]));
        assert!(!matcher.matches(&unrelated));
    }

    #[test]
    fn empty_reference_set_never_matches() {
        let matcher = matcher_with(extractor(), TrainedReferenceSet::empty());
        assert!(!matcher.matches(&Frame::new(0, blocks(800, 600, 24, 5))));
    }

    #[test]
    fn reload_picks_up_new_references() {
        let dir = scratch_dir();
        let mut matcher = matcher_with(extractor(), TrainedReferenceSet::empty());
        blocks(800, 600, 24, 21).save(dir.join("bumper.png")).unwrap();

        matcher.reload(&dir).unwrap();
        assert_eq!(matcher.references().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
