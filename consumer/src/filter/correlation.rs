use slide_sieve_common::frame::Frame;

use super::traits::DuplicateDetector;

/// Downscaled intensity thumbnail with its first and second moments.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pixels: Vec<u8>,
    sum: u64,
    sum_sq: u64,
}

impl Thumbnail {
    pub fn from_pixels(pixels: Vec<u8>) -> Self {
        let sum = pixels.iter().map(|&p| p as u64).sum();
        let sum_sq = pixels.iter().map(|&p| (p as u64) * (p as u64)).sum();
        Self { pixels, sum, sum_sq }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Near-duplicate test by normalized cross-correlation of small thumbnails.
///
/// Algorithm:
/// 1. Convert to intensity, resize to (size x size)
/// 2. Pearson correlation of the two pixel vectors, in [-1, 1]
/// 3. Duplicate when the coefficient reaches the threshold
///
/// Invariant to uniform brightness and contrast changes, tolerant of mild
/// compression noise, and much cheaper than descriptor matching.
pub struct CorrelationDetector {
    size: u32,
    threshold: f64,
}

impl CorrelationDetector {
    pub fn new(size: u32, threshold: f64) -> Self {
        Self { size, threshold }
    }
}

impl DuplicateDetector for CorrelationDetector {
    type Signature = Thumbnail;

    fn signature(&self, frame: &Frame) -> Thumbnail {
        Thumbnail::from_pixels(frame.to_gray_resized(self.size, self.size).into_raw())
    }

    fn similarity(&self, a: &Thumbnail, b: &Thumbnail) -> f64 {
        correlation(a, b)
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn name(&self) -> &str {
        "correlation"
    }
}

/// Normalized cross-correlation coefficient of two equally sized thumbnails.
///
/// Sums are exact integers, so identical inputs score exactly 1.0. Flat
/// thumbnails have no structure to correlate: two flat thumbnails with the
/// same mean score 1.0, any other pairing with a flat side scores 0.0.
pub fn correlation(a: &Thumbnail, b: &Thumbnail) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    if a.pixels == b.pixels {
        return 1.0;
    }

    let n = a.len() as i128;
    let sum_ab: u64 = a
        .pixels
        .iter()
        .zip(&b.pixels)
        .map(|(&x, &y)| x as u64 * y as u64)
        .sum();

    let (sa, sb) = (a.sum as i128, b.sum as i128);
    let num = n * sum_ab as i128 - sa * sb;
    let var_a = n * a.sum_sq as i128 - sa * sa;
    let var_b = n * b.sum_sq as i128 - sb * sb;

    match (var_a == 0, var_b == 0) {
        (true, true) => {
            if sa == sb {
                1.0
            } else {
                0.0
            }
        }
        (true, false) | (false, true) => 0.0,
        (false, false) => {
            let denom = (var_a as f64).sqrt() * (var_b as f64).sqrt();
            (num as f64 / denom).clamp(-1.0, 1.0)
        }
    }
}
