//! ORB-style binary keypoint descriptors (oriented FAST + steered BRIEF).
//!
//! Tuned for slide imagery: a low FAST threshold so flat, text-heavy frames
//! still produce corners, and a generous feature budget.

use image::imageops::{self, FilterType};
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use slide_sieve_common::config::TrainedConfig;
use slide_sieve_common::frame::Frame;
use tracing::debug;

/// Keypoints closer than this to the border are discarded. Covers the
/// orientation disc and the rotated sampling pattern with its 5x5 boxes.
const EDGE: u32 = 20;
const HALF_PATCH: i32 = 15;
const PATTERN_RADIUS: i32 = 13;
const DESCRIPTOR_BITS: usize = 256;
const HARRIS_K: f64 = 0.04;
const HARRIS_BLOCK: i32 = 3;
const PATTERN_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Bresenham circle of radius 3 used by the FAST segment test, in order.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];
const FAST_ARC: usize = 9;

#[derive(Debug, Clone)]
pub struct OrbConfig {
    pub max_features: usize,
    pub fast_threshold: u8,
    pub n_levels: usize,
    pub scale_factor: f32,
    pub analysis_width: u32,
    pub analysis_height: u32,
    /// Extraction yielding fewer descriptors than this produces no set at all.
    pub min_descriptors: usize,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            max_features: 2000,
            fast_threshold: 5,
            n_levels: 8,
            scale_factor: 1.2,
            analysis_width: 800,
            analysis_height: 600,
            min_descriptors: 50,
        }
    }
}

impl From<&TrainedConfig> for OrbConfig {
    fn from(trained: &TrainedConfig) -> Self {
        Self {
            max_features: trained.max_features,
            fast_threshold: trained.fast_threshold,
            analysis_width: trained.analysis_width,
            analysis_height: trained.analysis_height,
            min_descriptors: trained.min_descriptors,
            ..Self::default()
        }
    }
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    fn set_bit(&mut self, bit: usize) {
        self.0[bit / 64] |= 1 << (bit % 64);
    }
}

/// Descriptors extracted from one image. Only ever built when extraction
/// reached the configured minimum count.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    descriptors: Vec<Descriptor>,
}

impl DescriptorSet {
    pub(crate) fn new(descriptors: Vec<Descriptor>) -> Self {
        Self { descriptors }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn as_slice(&self) -> &[Descriptor] {
        &self.descriptors
    }
}

#[derive(Debug, Clone, Copy)]
struct Keypoint {
    x: u32,
    y: u32,
    score: f64,
}

/// Point pair compared by one descriptor bit, offsets relative to the keypoint.
type TestPair = [(f32, f32); 2];

pub struct OrbExtractor {
    config: OrbConfig,
    pattern: Vec<TestPair>,
}

impl OrbExtractor {
    pub fn new(config: OrbConfig) -> Self {
        Self {
            config,
            pattern: sampling_pattern(PATTERN_SEED),
        }
    }

    /// Descriptors for a frame at the analysis resolution, or `None` when the
    /// frame has too little structure to be matched meaningfully.
    pub fn extract(&self, frame: &Frame) -> Option<DescriptorSet> {
        let gray = frame.to_gray_resized(self.config.analysis_width, self.config.analysis_height);
        self.extract_gray(&gray)
    }

    pub fn extract_gray(&self, gray: &GrayImage) -> Option<DescriptorSet> {
        let descriptors = self.detect_and_compute(gray);
        if descriptors.len() < self.config.min_descriptors {
            debug!(
                found = descriptors.len(),
                min = self.config.min_descriptors,
                "too few descriptors"
            );
            return None;
        }
        Some(DescriptorSet::new(descriptors))
    }

    fn detect_and_compute(&self, gray: &GrayImage) -> Vec<Descriptor> {
        let quotas = level_quotas(
            self.config.max_features,
            self.config.n_levels,
            self.config.scale_factor,
        );
        let mut descriptors = Vec::with_capacity(self.config.max_features);
        let mut scale = 1.0f32;

        for (level_index, quota) in quotas.into_iter().enumerate() {
            let width = (gray.width() as f32 / scale).round() as u32;
            let height = (gray.height() as f32 / scale).round() as u32;
            if width <= 2 * EDGE || height <= 2 * EDGE {
                break;
            }

            let level = if level_index == 0 {
                gray.clone()
            } else {
                imageops::resize(gray, width, height, FilterType::Triangle)
            };

            let keypoints = self.detect(&level, quota);
            if !keypoints.is_empty() {
                let integral = IntegralImage::new(&level);
                descriptors.extend(keypoints.iter().map(|kp| {
                    let angle = orientation(&level, kp);
                    self.describe(&integral, kp, angle)
                }));
            }

            scale *= self.config.scale_factor;
        }

        descriptors
    }

    /// FAST corners with non-maximum suppression, ranked by Harris response.
    fn detect(&self, image: &GrayImage, quota: usize) -> Vec<Keypoint> {
        if quota == 0 {
            return Vec::new();
        }

        let scores = fast_scores(image, self.config.fast_threshold);
        let mut corners = suppress_non_maxima(image.width(), image.height(), &scores);

        corners.sort_by(|a, b| b.score.total_cmp(&a.score));
        corners.truncate(quota * 2);

        for kp in &mut corners {
            kp.score = harris_response(image, kp.x as i32, kp.y as i32);
        }
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));
        corners.truncate(quota);
        corners
    }

    fn describe(&self, integral: &IntegralImage, kp: &Keypoint, angle: f32) -> Descriptor {
        let (sin, cos) = angle.sin_cos();
        let (cx, cy) = (kp.x as i32, kp.y as i32);
        let mut descriptor = Descriptor::default();

        for (bit, [(x1, y1), (x2, y2)]) in self.pattern.iter().enumerate() {
            let p1 = (
                cx + (cos * x1 - sin * y1).round() as i32,
                cy + (sin * x1 + cos * y1).round() as i32,
            );
            let p2 = (
                cx + (cos * x2 - sin * y2).round() as i32,
                cy + (sin * x2 + cos * y2).round() as i32,
            );
            if integral.box_sum(p1.0, p1.1, 2) < integral.box_sum(p2.0, p2.1, 2) {
                descriptor.set_bit(bit);
            }
        }
        descriptor
    }
}

/// Split `total` features across pyramid levels, geometrically decreasing
/// with the level area.
fn level_quotas(total: usize, levels: usize, scale_factor: f32) -> Vec<usize> {
    if levels == 0 {
        return Vec::new();
    }
    let factor = 1.0 / scale_factor as f64;
    let first = total as f64 * (1.0 - factor) / (1.0 - factor.powi(levels as i32));

    let mut quotas = Vec::with_capacity(levels);
    let mut assigned = 0usize;
    let mut desired = first;
    for _ in 0..levels - 1 {
        let n = (desired.round() as usize).min(total - assigned);
        quotas.push(n);
        assigned += n;
        desired *= factor;
    }
    quotas.push(total - assigned);
    quotas
}

/// FAST-9 corner scores; zero where the segment test fails or near the border.
fn fast_scores(image: &GrayImage, threshold: u8) -> Vec<u32> {
    let (width, height) = image.dimensions();
    let pixels = image.as_raw();
    let w = width as i32;
    let t = threshold as i32;
    let mut scores = vec![0u32; pixels.len()];

    if width <= 2 * EDGE || height <= 2 * EDGE {
        return scores;
    }

    for y in EDGE..height - EDGE {
        for x in EDGE..width - EDGE {
            let idx = (y * width + x) as usize;
            let p = pixels[idx] as i32;

            let mut ring = [0i32; 16];
            let (mut brighter, mut darker) = (0, 0);
            for (slot, &(dx, dy)) in ring.iter_mut().zip(CIRCLE.iter()) {
                let v = pixels[(idx as i32 + dy * w + dx) as usize] as i32;
                *slot = v - p;
                if v > p + t {
                    brighter += 1;
                } else if v < p - t {
                    darker += 1;
                }
            }
            if brighter < FAST_ARC && darker < FAST_ARC {
                continue;
            }

            if brighter >= FAST_ARC && has_arc(&ring, |d| d > t) {
                scores[idx] = ring.iter().filter(|&&d| d > t).map(|&d| (d - t) as u32).sum();
            } else if darker >= FAST_ARC && has_arc(&ring, |d| d < -t) {
                scores[idx] = ring.iter().filter(|&&d| d < -t).map(|&d| (-d - t) as u32).sum();
            }
        }
    }
    scores
}

/// Whether at least `FAST_ARC` contiguous ring entries (with wraparound) pass `test`.
fn has_arc(ring: &[i32; 16], test: impl Fn(i32) -> bool) -> bool {
    let mut run = 0;
    for i in 0..ring.len() + FAST_ARC - 1 {
        if test(ring[i % ring.len()]) {
            run += 1;
            if run >= FAST_ARC {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// 3x3 non-maximum suppression. On equal scores the earlier pixel in raster order wins.
fn suppress_non_maxima(width: u32, height: u32, scores: &[u32]) -> Vec<Keypoint> {
    let w = width as usize;
    let mut corners = Vec::new();
    if width < 3 || height < 3 {
        return corners;
    }

    for y in 1..height as usize - 1 {
        for x in 1..w - 1 {
            let idx = y * w + x;
            let s = scores[idx];
            if s == 0 {
                continue;
            }
            let mut is_max = true;
            'neighbours: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = (idx as i64 + dy as i64 * w as i64 + dx as i64) as usize;
                    let earlier = dy < 0 || (dy == 0 && dx < 0);
                    if scores[n] > s || (earlier && scores[n] == s) {
                        is_max = false;
                        break 'neighbours;
                    }
                }
            }
            if is_max {
                corners.push(Keypoint {
                    x: x as u32,
                    y: y as u32,
                    score: s as f64,
                });
            }
        }
    }
    corners
}

/// Harris corner response over a 7x7 block of central-difference gradients.
fn harris_response(image: &GrayImage, cx: i32, cy: i32) -> f64 {
    let px = |x: i32, y: i32| image.get_pixel(x as u32, y as u32).0[0] as f64;
    let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
    for y in cy - HARRIS_BLOCK..=cy + HARRIS_BLOCK {
        for x in cx - HARRIS_BLOCK..=cx + HARRIS_BLOCK {
            let ix = px(x + 1, y) - px(x - 1, y);
            let iy = px(x, y + 1) - px(x, y - 1);
            a += ix * ix;
            b += iy * iy;
            c += ix * iy;
        }
    }
    a * b - c * c - HARRIS_K * (a + b) * (a + b)
}

/// Keypoint angle from the intensity centroid of a disc around it.
fn orientation(image: &GrayImage, kp: &Keypoint) -> f32 {
    let (cx, cy) = (kp.x as i32, kp.y as i32);
    let (mut m01, mut m10) = (0i64, 0i64);
    for dy in -HALF_PATCH..=HALF_PATCH {
        for dx in -HALF_PATCH..=HALF_PATCH {
            if dx * dx + dy * dy > HALF_PATCH * HALF_PATCH {
                continue;
            }
            let v = image.get_pixel((cx + dx) as u32, (cy + dy) as u32).0[0] as i64;
            m10 += dx as i64 * v;
            m01 += dy as i64 * v;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

/// Summed-area table for constant-time box sums.
struct IntegralImage {
    width: usize,
    height: usize,
    sums: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let stride = width + 1;
        let mut sums = vec![0u64; stride * (height + 1)];
        let pixels = image.as_raw();
        for y in 0..height {
            let mut row = 0u64;
            for x in 0..width {
                row += pixels[y * width + x] as u64;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { width, height, sums }
    }

    /// Sum over the (2r+1)^2 box centred on (x, y), clamped to the image.
    fn box_sum(&self, x: i32, y: i32, r: i32) -> u64 {
        let clamp_x = |v: i32| v.clamp(0, self.width as i32) as usize;
        let clamp_y = |v: i32| v.clamp(0, self.height as i32) as usize;
        let (x0, x1) = (clamp_x(x - r), clamp_x(x + r + 1));
        let (y0, y1) = (clamp_y(y - r), clamp_y(y + r + 1));
        let stride = self.width + 1;
        self.sums[y1 * stride + x1] + self.sums[y0 * stride + x0]
            - self.sums[y0 * stride + x1]
            - self.sums[y1 * stride + x0]
    }
}

/// Fixed pseudo-random test pairs drawn from an isotropic Gaussian around
/// the keypoint and clipped to `PATTERN_RADIUS`. Deterministic, so
/// descriptors from different runs stay comparable.
fn sampling_pattern(seed: u64) -> Vec<TestPair> {
    let mut rng = StdRng::seed_from_u64(seed);
    let sigma = (2 * HALF_PATCH + 1) as f64 / 5.0;
    let limit = (PATTERN_RADIUS * PATTERN_RADIUS) as f64;

    let mut next_point = move || loop {
        let x: f64 = rng.sample::<f64, _>(StandardNormal) * sigma;
        let y: f64 = rng.sample::<f64, _>(StandardNormal) * sigma;
        let (x, y) = (x.round(), y.round());
        if x * x + y * y <= limit {
            return (x as f32, y as f32);
        }
    };

    let mut pattern = Vec::with_capacity(DESCRIPTOR_BITS);
    while pattern.len() < DESCRIPTOR_BITS {
        let a = next_point();
        let b = next_point();
        if a != b {
            pattern.push([a, b]);
        }
    }
    pattern
}
