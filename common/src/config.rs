use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Upper bound on either side of the descriptor analysis frame.
pub const MAX_ANALYSIS_SIDE: u32 = 4096;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sieve: SieveConfig,
    #[serde(default)]
    pub duplicate: DuplicateConfig,
    #[serde(default)]
    pub trained: TrainedConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// A video file decoded through ffmpeg.
    Video,
    /// A directory of still images, one frame per file.
    Images,
}

/// Which of the two rejection tests runs first when a frame could fail both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckOrder {
    DuplicateFirst,
    TrainedFirst,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SieveConfig {
    /// Only every `frame_skip`-th frame is evaluated.
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,
    #[serde(default = "default_check_order")]
    pub check_order: CheckOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuplicateConfig {
    #[serde(default = "default_duplicate_threshold")]
    pub threshold: f64,
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainedConfig {
    #[serde(default = "default_reference_dir")]
    pub reference_dir: PathBuf,
    #[serde(default = "default_match_ratio")]
    pub match_ratio: f64,
    /// Largest Hamming distance a mutual nearest pair may have and still
    /// count as a match. 256 accepts every mutual pair.
    #[serde(default = "default_max_match_distance")]
    pub max_match_distance: u32,
    #[serde(default = "default_min_descriptors")]
    pub min_descriptors: usize,
    #[serde(default = "default_max_features")]
    pub max_features: usize,
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: u8,
    #[serde(default = "default_analysis_width")]
    pub analysis_width: u32,
    #[serde(default = "default_analysis_height")]
    pub analysis_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_slide_prefix")]
    pub prefix: String,
    #[serde(default = "default_slide_digits")]
    pub digits: usize,
    /// Write `manifest.json` next to the slides when the run ends.
    #[serde(default = "default_manifest")]
    pub manifest: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            path: default_source_path(),
        }
    }
}

impl Default for SieveConfig {
    fn default() -> Self {
        Self {
            frame_skip: default_frame_skip(),
            check_order: default_check_order(),
        }
    }
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            threshold: default_duplicate_threshold(),
            window_capacity: default_window_capacity(),
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

impl Default for TrainedConfig {
    fn default() -> Self {
        Self {
            reference_dir: default_reference_dir(),
            match_ratio: default_match_ratio(),
            max_match_distance: default_max_match_distance(),
            min_descriptors: default_min_descriptors(),
            max_features: default_max_features(),
            fast_threshold: default_fast_threshold(),
            analysis_width: default_analysis_width(),
            analysis_height: default_analysis_height(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            prefix: default_slide_prefix(),
            digits: default_slide_digits(),
            manifest: default_manifest(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sieve.frame_skip == 0 {
            return Err(ConfigError::Invalid("sieve.frame_skip must be at least 1".into()));
        }
        check_unit_interval("duplicate.threshold", self.duplicate.threshold)?;
        check_unit_interval("trained.match_ratio", self.trained.match_ratio)?;
        if self.duplicate.window_capacity == 0 {
            return Err(ConfigError::Invalid(
                "duplicate.window_capacity must be at least 1".into(),
            ));
        }
        if self.duplicate.thumbnail_size == 0 {
            return Err(ConfigError::Invalid(
                "duplicate.thumbnail_size must be at least 1".into(),
            ));
        }
        if self.trained.min_descriptors == 0 {
            return Err(ConfigError::Invalid(
                "trained.min_descriptors must be at least 1".into(),
            ));
        }
        if self.trained.max_match_distance > 256 {
            return Err(ConfigError::Invalid(format!(
                "trained.max_match_distance must be at most 256, got {}",
                self.trained.max_match_distance
            )));
        }
        if self.trained.analysis_width == 0 || self.trained.analysis_height == 0 {
            return Err(ConfigError::Invalid(
                "trained.analysis_width and trained.analysis_height must be non-zero".into(),
            ));
        }
        if self.trained.analysis_width > MAX_ANALYSIS_SIDE
            || self.trained.analysis_height > MAX_ANALYSIS_SIDE
        {
            return Err(ConfigError::Invalid(format!(
                "trained.analysis_width and trained.analysis_height must be at most {MAX_ANALYSIS_SIDE}"
            )));
        }
        if self.output.digits == 0 {
            return Err(ConfigError::Invalid("output.digits must be at least 1".into()));
        }
        Ok(())
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must be in (0, 1], got {value}"
        )))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_source_kind() -> SourceKind {
    SourceKind::Video
}
fn default_source_path() -> PathBuf {
    PathBuf::from("video.mp4")
}
fn default_frame_skip() -> u64 {
    30
}
fn default_check_order() -> CheckOrder {
    CheckOrder::DuplicateFirst
}
fn default_duplicate_threshold() -> f64 {
    0.98
}
fn default_window_capacity() -> usize {
    5
}
fn default_thumbnail_size() -> u32 {
    256
}
fn default_reference_dir() -> PathBuf {
    PathBuf::from("trainer")
}
fn default_match_ratio() -> f64 {
    0.25
}
fn default_max_match_distance() -> u32 {
    64
}
fn default_min_descriptors() -> usize {
    50
}
fn default_max_features() -> usize {
    2000
}
fn default_fast_threshold() -> u8 {
    5
}
fn default_analysis_width() -> u32 {
    800
}
fn default_analysis_height() -> u32 {
    600
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("unique_slides")
}
fn default_slide_prefix() -> String {
    "slide_".into()
}
fn default_slide_digits() -> usize {
    5
}
fn default_manifest() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}
