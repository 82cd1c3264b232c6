//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Encoder executable (default `ffmpeg` from PATH)
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// Probe executable (default `ffprobe` from PATH)
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Ceiling for a single probe invocation
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_probe_timeout_secs() -> u64 {
    60
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Encoder invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Renditions encoded in parallel within one job (0 = auto-derive)
    #[serde(default)]
    pub max_parallel_encodes: u32,
    /// Threads handed to each encoder process (0 = auto-derive)
    #[serde(default)]
    pub threads_per_encode: u32,
    /// Ceiling for one rendition encode, in seconds
    #[serde(default = "default_encode_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
}

fn default_encode_timeout_secs() -> u64 {
    4 * 60 * 60
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            max_parallel_encodes: 0,
            threads_per_encode: 0,
            timeout_secs: default_encode_timeout_secs(),
            video_codec: default_video_codec(),
            preset: default_preset(),
            audio_codec: default_audio_codec(),
        }
    }
}

/// HLS segmenting settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HlsConfig {
    /// Target segment duration in seconds
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,
    /// Allowed deviation of a segment from the target duration
    #[serde(default = "default_duration_tolerance_secs")]
    pub duration_tolerance_secs: f64,
}

fn default_segment_duration_secs() -> u32 {
    6
}

fn default_duration_tolerance_secs() -> f64 {
    1.0
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: default_segment_duration_secs(),
            duration_tolerance_secs: default_duration_tolerance_secs(),
        }
    }
}

/// Published tree and source retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root of the published asset tree
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Keep the uploaded source after a successful publish
    #[serde(default = "default_retain_original")]
    pub retain_original: bool,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("videos")
}

fn default_retain_original() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            retain_original: default_retain_original(),
        }
    }
}

/// Thumbnail extraction settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThumbnailConfig {
    /// Fraction of the known duration at which the frame is taken
    #[serde(default = "default_position_fraction")]
    pub position_fraction: f64,
    /// Offset used when the duration is unknown
    #[serde(default = "default_fallback_offset_secs")]
    pub fallback_offset_secs: f64,
    /// Distance kept from the end of the video
    #[serde(default = "default_end_margin_secs")]
    pub end_margin_secs: f64,
    #[serde(default = "default_thumbnail_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_position_fraction() -> f64 {
    0.1
}

fn default_fallback_offset_secs() -> f64 {
    5.0
}

fn default_end_margin_secs() -> f64 {
    0.5
}

fn default_thumbnail_timeout_secs() -> u64 {
    60
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            position_fraction: default_position_fraction(),
            fallback_offset_secs: default_fallback_offset_secs(),
            end_margin_secs: default_end_margin_secs(),
            timeout_secs: default_thumbnail_timeout_secs(),
        }
    }
}

/// One candidate tier of the rendition ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LadderTier {
    pub height: u32,
    pub video_kbps: u32,
    pub audio_kbps: u32,
    /// Directory and display label; `<height>p` when omitted
    #[serde(default)]
    pub label: Option<String>,
}

impl LadderTier {
    pub fn new(height: u32, video_kbps: u32, audio_kbps: u32) -> Self {
        Self {
            height,
            video_kbps,
            audio_kbps,
            label: None,
        }
    }

    /// Label used for the rendition directory name
    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}p", self.height))
    }
}

/// Whether `label` can name a rendition directory: ASCII letters, digits,
/// `-` and `_`, not starting with `.` (hidden directories are never scanned).
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Default ladder: 240p through 1080p
pub fn default_ladder() -> Vec<LadderTier> {
    vec![
        LadderTier::new(240, 400, 64),
        LadderTier::new(360, 800, 96),
        LadderTier::new(480, 1400, 128),
        LadderTier::new(720, 2800, 128),
        LadderTier::new(1080, 5000, 192),
    ]
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub hls: HlsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
    #[serde(default = "default_ladder")]
    pub ladder: Vec<LadderTier>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tools: ToolsConfig::default(),
            cpu: CpuConfig::default(),
            encode: EncodeConfig::default(),
            hls: HlsConfig::default(),
            storage: StorageConfig::default(),
            thumbnail: ThumbnailConfig::default(),
            ladder: default_ladder(),
        }
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match env::var(key).ok()?.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - HLSFORGE_FFMPEG -> tools.ffmpeg
    /// - HLSFORGE_FFPROBE -> tools.ffprobe
    /// - HLSFORGE_OUTPUT_ROOT -> storage.output_root
    /// - HLSFORGE_RETAIN_ORIGINAL -> storage.retain_original
    /// - HLSFORGE_SEGMENT_SECS -> hls.segment_duration_secs
    /// - HLSFORGE_MAX_PARALLEL_ENCODES -> encode.max_parallel_encodes
    /// - HLSFORGE_ENCODE_TIMEOUT_SECS -> encode.timeout_secs
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - CPU_TARGET_UTILIZATION -> cpu.target_cpu_utilization
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("HLSFORGE_FFMPEG") {
            self.tools.ffmpeg = PathBuf::from(val);
        }
        if let Ok(val) = env::var("HLSFORGE_FFPROBE") {
            self.tools.ffprobe = PathBuf::from(val);
        }
        if let Ok(val) = env::var("HLSFORGE_OUTPUT_ROOT") {
            self.storage.output_root = PathBuf::from(val);
        }
        if let Some(retain) = env_bool("HLSFORGE_RETAIN_ORIGINAL") {
            self.storage.retain_original = retain;
        }
        if let Some(secs) = env_value::<u32>("HLSFORGE_SEGMENT_SECS") {
            self.hls.segment_duration_secs = secs;
        }
        if let Some(encodes) = env_value::<u32>("HLSFORGE_MAX_PARALLEL_ENCODES") {
            self.encode.max_parallel_encodes = encodes;
        }
        if let Some(secs) = env_value::<u64>("HLSFORGE_ENCODE_TIMEOUT_SECS") {
            self.encode.timeout_secs = secs;
        }
        if let Some(cores) = env_value::<u32>("CPU_LOGICAL_CORES") {
            self.cpu.logical_cores = Some(cores);
        }
        if let Some(util) = env_value::<f32>("CPU_TARGET_UTILIZATION") {
            self.cpu.target_cpu_utilization = util;
        }
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hls.segment_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "hls.segment_duration_secs must be at least 1".to_string(),
            ));
        }
        if self.hls.duration_tolerance_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "hls.duration_tolerance_secs must not be negative".to_string(),
            ));
        }
        if let Some(tier) = self
            .ladder
            .iter()
            .find(|t| t.height == 0 || t.video_kbps == 0)
        {
            return Err(ConfigError::Invalid(format!(
                "ladder tier {} has a zero height or video bitrate",
                tier.label()
            )));
        }
        let mut labels = HashSet::new();
        for tier in &self.ladder {
            let label = tier.label();
            if !is_valid_label(&label) {
                return Err(ConfigError::Invalid(format!(
                    "ladder label {:?} is not a plain directory name",
                    label
                )));
            }
            if !labels.insert(label.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "ladder label {:?} is used by more than one tier",
                    label
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.thumbnail.position_fraction) {
            return Err(ConfigError::Invalid(format!(
                "thumbnail.position_fraction {} is outside [0, 1]",
                self.thumbnail.position_fraction
            )));
        }
        if self.encode.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "encode.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
