use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hardware::HardwareTier;
use crate::job::EncodeSettings;

/// Configuration for a batch transcode run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Directory scanned for source media files
    pub input_directory: PathBuf,
    /// Directory transcoded files are written to (relative layout is mirrored)
    pub output_directory: PathBuf,
    /// File extensions accepted for transcoding (case-insensitive, with or without dot)
    pub file_extensions: Vec<String>,
    /// Requested video codec (aliases like "x265" or "avc" are accepted)
    pub video_codec: String,
    /// Codec to try on the hardware encoder when the requested one is unavailable
    pub fallback_codec: Option<String>,
    /// Target video bitrate in kbps; when unset the source bitrate is inherited
    pub video_bitrate_kbps: Option<u32>,
    /// Re-encode the first audio stream to AAC at this bitrate; when unset audio is copied
    pub audio_bitrate_kbps: Option<u32>,
    /// Constant-quality value used when no bitrate is known (CRF for software encoders)
    pub quality: Option<u8>,
    /// Encoder preset passed through as `-preset`
    pub encoder_preset: Option<String>,
    /// Number of jobs allowed to run concurrently
    pub max_workers: usize,
    /// Delete the source file once the output is verified
    pub delete_original: bool,
    /// Maximum allowed duration difference between input and output, in seconds
    pub duration_tolerance_secs: f64,
    /// Reject outputs whose video codec differs from the resolved codec
    pub enforce_codec: bool,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Skip GPU detection and use this tier
    pub hardware_tier: Option<HardwareTier>,
}

/// Configuration problems that must abort a run before any job starts
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("input directory does not exist: {0}")]
    MissingInputDirectory(PathBuf),
    #[error("output directory is not set")]
    MissingOutputDirectory,
    #[error("max_workers must be at least 1")]
    NoWorkers,
    #[error("duration tolerance must be a non-negative number, got {0}")]
    InvalidTolerance(f64),
    #[error("no file extensions configured")]
    NoExtensions,
    #[error("video codec is not set")]
    MissingCodec,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TranscodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            input_directory: PathBuf::from("media/trans_in"),
            output_directory: PathBuf::from("media/trans_out"),
            file_extensions: vec![
                "mkv".to_string(),
                "mp4".to_string(),
                "m4v".to_string(),
                "avi".to_string(),
                "mov".to_string(),
                "webm".to_string(),
            ],
            video_codec: "h264".to_string(),
            fallback_codec: None,
            video_bitrate_kbps: None,
            audio_bitrate_kbps: None,
            quality: None,
            encoder_preset: None,
            max_workers: 3,
            delete_original: false,
            duration_tolerance_secs: 1.0,
            enforce_codec: false,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            hardware_tier: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // JSON unless the extension says TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                log::warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        Ok(config)
    }

    /// Check the settings that would make every job fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.input_directory.is_dir() {
            return Err(ConfigError::MissingInputDirectory(self.input_directory.clone()));
        }
        if self.output_directory.as_os_str().is_empty() {
            return Err(ConfigError::MissingOutputDirectory);
        }
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !self.duration_tolerance_secs.is_finite() || self.duration_tolerance_secs < 0.0 {
            return Err(ConfigError::InvalidTolerance(self.duration_tolerance_secs));
        }
        if self.file_extensions.is_empty() {
            return Err(ConfigError::NoExtensions);
        }
        if self.video_codec.trim().is_empty() {
            return Err(ConfigError::MissingCodec);
        }
        Ok(())
    }

    /// Per-job encode settings derived from this configuration
    pub fn encode_settings(&self) -> EncodeSettings {
        EncodeSettings {
            requested_codec: self.video_codec.clone(),
            fallback_codec: self.fallback_codec.clone().filter(|c| !c.trim().is_empty()),
            // 0 means "inherit", as in older config files
            video_bitrate_kbps: self.video_bitrate_kbps.filter(|&b| b > 0),
            audio_bitrate_kbps: self.audio_bitrate_kbps.filter(|&b| b > 0),
            quality: self.quality,
            encoder_preset: self.encoder_preset.clone(),
        }
    }
}
