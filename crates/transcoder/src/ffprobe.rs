use std::path::{Path, PathBuf};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::TranscodeConfig;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub bit_rate: Option<String>,
}

/// Probe result reduced to what the engine and verifier look at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub codec_type: String,
    pub codec_name: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bit_rate: Option<u64>,
}

impl MediaInfo {
    /// First video stream, if any
    pub fn primary_video(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.codec_type == "video")
    }

    /// First audio stream, if any
    pub fn primary_audio(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.codec_type == "audio")
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe could not be started at {bin}: {source}")]
    Unavailable {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file does not exist: {0}")]
    MissingFile(PathBuf),
    #[error("ffprobe failed (exit code {code}) for {path}: {stderr}")]
    Failed { path: PathBuf, code: i32, stderr: String },
    #[error("could not parse ffprobe output for {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no duration reported for {0}")]
    MissingDuration(PathBuf),
}

/// Reads media metadata from a file
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// [`MediaProber`] backed by a local ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    pub ffprobe_bin: PathBuf,
}

impl FfprobeProber {
    pub fn new(cfg: &TranscodeConfig) -> Self {
        Self {
            ffprobe_bin: cfg.ffprobe_bin.clone(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        use log::debug;

        // Verify file exists before trying to probe
        if !path.exists() {
            return Err(ProbeError::MissingFile(path.to_path_buf()));
        }

        debug!("Executing FFprobe for: {}", path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path)
            .output()
            .await
            .map_err(|source| ProbeError::Unavailable {
                bin: self.ffprobe_bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_probe_output(path, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Turn raw ffprobe JSON into [`MediaInfo`]
pub fn parse_probe_output(path: &Path, json: &str) -> Result<MediaInfo, ProbeError> {
    let data: FFProbeData = serde_json::from_str(json).map_err(|source| ProbeError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let duration_seconds = data
        .format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .ok_or_else(|| ProbeError::MissingDuration(path.to_path_buf()))?;

    let streams = data
        .streams
        .into_iter()
        .map(|s| StreamInfo {
            codec_type: s.codec_type.unwrap_or_else(|| "unknown".to_string()),
            codec_name: s.codec_name.unwrap_or_else(|| "unknown".to_string()),
            width: s.width.and_then(|w| u32::try_from(w).ok()),
            height: s.height.and_then(|h| u32::try_from(h).ok()),
            bit_rate: s.bit_rate.and_then(|b| b.parse::<u64>().ok()),
        })
        .collect();

    Ok(MediaInfo {
        duration_seconds,
        streams,
    })
}
