use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::TranscodeConfig;

/// GPU vendor class used to pick an accelerated encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareTier {
    None,
    Nvidia,
    Intel,
    Amd,
}

impl fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareTier::None => "none",
            HardwareTier::Nvidia => "nvidia",
            HardwareTier::Intel => "intel",
            HardwareTier::Amd => "amd",
        };
        f.write_str(name)
    }
}

/// What the local machine and toolchain can encode with
pub trait HardwareCapabilities: Send + Sync {
    /// Detected (or configured) hardware tier
    fn tier(&self) -> HardwareTier;
    /// Whether the toolchain lists `encoder_id` among its encoders
    fn supports(&self, encoder_id: &str) -> bool;
}

/// Capabilities discovered from the ffmpeg binary and vendor tools
#[derive(Debug, Clone)]
pub struct FfmpegCapabilities {
    pub tier: HardwareTier,
    pub encoders: HashSet<String>,
}

impl FfmpegCapabilities {
    /// Detect the hardware tier and query ffmpeg's encoder list
    pub async fn detect(cfg: &TranscodeConfig) -> Result<Self> {
        let tier = match cfg.hardware_tier {
            Some(tier) => {
                info!("Using configured hardware tier: {}", tier);
                tier
            }
            None => detect_tier().await,
        };

        let encoders = Self::query_encoders(&cfg.ffmpeg_bin).await?;
        debug!("ffmpeg reports {} encoders", encoders.len());

        Ok(Self { tier, encoders })
    }

    /// Run `ffmpeg -hide_banner -encoders` and collect encoder names
    async fn query_encoders(ffmpeg_bin: &Path) -> Result<HashSet<String>> {
        let output = Command::new(ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await
            .with_context(|| format!(
                "Failed to query FFmpeg encoders at: {}. Ensure FFmpeg is installed and accessible.",
                ffmpeg_bin.display()
            ))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg encoder query failed (exit code {})", output.status.code().unwrap_or(-1)));
        }

        Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl HardwareCapabilities for FfmpegCapabilities {
    fn tier(&self) -> HardwareTier {
        self.tier
    }

    fn supports(&self, encoder_id: &str) -> bool {
        self.encoders.contains(encoder_id)
    }
}

/// Parse the table printed by `ffmpeg -encoders`.
///
/// Rows look like ` V....D libx264   libx264 H.264 / AVC ...`; the header block
/// above the `------` separator is skipped.
pub fn parse_encoder_list(output: &str) -> HashSet<String> {
    let mut lines = output.lines();
    let has_separator = output.lines().any(|l| l.trim_start().starts_with("---"));
    if has_separator {
        for line in lines.by_ref() {
            if line.trim_start().starts_with("---") {
                break;
            }
        }
    }

    lines
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            // Flag column is six characters starting with V, A or S
            let is_flags = flags.len() == 6 && matches!(flags.chars().next(), Some('V' | 'A' | 'S'));
            is_flags.then(|| name.to_string())
        })
        .collect()
}

/// Probe vendor tools in the order NVIDIA, Intel, AMD
pub async fn detect_tier() -> HardwareTier {
    if command_succeeds("nvidia-smi", &[]).await {
        info!("Detected NVIDIA GPU");
        return HardwareTier::Nvidia;
    }

    if let Some(stdout) = command_stdout("vainfo", &[]).await {
        if stdout.contains("Intel") {
            info!("Detected Intel GPU (VA-API)");
            return HardwareTier::Intel;
        }
    }

    if command_succeeds("rocm-smi", &[]).await {
        info!("Detected AMD GPU");
        return HardwareTier::Amd;
    }

    info!("No compatible GPU detected, using CPU encoding");
    HardwareTier::None
}

async fn command_succeeds(program: &str, args: &[&str]) -> bool {
    match Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("{} not available: {}", program, e);
            false
        }
    }
}

async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output().await {
        // vainfo exits non-zero on some drivers while still printing the vendor string
        Ok(output) => Some(String::from_utf8_lossy(&output.stdout).to_string()),
        Err(e) => {
            debug!("{} not available: {}", program, e);
            None
        }
    }
}

/// Fixed capability set, for callers that already know what is installed
#[derive(Debug, Clone)]
pub struct StaticCapabilities {
    pub tier: HardwareTier,
    pub encoders: HashSet<String>,
}

impl StaticCapabilities {
    pub fn new<I, S>(tier: HardwareTier, encoders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tier,
            encoders: encoders.into_iter().map(Into::into).collect(),
        }
    }
}

impl HardwareCapabilities for StaticCapabilities {
    fn tier(&self) -> HardwareTier {
        self.tier
    }

    fn supports(&self, encoder_id: &str) -> bool {
        self.encoders.contains(encoder_id)
    }
}
