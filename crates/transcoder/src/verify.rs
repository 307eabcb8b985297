//! Post-transcode acceptance checks.
//!
//! Verification only reads: it stats the output and probes both files, so running
//! it twice on an unchanged pair gives the same answer.

use std::path::Path;
use std::sync::Arc;
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::ffprobe::{MediaInfo, MediaProber};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub reason: String,
    /// Input and output side by side; present whenever verification passed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<MediaComparison>,
}

impl VerificationResult {
    fn pass(comparison: MediaComparison) -> Self {
        Self {
            passed: true,
            reason: "verification passed".to_string(),
            comparison: Some(comparison),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            comparison: None,
        }
    }
}

/// The properties of one file shown in a before/after comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSummary {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_bit_rate: Option<u64>,
    pub audio_bit_rate: Option<u64>,
    pub duration_seconds: f64,
    pub file_size: u64,
}

impl MediaSummary {
    pub fn new(info: &MediaInfo, file_size: u64) -> Self {
        let video = info.primary_video();
        let audio = info.primary_audio();
        Self {
            video_codec: video.map(|v| v.codec_name.clone()),
            audio_codec: audio.map(|a| a.codec_name.clone()),
            width: video.and_then(|v| v.width),
            height: video.and_then(|v| v.height),
            video_bit_rate: video.and_then(|v| v.bit_rate),
            audio_bit_rate: audio.and_then(|a| a.bit_rate),
            duration_seconds: info.duration_seconds,
            file_size,
        }
    }

    fn resolution(&self) -> String {
        match (self.width, self.height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => "N/A".to_string(),
        }
    }
}

/// Input next to output for a verified transcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaComparison {
    pub input: MediaSummary,
    pub output: MediaSummary,
}

impl MediaComparison {
    /// `(property, input, output)` rows in display order
    pub fn rows(&self) -> Vec<(&'static str, String, String)> {
        let (i, o) = (&self.input, &self.output);
        let codec = |c: &Option<String>| c.clone().unwrap_or_else(|| "N/A".to_string());
        vec![
            ("Video Codec", codec(&i.video_codec), codec(&o.video_codec)),
            ("Audio Codec", codec(&i.audio_codec), codec(&o.audio_codec)),
            ("Resolution", i.resolution(), o.resolution()),
            ("Video Bitrate", human_bitrate(i.video_bit_rate), human_bitrate(o.video_bit_rate)),
            ("Audio Bitrate", human_bitrate(i.audio_bit_rate), human_bitrate(o.audio_bit_rate)),
            (
                "Duration",
                format!("{:.2}s", i.duration_seconds),
                format!("{:.2}s", o.duration_seconds),
            ),
            ("File Size", format_size(i.file_size, DECIMAL), format_size(o.file_size, DECIMAL)),
        ]
    }

    /// Log the comparison as an aligned table
    pub fn log_table(&self, title: &str) {
        info!("Video comparison for {}:", title);
        info!("{:<20} {:<30} {:<30}", "Property", "Input", "Output");
        info!("{}", "-".repeat(80));
        for (property, input, output) in self.rows() {
            info!("{:<20} {:<30} {:<30}", property, input, output);
        }
    }
}

/// Bits per second scaled to the largest unit below 1000
pub fn human_bitrate(bits_per_second: Option<u64>) -> String {
    let Some(bps) = bits_per_second else {
        return "N/A".to_string();
    };
    let mut value = bps as f64;
    for unit in ["bps", "Kbps", "Mbps", "Gbps"] {
        if value < 1000.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1000.0;
    }
    format!("{:.2} Tbps", value)
}

/// Compares input and output media to accept or reject a transcode
#[derive(Clone)]
pub struct Verifier {
    prober: Arc<dyn MediaProber>,
    /// Codec the output's video stream must carry; `None` disables the check
    expected_codec: Option<String>,
}

impl Verifier {
    pub fn new(prober: Arc<dyn MediaProber>) -> Self {
        Self {
            prober,
            expected_codec: None,
        }
    }

    /// Also require the output video stream to use `codec`
    pub fn enforcing_codec(mut self, codec: impl Into<String>) -> Self {
        self.expected_codec = Some(codec.into());
        self
    }

    pub async fn verify(&self, input: &Path, output: &Path, duration_tolerance_seconds: f64) -> VerificationResult {
        info!("Verifying transcoding of {}", output.display());

        let output_size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if output_size == 0 {
            warn!("Output file is missing or empty: {}", output.display());
            return VerificationResult::fail("missing or empty output");
        }

        let (input_info, output_info) = match (self.prober.probe(input).await, self.prober.probe(output).await) {
            (Ok(i), Ok(o)) => (i, o),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Unable to verify transcoding due to missing video information: {}", e);
                return VerificationResult::fail(format!("unreadable media metadata: {}", e));
            }
        };

        let diff = (input_info.duration_seconds - output_info.duration_seconds).abs();
        if diff > duration_tolerance_seconds {
            let reason = format!(
                "duration mismatch: input={:.2} output={:.2}",
                input_info.duration_seconds, output_info.duration_seconds
            );
            warn!("{}", reason);
            return VerificationResult::fail(reason);
        }

        if let Some(expected) = &self.expected_codec {
            let actual = output_info
                .primary_video()
                .map(|s| s.codec_name.as_str())
                .unwrap_or("none");
            if !actual.eq_ignore_ascii_case(expected) {
                let reason = format!("incorrect video codec: expected {} got {}", expected, actual);
                warn!("{}", reason);
                return VerificationResult::fail(reason);
            }
        }

        let input_size = match tokio::fs::metadata(input).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Unable to read size of {}: {}", input.display(), e);
                0
            }
        };

        info!("Verification passed: output exists, is non-empty, and has correct duration");
        VerificationResult::pass(MediaComparison {
            input: MediaSummary::new(&input_info, input_size),
            output: MediaSummary::new(&output_info, output_size),
        })
    }
}
