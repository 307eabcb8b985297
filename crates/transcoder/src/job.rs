use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoder::EncoderResolution;
use crate::verify::MediaComparison;

pub type JobId = Uuid;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Running) => true,
            (Queued, Failed) | (Queued, Cancelled) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Running | Paused, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Encoding knobs shared by every job of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeSettings {
    pub requested_codec: String,
    pub fallback_codec: Option<String>,
    pub video_bitrate_kbps: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
    pub quality: Option<u8>,
    pub encoder_preset: Option<String>,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            requested_codec: "h264".to_string(),
            fallback_codec: None,
            video_bitrate_kbps: None,
            audio_bitrate_kbps: None,
            quality: None,
            encoder_preset: None,
        }
    }
}

/// A transcode request as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub settings: EncodeSettings,
}

impl JobSpec {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>, settings: EncodeSettings) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            settings,
        }
    }
}

/// One file's transcode request and its lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub settings: EncodeSettings,
    pub status: JobStatus,
    pub resolution: Option<EncoderResolution>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_path: spec.input_path,
            output_path: spec.output_path,
            settings: spec.settings,
            status: JobStatus::Queued,
            resolution: None,
            reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, stamping start/finish times.
    ///
    /// Returns false (and leaves the job untouched) when the move is not allowed,
    /// which includes any attempt to leave a terminal state.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            log::warn!("Job {}: refusing status change {:?} -> {:?}", self.id, self.status, next);
            return false;
        }
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        true
    }

    /// File name used in log lines and summaries
    pub fn display_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.input_path.display().to_string())
    }
}

/// Numbers recorded for a verified transcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStats {
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub encoder_id: String,
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<MediaComparison>,
}

impl CompletionStats {
    pub fn bytes_saved(&self) -> i64 {
        self.input_bytes as i64 - self.output_bytes as i64
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed(CompletionStats),
    Failed { reason: String },
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}
