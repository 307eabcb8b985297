//! Supervision of one ffmpeg process for one job.
//!
//! The engine owns its [`Job`] for the whole run and hands it back together with
//! the [`JobOutcome`]. Nothing that goes wrong in here escapes as an error: spawn
//! failures, read errors and bad exits all end up as `JobOutcome::Failed`.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::TranscodeConfig;
use crate::control::{ControlEvent, ControlListener, PAUSE_POLL_INTERVAL};
use crate::encoder::{EncoderResolution, EncoderResolver};
use crate::ffprobe::{MediaInfo, MediaProber, ProbeError};
use crate::job::{CompletionStats, EncodeSettings, Job, JobId, JobOutcome, JobStatus};
use crate::process::{ProcessHandle, ProcessRunner};
use crate::progress::{self, ProgressSample};
use crate::verify::Verifier;

/// Output lines kept for failure diagnostics
const DIAGNOSTIC_LINES: usize = 20;

/// Receives progress and state changes for running jobs.
///
/// Called from the engine's read loop, so implementations must return quickly.
pub trait ProgressObserver: Send + Sync {
    /// Returning `true` cancels the job
    fn on_progress(&self, job_id: JobId, sample: &ProgressSample) -> bool;

    fn on_state_change(&self, _job_id: JobId, _status: JobStatus) {}
}

impl<F> ProgressObserver for F
where
    F: Fn(JobId, &ProgressSample) -> bool + Send + Sync,
{
    fn on_progress(&self, job_id: JobId, sample: &ProgressSample) -> bool {
        self(job_id, sample)
    }
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _job_id: JobId, _sample: &ProgressSample) -> bool {
        false
    }
}

#[derive(Debug, Error)]
enum TranscodeError {
    #[error("input file does not exist: {0}")]
    MissingInput(PathBuf),
    #[error("unreadable media metadata: {0}")]
    Probe(#[from] ProbeError),
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error reading encoder output: {0}")]
    Read(#[source] io::Error),
    #[error("error waiting for encoder: {0}")]
    Wait(#[source] io::Error),
    #[error("encoder exited with code {code}\n{diagnostics}")]
    Exit { code: i32, diagnostics: String },
    #[error("{0}")]
    Verification(String),
}

/// Services and settings shared by every engine of a run
pub struct EngineServices {
    pub ffmpeg_bin: PathBuf,
    pub runner: Arc<dyn ProcessRunner>,
    pub prober: Arc<dyn MediaProber>,
    pub resolver: EncoderResolver,
    pub observer: Arc<dyn ProgressObserver>,
    pub duration_tolerance_secs: f64,
    pub enforce_codec: bool,
}

impl EngineServices {
    pub fn new(
        cfg: &TranscodeConfig,
        runner: Arc<dyn ProcessRunner>,
        prober: Arc<dyn MediaProber>,
        resolver: EncoderResolver,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            runner,
            prober,
            resolver,
            observer,
            duration_tolerance_secs: cfg.duration_tolerance_secs,
            enforce_codec: cfg.enforce_codec,
        }
    }
}

/// Why the read loop stopped
enum LoopEnd {
    Eof,
    Shutdown,
    CancelledByObserver,
}

enum LoopEvent {
    Control(ControlEvent),
    Line(io::Result<Option<String>>),
}

/// Supervises exactly one external encoding process for one job
pub struct TranscodeEngine {
    job: Job,
    services: Arc<EngineServices>,
    control: ControlListener,
    diagnostics: VecDeque<String>,
}

impl TranscodeEngine {
    pub fn new(job: Job, services: Arc<EngineServices>, control: ControlListener) -> Self {
        Self {
            job,
            services,
            control,
            diagnostics: VecDeque::with_capacity(DIAGNOSTIC_LINES),
        }
    }

    /// Run the job to a terminal state
    pub async fn run(mut self) -> (Job, JobOutcome) {
        let outcome = if self.control.is_shutdown() {
            info!("Job {}: shutdown requested before start", self.job.id);
            JobOutcome::Cancelled
        } else {
            match self.execute().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Job {}: ❌ {} failed: {}", self.job.id, self.job.display_name(), e);
                    JobOutcome::Failed { reason: e.to_string() }
                }
            }
        };

        if let JobOutcome::Failed { reason } = &outcome {
            self.job.reason = Some(reason.clone());
        }
        self.set_status(outcome.status());
        (self.job, outcome)
    }

    async fn execute(&mut self) -> Result<JobOutcome, TranscodeError> {
        let input = self.job.input_path.clone();
        let output = self.job.output_path.clone();

        if !input.exists() {
            return Err(TranscodeError::MissingInput(input));
        }

        let source = self.services.prober.probe(&input).await?;

        let resolution = self.services.resolver.resolve(
            &self.job.settings.requested_codec,
            self.job.settings.fallback_codec.as_deref(),
        );
        info!(
            "Job {}: transcoding {} to {} using {:?} ({})",
            self.job.id,
            self.job.display_name(),
            resolution.resolved_encoder_id,
            resolution.acceleration_kind,
            resolution.hardware_tier
        );
        self.job.resolution = Some(resolution.clone());

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| TranscodeError::OutputDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let args = build_ffmpeg_args(&input, &output, &self.job.settings, &resolution, &source);
        debug!("Job {}: ffmpeg args: {:?}", self.job.id, args);

        let mut process = self
            .services
            .runner
            .spawn(&self.services.ffmpeg_bin, &args)
            .map_err(|source| TranscodeError::Spawn {
                program: self.services.ffmpeg_bin.clone(),
                source,
            })?;
        let started = Instant::now();
        self.set_status(JobStatus::Running);

        let end = match self.supervise(process.as_mut(), source.duration_seconds).await {
            Ok(end) => end,
            Err(e) => {
                self.terminate(process.as_mut()).await;
                return Err(e);
            }
        };

        match end {
            LoopEnd::Shutdown | LoopEnd::CancelledByObserver => {
                self.terminate(process.as_mut()).await;
                info!("Job {}: cancelled, partial output left at {}", self.job.id, output.display());
                Ok(JobOutcome::Cancelled)
            }
            LoopEnd::Eof => {
                let code = process.wait().await.map_err(TranscodeError::Wait)?;
                if code != 0 {
                    return Err(TranscodeError::Exit {
                        code,
                        diagnostics: self.diagnostics.iter().cloned().collect::<Vec<_>>().join("\n"),
                    });
                }
                info!("Job {}: transcoding complete: {}", self.job.id, self.job.display_name());
                self.verify(&input, &output, &resolution, started).await
            }
        }
    }

    /// Read output lines until the process closes its streams, honoring pause and shutdown
    async fn supervise(&mut self, process: &mut dyn ProcessHandle, duration: f64) -> Result<LoopEnd, TranscodeError> {
        loop {
            if self.control.is_shutdown() {
                return Ok(LoopEnd::Shutdown);
            }
            if self.control.is_paused() {
                if let Some(end) = self.wait_while_paused().await {
                    return Ok(end);
                }
                continue;
            }

            let event = tokio::select! {
                biased;
                ev = self.control.changed() => LoopEvent::Control(ev),
                line = process.next_line() => LoopEvent::Line(line),
            };

            match event {
                LoopEvent::Control(ControlEvent::Shutdown) => return Ok(LoopEnd::Shutdown),
                LoopEvent::Control(_) => continue,
                LoopEvent::Line(Ok(Some(line))) => {
                    if self.handle_line(line, duration) {
                        info!("Job {}: cancellation requested by observer", self.job.id);
                        return Ok(LoopEnd::CancelledByObserver);
                    }
                }
                LoopEvent::Line(Ok(None)) => return Ok(LoopEnd::Eof),
                LoopEvent::Line(Err(e)) => return Err(TranscodeError::Read(e)),
            }
        }
    }

    /// Returns true when the observer asks for cancellation
    fn handle_line(&mut self, line: String, duration: f64) -> bool {
        let sample = progress::parse(&line, duration);
        if sample.is_none() {
            debug!("Job {}: ffmpeg: {}", self.job.id, line.trim());
        }

        if self.diagnostics.len() == DIAGNOSTIC_LINES {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(line);

        match sample {
            Some(sample) => self.services.observer.on_progress(self.job.id, &sample),
            None => false,
        }
    }

    /// Hold the read loop while paused. The process stays alive; its output
    /// backs up in the pipe until resume.
    async fn wait_while_paused(&mut self) -> Option<LoopEnd> {
        self.set_status(JobStatus::Paused);
        info!("Job {}: ⏸️  paused", self.job.id);

        loop {
            if self.control.is_shutdown() {
                return Some(LoopEnd::Shutdown);
            }
            if !self.control.is_paused() {
                break;
            }
            let _ = tokio::time::timeout(PAUSE_POLL_INTERVAL, self.control.changed()).await;
        }

        info!("Job {}: ▶️  resumed", self.job.id);
        self.set_status(JobStatus::Running);
        None
    }

    async fn verify(
        &self,
        input: &Path,
        output: &Path,
        resolution: &EncoderResolution,
        started: Instant,
    ) -> Result<JobOutcome, TranscodeError> {
        let mut verifier = Verifier::new(self.services.prober.clone());
        if self.services.enforce_codec {
            verifier = verifier.enforcing_codec(resolution.effective_codec.clone());
        }

        let result = verifier
            .verify(input, output, self.services.duration_tolerance_secs)
            .await;
        if !result.passed {
            warn!("Job {}: verification failed, output kept at {}", self.job.id, output.display());
            return Err(TranscodeError::Verification(result.reason));
        }

        let Some(comparison) = result.comparison else {
            return Err(TranscodeError::Verification("verification passed without media details".to_string()));
        };
        let input_bytes = comparison.input.file_size;
        let output_bytes = comparison.output.file_size;
        info!(
            "Job {}: ✅ {} verified ({} -> {} bytes)",
            self.job.id,
            self.job.display_name(),
            input_bytes,
            output_bytes
        );
        comparison.log_table(&self.job.display_name());

        Ok(JobOutcome::Completed(CompletionStats {
            input_bytes,
            output_bytes,
            encoder_id: resolution.resolved_encoder_id.clone(),
            elapsed: started.elapsed(),
            comparison: Some(comparison),
        }))
    }

    async fn terminate(&self, process: &mut dyn ProcessHandle) {
        if let Err(e) = process.terminate().await {
            // Already exited processes cannot be killed
            debug!("Job {}: terminate: {}", self.job.id, e);
        }
    }

    fn set_status(&mut self, next: JobStatus) {
        if self.job.status != next && self.job.transition(next) {
            self.services.observer.on_state_change(self.job.id, next);
        }
    }
}

/// Build the ffmpeg argument list for one job.
///
/// Rate control: a target bitrate sets `-b:v` with max-rate at 1.5x and buffer at
/// 2x; otherwise the source video bitrate is inherited; otherwise the quality
/// value goes to the encoder's constant-quality flag.
pub fn build_ffmpeg_args(
    input: &Path,
    output: &Path,
    settings: &EncodeSettings,
    resolution: &EncoderResolution,
    source: &MediaInfo,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().to_string(),
        "-map".into(),
        "0".into(),
        "-c:v".into(),
        resolution.resolved_encoder_id.clone(),
    ];

    if let Some(preset) = &settings.encoder_preset {
        args.push("-preset".into());
        args.push(preset.clone());
    }

    let source_bitrate = source.primary_video().and_then(|v| v.bit_rate);
    if let Some(kbps) = settings.video_bitrate_kbps {
        let maxrate = (kbps as f64 * 1.5) as u64;
        let bufsize = kbps as u64 * 2;
        args.push("-b:v".into());
        args.push(format!("{}k", kbps));
        args.push("-maxrate".into());
        args.push(format!("{}k", maxrate));
        args.push("-bufsize".into());
        args.push(format!("{}k", bufsize));
    } else if let Some(bps) = source_bitrate {
        args.push("-b:v".into());
        args.push(bps.to_string());
    } else if let Some(q) = settings.quality {
        args.extend(quality_args(&resolution.resolved_encoder_id, q));
    }

    // Copy audio by default, re-encode only the first stream when a bitrate is set
    args.push("-c:a".into());
    args.push("copy".into());
    if let Some(kbps) = settings.audio_bitrate_kbps {
        args.push("-c:a:0".into());
        args.push("aac".into());
        args.push("-b:a:0".into());
        args.push(format!("{}k", kbps));
    }

    args.push("-c:s".into());
    args.push("copy".into());
    args.push(output.to_string_lossy().to_string());
    args
}

/// Constant-quality flag for an encoder family
fn quality_args(encoder_id: &str, quality: u8) -> Vec<String> {
    let q = quality.to_string();
    if encoder_id.ends_with("_nvenc") {
        vec!["-cq".into(), q]
    } else if encoder_id.ends_with("_qsv") {
        vec!["-global_quality".into(), q]
    } else if encoder_id.ends_with("_amf") {
        vec!["-qp_i".into(), q.clone(), "-qp_p".into(), q]
    } else {
        vec!["-crf".into(), q]
    }
}
