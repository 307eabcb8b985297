pub mod config;
pub mod job;
pub mod scan;
pub mod ffprobe;
pub mod hardware;
pub mod encoder;
pub mod progress;
pub mod verify;
pub mod process;
pub mod control;
pub mod engine;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, TranscodeConfig};
pub use job::{CompletionStats, EncodeSettings, Job, JobId, JobOutcome, JobSpec, JobStatus};
pub use ffprobe::{FfprobeProber, MediaInfo, MediaProber, ProbeError};
pub use hardware::{FfmpegCapabilities, HardwareCapabilities, HardwareTier, StaticCapabilities};
pub use encoder::{AccelerationKind, EncoderResolution, EncoderResolver};
pub use progress::ProgressSample;
pub use verify::{MediaComparison, MediaSummary, VerificationResult, Verifier};
pub use process::{ProcessHandle, ProcessRunner, TokioProcessRunner};
pub use control::{ControlCommand, ControlEvent, ControlListener, RunControl};
pub use engine::{EngineServices, NoopObserver, ProgressObserver, TranscodeEngine};
pub use orchestrator::{JobOrchestrator, RunHandle, RunReport, RunStatistics};
