//! Fakes shared by the unit tests: a scripted process runner, an in-memory
//! prober and a progress recorder.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::ProgressObserver;
use crate::ffprobe::{MediaInfo, MediaProber, ProbeError, StreamInfo};
use crate::job::{JobId, JobStatus};
use crate::process::{ProcessHandle, ProcessRunner};
use crate::progress::ProgressSample;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Poll `check` until it holds, panicking after [`WAIT_TIMEOUT`]
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}

/// Prober answering from a table of known files
#[derive(Default)]
pub struct FakeProber {
    media: Mutex<HashMap<PathBuf, MediaInfo>>,
    probes: Mutex<Vec<PathBuf>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &Path, duration_seconds: f64, video_codec: &str) {
        let info = MediaInfo {
            duration_seconds,
            streams: vec![StreamInfo {
                codec_type: "video".to_string(),
                codec_name: video_codec.to_string(),
                width: Some(1280),
                height: Some(720),
                bit_rate: None,
            }],
        };
        self.media.lock().unwrap().insert(path.to_path_buf(), info);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().unwrap().len()
    }

    pub fn probe_count_for(&self, path: &Path) -> usize {
        self.probes.lock().unwrap().iter().filter(|p| p.as_path() == path).count()
    }
}

#[async_trait]
impl MediaProber for FakeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        self.probes.lock().unwrap().push(path.to_path_buf());
        self.media
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ProbeError::MissingFile(path.to_path_buf()))
    }
}

enum LineSource {
    Fixed(Vec<String>),
    Live(mpsc::UnboundedReceiver<String>),
}

struct Script {
    lines: LineSource,
    /// Error returned once the scripted lines run out
    read_error: bool,
    exit_code: i32,
    output_bytes: usize,
}

/// Process runner that plays back a script per input file.
///
/// The input is the argument after `-i`, the output is the last argument. An
/// input without a script fails to spawn.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<PathBuf, Script>>,
    spawns: AtomicUsize,
    terminates: std::sync::Arc<AtomicUsize>,
    next_pid: AtomicU32,
    last_pid: Mutex<Option<u32>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `lines`, then exit with `exit_code` after writing `output_bytes` bytes
    pub fn script(&self, input: &Path, lines: Vec<String>, exit_code: i32, output_bytes: usize) {
        self.insert(input, Script {
            lines: LineSource::Fixed(lines),
            read_error: false,
            exit_code,
            output_bytes,
        });
    }

    /// Emit `lines`, then fail the next read
    pub fn script_read_error(&self, input: &Path, lines: Vec<String>) {
        self.insert(input, Script {
            lines: LineSource::Fixed(lines),
            read_error: true,
            exit_code: 0,
            output_bytes: 0,
        });
    }

    /// Lines come from the returned sender; the process exits once it is dropped
    pub fn script_live(&self, input: &Path, exit_code: i32, output_bytes: usize) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(input, Script {
            lines: LineSource::Live(rx),
            read_error: false,
            exit_code,
            output_bytes,
        });
        tx
    }

    fn insert(&self, input: &Path, script: Script) {
        self.scripts.lock().unwrap().insert(input.to_path_buf(), script);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn last_pid(&self) -> Option<u32> {
        *self.last_pid.lock().unwrap()
    }

    pub async fn wait_for_spawns(&self, count: usize) {
        wait_until("process spawns", || self.spawn_count() >= count).await;
    }
}

impl ProcessRunner for FakeRunner {
    fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        let input = args
            .iter()
            .position(|a| a == "-i")
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no -i argument"))?;
        let output = args
            .last()
            .map(PathBuf::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no output argument"))?;

        let script = self.scripts.lock().unwrap().remove(&input).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{}: not found", program.display()))
        })?;

        self.spawns.fetch_add(1, Ordering::SeqCst);
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        *self.last_pid.lock().unwrap() = Some(pid);

        let lines = match script.lines {
            LineSource::Fixed(lines) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for line in lines {
                    let _ = tx.send(line);
                }
                rx
            }
            LineSource::Live(rx) => rx,
        };

        Ok(Box::new(FakeProcess {
            pid,
            lines,
            read_error: script.read_error,
            exit_code: script.exit_code,
            output,
            output_bytes: script.output_bytes,
            killed: false,
            terminates: self.terminates.clone(),
        }))
    }
}

struct FakeProcess {
    pid: u32,
    lines: mpsc::UnboundedReceiver<String>,
    read_error: bool,
    exit_code: i32,
    output: PathBuf,
    output_bytes: usize,
    killed: bool,
    terminates: std::sync::Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        (!self.killed).then_some(self.pid)
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.killed {
            return Ok(None);
        }
        match self.lines.recv().await {
            Some(line) => Ok(Some(line)),
            None if self.read_error => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
            None => Ok(None),
        }
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if self.killed {
            return Ok(-1);
        }
        std::fs::write(&self.output, vec![0u8; self.output_bytes])?;
        Ok(self.exit_code)
    }

    async fn terminate(&mut self) -> io::Result<()> {
        self.killed = true;
        self.lines.close();
        self.terminates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Observer that records everything it sees
#[derive(Default)]
pub struct RecordingObserver {
    samples: Mutex<Vec<(JobId, ProgressSample)>>,
    states: Mutex<Vec<(JobId, JobStatus)>>,
    cancel_above: Mutex<Option<f64>>,
}

impl RecordingObserver {
    /// Ask for cancellation once a sample passes `percent`
    pub fn cancel_above(&self, percent: f64) {
        *self.cancel_above.lock().unwrap() = Some(percent);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn percents(&self, job_id: JobId) -> Vec<f64> {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, s)| s.percent_complete)
            .collect()
    }

    pub fn states(&self, job_id: JobId) -> Vec<JobStatus> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub async fn wait_for_samples(&self, count: usize) {
        wait_until("progress samples", || self.sample_count() >= count).await;
    }

    pub async fn wait_for_state(&self, job_id: JobId, status: JobStatus) {
        wait_until("job state", || self.states(job_id).contains(&status)).await;
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, job_id: JobId, sample: &ProgressSample) -> bool {
        self.samples.lock().unwrap().push((job_id, sample.clone()));
        matches!(*self.cancel_above.lock().unwrap(), Some(limit) if sample.percent_complete > limit)
    }

    fn on_state_change(&self, job_id: JobId, status: JobStatus) {
        self.states.lock().unwrap().push((job_id, status));
    }
}
