//! Bounded-concurrency dispatch of jobs to engines.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use futures::FutureExt;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::control::RunControl;
use crate::engine::{EngineServices, TranscodeEngine};
use crate::job::{Job, JobId, JobOutcome, JobSpec, JobStatus};

/// Aggregate counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub total_files: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Input bytes minus output bytes over completed jobs; negative when outputs grew
    pub bytes_saved: i64,
    /// Size of the inputs of completed jobs
    pub input_bytes: u64,
    /// Size of the outputs of completed jobs
    pub output_bytes: u64,
    /// Sum of the encode times of completed jobs
    pub processing_time: Duration,
}

impl RunStatistics {
    /// Percentage by which completed outputs are smaller than their inputs.
    /// `None` until some input bytes were recorded.
    pub fn compression_percent(&self) -> Option<f64> {
        if self.input_bytes == 0 {
            return None;
        }
        Some((1.0 - self.output_bytes as f64 / self.input_bytes as f64) * 100.0)
    }
}

/// Final state of a run, jobs in submission order
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stats: RunStatistics,
    pub jobs: Vec<Job>,
    pub failed_jobs: Vec<JobId>,
}

#[derive(Debug, Clone, Default)]
struct LiveState {
    stats: RunStatistics,
    failed_jobs: Vec<JobId>,
}

/// Handle to a run in progress
pub struct RunHandle {
    control: RunControl,
    live: watch::Receiver<LiveState>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Snapshot of the counters so far
    pub fn stats(&self) -> RunStatistics {
        self.live.borrow().stats.clone()
    }

    pub fn failed_jobs(&self) -> Vec<JobId> {
        self.live.borrow().failed_jobs.clone()
    }

    /// Resolves after every dispatched job reached a terminal state
    pub async fn wait(self) -> Result<RunReport> {
        self.task.await.context("Dispatcher task failed")
    }
}

/// Runs jobs over a bounded pool of engines
pub struct JobOrchestrator {
    services: Arc<EngineServices>,
    delete_original: bool,
}

impl JobOrchestrator {
    pub fn new(services: EngineServices) -> Self {
        Self {
            services: Arc::new(services),
            delete_original: false,
        }
    }

    /// Delete each input after its output was verified
    pub fn with_delete_original(mut self, delete_original: bool) -> Self {
        self.delete_original = delete_original;
        self
    }

    /// Start a run. Jobs are dispatched in the given order, at most
    /// `concurrency` at a time (at least one).
    pub fn submit_run(&self, specs: Vec<JobSpec>, concurrency: usize) -> RunHandle {
        let control = RunControl::new();
        let jobs: Vec<Job> = specs.into_iter().map(Job::new).collect();
        let (live_tx, live) = watch::channel(LiveState {
            stats: RunStatistics {
                total_files: jobs.len(),
                ..Default::default()
            },
            failed_jobs: Vec::new(),
        });

        info!("🚀 Starting run of {} jobs with {} workers", jobs.len(), concurrency.max(1));

        let dispatcher = Dispatcher {
            services: self.services.clone(),
            control: control.clone(),
            delete_original: self.delete_original,
            live: live_tx,
        };
        let task = tokio::spawn(dispatcher.run(jobs, concurrency.max(1)));

        RunHandle { control, live, task }
    }
}

enum Step {
    Shutdown,
    Finished(Result<(Job, JobOutcome), JoinError>),
    Permit(OwnedSemaphorePermit),
}

struct Dispatcher {
    services: Arc<EngineServices>,
    control: RunControl,
    delete_original: bool,
    live: watch::Sender<LiveState>,
}

impl Dispatcher {
    async fn run(self, jobs: Vec<Job>, concurrency: usize) -> RunReport {
        let order: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let mut pending: VecDeque<Job> = jobs.into();
        let mut done: HashMap<JobId, Job> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let shutdown = self.control.shutdown_token();
        let mut running: JoinSet<(Job, JobOutcome)> = JoinSet::new();

        while !pending.is_empty() {
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                Some(res) = running.join_next(), if !running.is_empty() => Step::Finished(res),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Step::Permit(permit),
                    Err(_) => Step::Shutdown,
                },
            };

            match step {
                Step::Shutdown => {
                    info!("🛑 Shutdown: {} queued jobs will not be dispatched", pending.len());
                    break;
                }
                Step::Finished(res) => self.record(res, &mut done).await,
                Step::Permit(permit) => {
                    if shutdown.is_cancelled() {
                        continue;
                    }
                    let Some(job) = pending.pop_front() else {
                        break;
                    };
                    self.dispatch(&mut running, job, permit);
                }
            }
        }

        while let Some(res) = running.join_next().await {
            self.record(res, &mut done).await;
        }

        let jobs = order
            .into_iter()
            .filter_map(|id| {
                done.remove(&id)
                    .or_else(|| pending.iter().position(|j| j.id == id).and_then(|i| pending.remove(i)))
            })
            .collect();

        let live = self.live.borrow().clone();
        info!(
            "🏁 Run finished: {} succeeded, {} failed, {} cancelled of {}",
            live.stats.succeeded, live.stats.failed, live.stats.cancelled, live.stats.total_files
        );
        RunReport {
            stats: live.stats,
            jobs,
            failed_jobs: live.failed_jobs,
        }
    }

    fn dispatch(&self, running: &mut JoinSet<(Job, JobOutcome)>, job: Job, permit: OwnedSemaphorePermit) {
        info!("Job {}: dispatching {}", job.id, job.display_name());
        let snapshot = job.clone();
        let engine = TranscodeEngine::new(job, self.services.clone(), self.control.listener());

        running.spawn(async move {
            let result = AssertUnwindSafe(engine.run()).catch_unwind().await;
            drop(permit);
            match result {
                Ok(finished) => finished,
                Err(panic) => {
                    let reason = format!("engine panicked: {}", panic_message(&*panic));
                    error!("Job {}: {}", snapshot.id, reason);
                    let mut job = snapshot;
                    job.reason = Some(reason.clone());
                    job.transition(JobStatus::Failed);
                    (job, JobOutcome::Failed { reason })
                }
            }
        });
    }

    async fn record(&self, res: Result<(Job, JobOutcome), JoinError>, done: &mut HashMap<JobId, Job>) {
        let (job, outcome) = match res {
            Ok(finished) => finished,
            Err(e) => {
                // Panics are caught inside the task, so this is an abort
                error!("Engine task ended abnormally: {}", e);
                return;
            }
        };

        match &outcome {
            JobOutcome::Completed(_) => {
                if self.delete_original {
                    match tokio::fs::remove_file(&job.input_path).await {
                        Ok(()) => info!("Job {}: deleted original {}", job.id, job.input_path.display()),
                        Err(e) => warn!("Job {}: failed to delete original {}: {}", job.id, job.input_path.display(), e),
                    }
                }
            }
            JobOutcome::Failed { reason } => warn!("Job {}: recorded failure: {}", job.id, reason),
            JobOutcome::Cancelled => {}
        }

        self.live.send_modify(|live| {
            match &outcome {
                JobOutcome::Completed(done) => {
                    live.stats.succeeded += 1;
                    live.stats.bytes_saved += done.bytes_saved();
                    live.stats.input_bytes += done.input_bytes;
                    live.stats.output_bytes += done.output_bytes;
                    live.stats.processing_time += done.elapsed;
                }
                JobOutcome::Failed { .. } => {
                    live.stats.failed += 1;
                    live.failed_jobs.push(job.id);
                }
                JobOutcome::Cancelled => live.stats.cancelled += 1,
            }
        });

        done.insert(job.id, job);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
