use anyhow::{Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use transcoder::{
    config::TranscodeConfig,
    engine::{EngineServices, ProgressObserver},
    ffprobe::FfprobeProber,
    hardware::FfmpegCapabilities,
    job::{JobId, JobStatus},
    orchestrator::{JobOrchestrator, RunReport},
    process::TokioProcessRunner,
    progress::ProgressSample,
    control::RunControl,
    encoder::EncoderResolver,
    scan,
};

/// Batch video transcoder with GPU encoder selection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input directory (overrides config)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory (overrides config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of concurrent transcodes (overrides config)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Delete each original after its output was verified
    #[arg(long)]
    delete_original: bool,

    /// Video codec to produce: h264, hevc or av1 (overrides config)
    #[arg(long)]
    codec: Option<String>,

    /// Write the final run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Minimum time between two progress lines for the same job
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Prints progress to stderr, at most once per interval per job
#[derive(Default)]
struct ConsoleProgress {
    last_print: Mutex<HashMap<JobId, Instant>>,
}

impl ProgressObserver for ConsoleProgress {
    fn on_progress(&self, job_id: JobId, sample: &ProgressSample) -> bool {
        let Ok(mut last_print) = self.last_print.lock() else {
            return false;
        };
        let now = Instant::now();
        if last_print
            .get(&job_id)
            .is_some_and(|t| now.duration_since(*t) < PROGRESS_INTERVAL)
        {
            return false;
        }
        last_print.insert(job_id, now);

        let fps = sample.instantaneous_fps.map(|f| format!(" {:.1} fps", f)).unwrap_or_default();
        let eta = sample.eta_seconds.map(|s| format!(" ETA {}s", s.round() as u64)).unwrap_or_default();
        eprintln!(
            "[{}] {:>5.1}% frame {}{}{}",
            short_id(job_id),
            sample.percent_complete,
            sample.frame_number,
            fps,
            eta
        );
        false
    }

    fn on_state_change(&self, job_id: JobId, status: JobStatus) {
        if status.is_terminal() {
            if let Ok(mut last_print) = self.last_print.lock() {
                last_print.remove(&job_id);
            }
        }
        eprintln!("[{}] {:?}", short_id(job_id), status);
    }
}

fn short_id(id: JobId) -> String {
    id.to_string().chars().take(8).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins unless --verbose asks for debug output
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();

    let mut cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(input) = args.input {
        cfg.input_directory = input;
    }
    if let Some(output) = args.output {
        cfg.output_directory = output;
    }
    if let Some(threads) = args.threads {
        cfg.max_workers = threads;
    }
    if let Some(codec) = args.codec {
        cfg.video_codec = codec;
    }
    if args.delete_original {
        cfg.delete_original = true;
    }

    cfg.validate().context("Invalid configuration")?;

    info!("Transcoder starting");
    info!("Configuration loaded:");
    info!("  Input directory: {}", cfg.input_directory.display());
    info!("  Output directory: {}", cfg.output_directory.display());
    info!("  Codec: {} (fallback: {:?})", cfg.video_codec, cfg.fallback_codec);
    info!("  Workers: {}", cfg.max_workers);
    info!("  Delete originals: {}", cfg.delete_original);

    let settings = cfg.encode_settings();
    let specs = scan::candidates(scan::scan_input(&cfg, &settings).context("Failed to scan input directory")?);
    if specs.is_empty() {
        info!("No files to process");
        return Ok(());
    }
    info!("Found {} files to process", specs.len());

    let capabilities = FfmpegCapabilities::detect(&cfg)
        .await
        .context("Failed to query ffmpeg encoders")?;
    info!("Hardware tier: {}", capabilities.tier);

    let services = EngineServices::new(
        &cfg,
        Arc::new(TokioProcessRunner),
        Arc::new(FfprobeProber::new(&cfg)),
        EncoderResolver::new(Arc::new(capabilities)),
        Arc::new(ConsoleProgress::default()),
    );
    let orchestrator = JobOrchestrator::new(services).with_delete_original(cfg.delete_original);
    let handle = orchestrator.submit_run(specs, cfg.max_workers);

    tokio::spawn(forward_ctrl_c(handle.control()));
    let commands = handle.control();
    std::thread::spawn(move || read_commands(commands));
    eprintln!("Type 'pause', 'resume' or 'quit' and press Enter to control the run");

    let report = handle.wait().await?;
    print_summary(&report);

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize run report")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    if report.stats.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn forward_ctrl_c(control: RunControl) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupt received, stopping after cancelling running jobs");
            control.shutdown();
        }
        Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
    }
}

/// Drive the control channel from stdin commands. Runs on its own thread so a
/// pending read never holds up runtime shutdown.
fn read_commands(control: RunControl) {
    for line in std::io::stdin().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        match line.trim().to_lowercase().as_str() {
            "pause" | "p" => control.pause(),
            "resume" | "r" => control.resume(),
            "quit" | "q" | "stop" => {
                control.shutdown();
                break;
            }
            "" => {}
            other => eprintln!("Unknown command '{}': use pause, resume or quit", other),
        }
    }
}

fn print_summary(report: &RunReport) {
    let stats = &report.stats;
    let saved = format_size(stats.bytes_saved.unsigned_abs(), DECIMAL);
    let saved = if stats.bytes_saved < 0 { format!("-{}", saved) } else { saved };

    println!();
    println!("Transcoding summary");
    println!("  Total files: {}", stats.total_files);
    println!("  Succeeded:   {}", stats.succeeded);
    println!("  Failed:      {}", stats.failed);
    println!("  Cancelled:   {}", stats.cancelled);
    println!("  Space saved: {}", saved);
    println!("  Input size:  {}", format_size(stats.input_bytes, DECIMAL));
    println!("  Output size: {}", format_size(stats.output_bytes, DECIMAL));
    if let Some(percent) = stats.compression_percent() {
        println!("  Compression: {:.2}%", percent);
    }
    println!("  Processing:  {:.2}s", stats.processing_time.as_secs_f64());

    let not_run = report.jobs.iter().filter(|j| j.status == JobStatus::Queued).count();
    if not_run > 0 {
        println!("  Not started: {}", not_run);
    }

    let processed: Vec<_> = report.jobs.iter().filter(|j| j.status == JobStatus::Completed).collect();
    if !processed.is_empty() {
        println!();
        println!("Processed files:");
        for job in processed {
            println!("  - {}", job.display_name());
        }
    }

    for job in report.jobs.iter().filter(|j| j.status == JobStatus::Failed) {
        println!(
            "  ❌ {}: {}",
            job.input_path.display(),
            job.reason.as_deref().unwrap_or("unknown error")
        );
    }
}
