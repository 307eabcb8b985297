use std::sync::LazyLock;
use regex::Regex;
use serde::Serialize;

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\d{2,}):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid time regex"));
static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("valid frame regex"));
static FPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"fps=\s*(\d+(?:\.\d+)?)").expect("valid fps regex"));
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").expect("valid speed regex"));

/// One progress reading taken from an ffmpeg status line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    pub elapsed_seconds: f64,
    pub frame_number: u64,
    pub percent_complete: f64,
    pub instantaneous_fps: Option<f64>,
    pub eta_seconds: Option<f64>,
}

/// Parse an ffmpeg status line such as
/// `frame= 1234 fps= 48 q=28.0 size= 10240kB time=00:00:51.42 bitrate=1631.4kbits/s speed=2.01x`.
///
/// Returns `None` unless both the `time=` and `frame=` tokens are present.
pub fn parse(line: &str, total_duration: f64) -> Option<ProgressSample> {
    let time = TIME_RE.captures(line)?;
    let frame = FRAME_RE.captures(line)?;

    let hours: f64 = time[1].parse().ok()?;
    let minutes: f64 = time[2].parse().ok()?;
    let seconds: f64 = time[3].parse().ok()?;
    let elapsed_seconds = hours * 3600.0 + minutes * 60.0 + seconds;
    let frame_number: u64 = frame[1].parse().ok()?;

    let percent_complete = if total_duration > 0.0 {
        100.0 * elapsed_seconds / total_duration
    } else {
        0.0
    };

    let instantaneous_fps = FPS_RE.captures(line).and_then(|c| c[1].parse::<f64>().ok());
    let eta_seconds = SPEED_RE
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok())
        .filter(|&speed| speed > 0.0 && total_duration > 0.0)
        .map(|speed| ((total_duration - elapsed_seconds) / speed).max(0.0));

    Some(ProgressSample {
        elapsed_seconds,
        frame_number,
        percent_complete,
        instantaneous_fps,
        eta_seconds,
    })
}
