use std::path::{Path, PathBuf};
use anyhow::{bail, Result};
use walkdir::WalkDir;
use crate::config::TranscodeConfig;
use crate::job::{EncodeSettings, JobSpec};
use log::{debug, info, warn};

/// Result of scanning a file
#[derive(Debug, Clone)]
pub enum ScanResult {
    /// File should be transcoded
    Candidate(JobSpec),
    /// File should be skipped (path, reason)
    Skipped(PathBuf, String),
}

/// Walk the input directory and build one job per matching media file.
///
/// Output paths mirror each file's path relative to the input directory.
/// Results are sorted by input path so dispatch order is stable.
pub fn scan_input(cfg: &TranscodeConfig, settings: &EncodeSettings) -> Result<Vec<ScanResult>> {
    let root = &cfg.input_directory;
    if !root.is_dir() {
        bail!("Input directory does not exist: {}", root.display());
    }

    let extensions: Vec<String> = cfg
        .file_extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    let output_nested = cfg.output_directory != *root && cfg.output_directory.starts_with(root);

    info!("Scanning directory: {}", root.display());

    let mut results = Vec::new();
    let mut files_checked = 0;
    let walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        files_checked += 1;
        // Outputs written inside the input tree are not inputs
        if output_nested && path.starts_with(&cfg.output_directory) {
            debug!("Skipping file inside output directory: {}", path.display());
            results.push(ScanResult::Skipped(path.to_path_buf(), "inside output directory".to_string()));
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            debug!("Skipping hidden or metadata file: {}", path.display());
            results.push(ScanResult::Skipped(path.to_path_buf(), "hidden or metadata file".to_string()));
            continue;
        }

        if !has_extension(path, &extensions) {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let output = cfg.output_directory.join(relative);
        if output == path {
            results.push(ScanResult::Skipped(
                path.to_path_buf(),
                "output path equals input path".to_string(),
            ));
            continue;
        }

        debug!("Adding file to process: {} -> {}", path.display(), output.display());
        results.push(ScanResult::Candidate(JobSpec::new(path, output, settings.clone())));
    }

    results.sort_by(|a, b| scan_path(a).cmp(scan_path(b)));

    let candidates = results.iter().filter(|r| matches!(r, ScanResult::Candidate(_))).count();
    info!("Scan complete: checked {} files, found {} to process", files_checked, candidates);
    Ok(results)
}

/// The jobs among scan results, in scan order
pub fn candidates(results: Vec<ScanResult>) -> Vec<JobSpec> {
    results
        .into_iter()
        .filter_map(|r| match r {
            ScanResult::Candidate(spec) => Some(spec),
            ScanResult::Skipped(..) => None,
        })
        .collect()
}

fn scan_path(result: &ScanResult) -> &Path {
    match result {
        ScanResult::Candidate(spec) => &spec.input_path,
        ScanResult::Skipped(path, _) => path,
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(dir: &Path) -> TranscodeConfig {
        TranscodeConfig {
            input_directory: dir.join("in"),
            output_directory: dir.join("out"),
            file_extensions: vec![".mkv".to_string(), "MP4".to_string()],
            ..TranscodeConfig::default_config()
        }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"media").unwrap();
    }

    #[test]
    fn test_scan_mirrors_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        touch(&cfg.input_directory.join("Show/S01/e02.mkv"));
        touch(&cfg.input_directory.join("Show/S01/e01.MKV"));
        touch(&cfg.input_directory.join("movie.mp4"));
        touch(&cfg.input_directory.join("notes.txt"));

        let jobs = candidates(scan_input(&cfg, &EncodeSettings::default()).unwrap());
        let inputs: Vec<_> = jobs.iter().map(|j| j.input_path.strip_prefix(&cfg.input_directory).unwrap().to_path_buf()).collect();
        assert_eq!(
            inputs,
            vec![
                PathBuf::from("Show/S01/e01.MKV"),
                PathBuf::from("Show/S01/e02.mkv"),
                PathBuf::from("movie.mp4"),
            ]
        );
        assert_eq!(jobs[0].output_path, cfg.output_directory.join("Show/S01/e01.MKV"));
    }

    #[test]
    fn test_hidden_and_appledouble_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        touch(&cfg.input_directory.join("._clip.mkv"));
        touch(&cfg.input_directory.join(".partial.mkv"));
        touch(&cfg.input_directory.join("clip.mkv"));

        let results = scan_input(&cfg, &EncodeSettings::default()).unwrap();
        let skipped = results.iter().filter(|r| matches!(r, ScanResult::Skipped(..))).count();
        assert_eq!(skipped, 2);
        assert_eq!(candidates(results).len(), 1);
    }

    #[test]
    fn test_output_inside_input_is_not_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.output_directory = cfg.input_directory.join("done");
        touch(&cfg.input_directory.join("a.mkv"));
        touch(&cfg.output_directory.join("a.mkv"));

        let results = scan_input(&cfg, &EncodeSettings::default()).unwrap();
        assert!(results.iter().any(|r| matches!(
            r,
            ScanResult::Skipped(path, reason) if path == &cfg.output_directory.join("a.mkv") && reason == "inside output directory"
        )));
        let jobs = candidates(results);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].output_path, cfg.output_directory.join("a.mkv"));
    }

    #[test]
    fn test_output_directory_above_input_keeps_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.output_directory = dir.path().to_path_buf();
        touch(&cfg.input_directory.join("a.mkv"));
        touch(&cfg.input_directory.join("season/b.mp4"));

        let jobs = candidates(scan_input(&cfg, &EncodeSettings::default()).unwrap());
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].input_path, cfg.input_directory.join("a.mkv"));
        assert_eq!(jobs[0].output_path, dir.path().join("a.mkv"));
        assert_eq!(jobs[1].output_path, dir.path().join("season/b.mp4"));
    }

    #[test]
    fn test_missing_input_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        assert!(scan_input(&cfg, &EncodeSettings::default()).is_err());
    }
}
