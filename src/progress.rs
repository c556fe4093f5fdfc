//! Progress extraction from the append-only job log.
//!
//! The toolchain reports transfer progress as `Sent <done>/<total> [<percent>%]`.
//! The last marker in the file wins, even if it is lower than an earlier one.
//! Nothing is cached: every call re-reads the whole log.

use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PROGRESS_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Sent \d+/\d+ \[(\d+)%\]").expect("progress marker regex is valid"));

/// Percent from the last marker in `log`, clamped to 100; 0 without a marker.
pub fn parse_progress(log: &str) -> u8 {
    let mut progress = 0;
    for line in log.lines() {
        // First marker on a line counts for that line.
        if let Some(caps) = PROGRESS_MARKER.captures(line.trim()) {
            progress = caps[1].parse::<u64>().map_or(100, |p| p.min(100) as u8);
        }
    }
    progress
}

#[derive(Debug, Clone)]
pub struct ProgressReader {
    log_path: PathBuf,
}

impl ProgressReader {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self { log_path: log_path.into() }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Full log text; empty when the log does not exist yet.
    pub async fn read_log(&self) -> io::Result<String> {
        match tokio::fs::read(&self.log_path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn current_progress(&self) -> io::Result<u8> {
        Ok(parse_progress(&self.read_log().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_marker_wins_even_when_lower() {
        let log = "Sent 10/100 [10%]\nSent 55/100 [55%]\nSent 30/100 [30%]\n";
        assert_eq!(parse_progress(log), 30);
    }

    #[test]
    fn no_marker_is_zero() {
        assert_eq!(parse_progress(""), 0);
        assert_eq!(parse_progress("slicing...\nheating extruder\n"), 0);
    }

    #[test]
    fn lines_without_markers_do_not_reset() {
        let log = "Sent 1/4 [25%]\nprinting layer 3\n\n";
        assert_eq!(parse_progress(log), 25);
    }

    #[test]
    fn marker_may_be_embedded_in_a_line() {
        let log = "  [s3g] Sent 512/1024 [50%] remaining 3m  \r\n";
        assert_eq!(parse_progress(log), 50);
    }

    #[test]
    fn first_marker_on_a_line_is_used() {
        assert_eq!(parse_progress("Sent 1/10 [10%] Sent 2/10 [20%]"), 10);
    }

    #[test]
    fn out_of_range_percent_is_clamped() {
        assert_eq!(parse_progress("Sent 5/4 [125%]"), 100);
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ProgressReader::new(dir.path().join("make.log"));
        assert_eq!(reader.read_log().await.unwrap(), "");
        assert_eq!(reader.current_progress().await.unwrap(), 0);
    }
}
