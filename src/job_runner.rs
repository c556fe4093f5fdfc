//! Launches the slicing/printing toolchain as a detached process.
//!
//! Launching is split in two phases: [`JobRunner::launch`] spawns and
//! returns immediately, then [`JobRunner::probe`] waits a bounded window.
//! A process still running when the window closes is presumed to be
//! printing; one that exits inside it is a fast failure.
//!
//! The toolchain runs under `sh -c` with its output appended to the job
//! log. The command itself runs in a subshell, so even an `exit` inside it
//! reaches the cleanup: the pid file and lock record are removed and the
//! shell exits with the toolchain's own status.

use chrono::{DateTime, Utc};
use makeme_shared::config::JobPaths;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::{Child, Command};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to open job log {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },
    #[error("Failed to spawn toolchain: {0}")]
    Spawn(io::Error),
    #[error("Spawned toolchain has no pid")]
    MissingPid,
    #[error("Failed to write pid file {path}: {source}")]
    PidFile { path: PathBuf, source: io::Error },
    #[error("Failed waiting on toolchain: {0}")]
    Wait(io::Error),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Result of the bounded wait after launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Still running when the window closed.
    RunningPresumed,
    /// Exited inside the window.
    FailedEarly(ExitReport),
}

/// A launched job.
#[derive(Debug)]
pub struct JobProcess {
    pub job_id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    child: Child,
}

impl JobProcess {
    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> io::Result<ExitReport> {
        Ok(self.child.wait().await?.into())
    }
}

#[derive(Debug, Clone)]
pub struct JobRunner {
    command: String,
    working_dir: PathBuf,
    log_path: PathBuf,
    pid_path: PathBuf,
    cleanup: Vec<PathBuf>,
}

impl JobRunner {
    pub fn new(command: impl Into<String>, paths: &JobPaths) -> Self {
        Self {
            command: command.into(),
            working_dir: paths.root.clone(),
            log_path: paths.log_file.clone(),
            pid_path: paths.pid_file.clone(),
            cleanup: Vec::new(),
        }
    }

    /// Another file the job deletes on completion (the lock record).
    pub fn remove_on_exit(mut self, path: impl Into<PathBuf>) -> Self {
        self.cleanup.push(path.into());
        self
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Toolchain command with placeholders expanded.
    pub fn render_command(&self, config: &Path, model: &Path) -> String {
        self.command
            .replace("{config}", &shell_quote(config))
            .replace("{model_stem}", &shell_quote(&model.with_extension("")))
            .replace("{model}", &shell_quote(model))
    }

    fn script(&self, config: &Path, model: &Path) -> String {
        let removals: Vec<String> = std::iter::once(&self.pid_path)
            .chain(self.cleanup.iter())
            .map(|p| shell_quote(p))
            .collect();
        format!(
            "({}); status=$?; rm -f {}; exit $status",
            self.render_command(config, model),
            removals.join(" ")
        )
    }

    /// Spawn the toolchain and record its pid. Returns without waiting.
    pub fn launch(&self, config: &Path, model: &Path) -> Result<JobProcess, LaunchError> {
        let log = open_log(&self.log_path).map_err(|source| LaunchError::LogFile {
            path: self.log_path.clone(),
            source,
        })?;
        let stderr = log.try_clone().map_err(|source| LaunchError::LogFile {
            path: self.log_path.clone(),
            source,
        })?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(self.script(config, model))
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        // Own process group: the job outlives the host's terminal signals and can be killed as a unit.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;
        let pid = child.id().ok_or(LaunchError::MissingPid)?;
        if let Err(source) = write_pid_file(&self.pid_path, pid) {
            // An untracked job cannot be inspected or killed later.
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to stop untracked job pid {}: {}", pid, e);
            }
            return Err(LaunchError::PidFile {
                path: self.pid_path.clone(),
                source,
            });
        }

        let process = JobProcess {
            job_id: Uuid::new_v4(),
            pid,
            started_at: Utc::now(),
            log_path: self.log_path.clone(),
            child,
        };
        tracing::info!(
            "Launched job {} as pid {} (log: {})",
            process.job_id,
            pid,
            process.log_path.display()
        );
        Ok(process)
    }

    /// Wait at most `window` for the process to exit.
    pub async fn probe(&self, process: &mut JobProcess, window: Duration) -> Result<ProbeOutcome, LaunchError> {
        match tokio::time::timeout(window, process.child.wait()).await {
            Ok(Ok(status)) => {
                let report = ExitReport::from(status);
                tracing::warn!("Job {} (pid {}) exited within {:?}: {}", process.job_id, process.pid, window, report);
                Ok(ProbeOutcome::FailedEarly(report))
            }
            Ok(Err(e)) => Err(LaunchError::Wait(e)),
            Err(_) => {
                tracing::info!("Job {} (pid {}) still running after {:?}", process.job_id, process.pid, window);
                Ok(ProbeOutcome::RunningPresumed)
            }
        }
    }
}

fn open_log(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Single-quote a path for `sh`.
pub fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Write the pid file atomically (temp file + rename).
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    writeln!(tmp, "{}", pid)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Pid recorded for the running job, if any.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    content
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "missing or invalid PID"))
}

/// Check if a PID exists, using the null signal.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // Exists but owned by someone else.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Terminate the job recorded in `pid_file`: SIGTERM to its process group,
/// SIGKILL if it is still alive after `grace`. Removes the pid file.
///
/// Returns the pid that was signalled, or `None` when no job was recorded.
#[cfg(unix)]
pub async fn kill_job(pid_file: &Path, grace: Duration) -> io::Result<Option<u32>> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = read_pid_file(pid_file)? else {
        return Ok(None);
    };
    let raw = i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pid out of range"))?;
    let group = Pid::from_raw(raw);

    match killpg(group, Signal::SIGTERM) {
        Ok(()) => {
            let polls = (grace.as_millis() / 100).max(1);
            for _ in 0..polls {
                if !pid_alive(pid) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if pid_alive(pid) {
                tracing::warn!("Job pid {} ignored SIGTERM, sending SIGKILL", pid);
                match killpg(group, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(io::Error::other(e)),
                }
            }
        }
        Err(Errno::ESRCH) => tracing::debug!("Job pid {} already gone", pid),
        Err(e) => return Err(io::Error::other(e)),
    }

    match std::fs::remove_file(pid_file) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(Some(pid))
}

#[cfg(not(unix))]
pub async fn kill_job(_pid_file: &Path, _grace: Duration) -> io::Result<Option<u32>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "killing jobs is only supported on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use makeme_shared::config::PathsConfig;

    #[test]
    fn placeholders_expand_to_quoted_paths() {
        let paths = PathsConfig::under("/srv").resolve();
        let runner = JobRunner::new("make GRUE_CONFIG={config} {model_stem} && cat {model}", &paths);
        let rendered = runner.render_command(Path::new("/srv/c.config"), Path::new("/srv/data/print.stl"));
        assert_eq!(
            rendered,
            "make GRUE_CONFIG='/srv/c.config' '/srv/data/print' && cat '/srv/data/print.stl'"
        );
    }

    #[test]
    fn script_preserves_toolchain_status_and_cleans_up() {
        let paths = PathsConfig::under("/srv").resolve();
        let runner = JobRunner::new("true", &paths).remove_on_exit("/srv/tmp/make.lock");
        let script = runner.script(Path::new("c"), Path::new("m.stl"));
        assert_eq!(
            script,
            "(true); status=$?; rm -f '/srv/tmp/make.pid' '/srv/tmp/make.lock'; exit $status"
        );
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(shell_quote(Path::new("it's.stl")), r"'it'\''s.stl'");
    }

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmp/make.pid");
        assert_eq!(read_pid_file(&path).unwrap(), None);
        write_pid_file(&path, 4242).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(4242));
    }

    #[test]
    fn garbage_pid_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("make.pid");
        std::fs::write(&path, "not a pid").unwrap();
        let err = read_pid_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(i32::MAX as u32));
        assert!(!pid_alive(0));
    }

    #[test]
    fn exit_report_display() {
        let report = ExitReport { code: Some(1), signal: None };
        assert_eq!(report.to_string(), "exit status 1");
        let report = ExitReport { code: None, signal: Some(9) };
        assert_eq!(report.to_string(), "signal 9");
    }
}
