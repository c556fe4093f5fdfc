//! End-to-end print submission and status.
//!
//! Submission order: lock, validate URLs, write the slicer config, fetch,
//! normalize, launch, probe. Any failure before launch drops the lock guard,
//! which frees the lock again. Once the toolchain is running the lock
//! belongs to it.

use chrono::{DateTime, Utc};
use makeme_shared::config::{Config, JobPaths};
use makeme_shared::{LockState, PrintRequest, StatusResponse};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::job_lock::{JobLock, LockError};
use crate::job_runner::{read_pid_file, ExitReport, JobProcess, JobRunner, LaunchError, ProbeOutcome};
use crate::model_pipeline::{
    CommandNormalizer, FetchError, Fetcher, HttpFetcher, NormalizeError, NormalizeOptions, Normalizer,
};
use crate::progress::ProgressReader;
use crate::slice_config::{PersistError, SliceConfigBuilder};

/// Discriminant of a failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitErrorKind {
    Conflict,
    InvalidInput,
    Config,
    Fetch,
    Normalize,
    Launch,
    EarlyExit,
    Lock,
}

impl SubmitErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::InvalidInput => "invalid_input",
            Self::Config => "config",
            Self::Fetch => "fetch",
            Self::Normalize => "normalize",
            Self::Launch => "launch",
            Self::EarlyExit => "early_exit",
            Self::Lock => "lock",
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Print job already running")]
    AlreadyLocked(LockState),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Config(#[from] PersistError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("Process died within {} seconds with {exit}", .window.as_secs())]
    EarlyExit { exit: ExitReport, window: Duration },
    #[error(transparent)]
    Lock(LockError),
}

impl SubmitError {
    pub fn kind(&self) -> SubmitErrorKind {
        match self {
            Self::AlreadyLocked(_) => SubmitErrorKind::Conflict,
            Self::InvalidInput(_) => SubmitErrorKind::InvalidInput,
            Self::Config(_) => SubmitErrorKind::Config,
            Self::Fetch(_) => SubmitErrorKind::Fetch,
            Self::Normalize(_) => SubmitErrorKind::Normalize,
            Self::Launch(_) => SubmitErrorKind::Launch,
            Self::EarlyExit { .. } => SubmitErrorKind::EarlyExit,
            Self::Lock(_) => SubmitErrorKind::Lock,
        }
    }
}

impl From<LockError> for SubmitError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyLocked { owner_pid, acquired_at } => {
                Self::AlreadyLocked(LockState::Held { owner_pid, acquired_at })
            }
            other => Self::Lock(other),
        }
    }
}

/// A job that survived the probe window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Reject anything that is not a parseable, non-local URL.
pub fn ensure_remote(urls: &[String]) -> Result<Vec<Url>, SubmitError> {
    if urls.is_empty() {
        return Err(SubmitError::InvalidInput("Need at least one model URL".to_string()));
    }
    urls.iter()
        .map(|raw| {
            let url = Url::parse(raw).map_err(|e| SubmitError::InvalidInput(format!("Invalid URL {}: {}", raw, e)))?;
            if url.scheme().eq_ignore_ascii_case("file") {
                return Err(SubmitError::InvalidInput("Need a remote file".to_string()));
            }
            Ok(url)
        })
        .collect()
}

pub struct Orchestrator {
    paths: JobPaths,
    lock: JobLock,
    slicer: SliceConfigBuilder,
    fetcher: Arc<dyn Fetcher>,
    normalizer: Arc<dyn Normalizer>,
    runner: JobRunner,
    progress: ProgressReader,
    probe_window: Duration,
    default_temperature: f64,
}

impl Orchestrator {
    pub fn new(
        paths: JobPaths,
        lock: JobLock,
        fetcher: Arc<dyn Fetcher>,
        normalizer: Arc<dyn Normalizer>,
        toolchain_command: impl Into<String>,
    ) -> Self {
        let mut runner = JobRunner::new(toolchain_command, &paths);
        if let Some(lock_path) = lock.location() {
            runner = runner.remove_on_exit(lock_path);
        }
        Self {
            progress: ProgressReader::new(&paths.log_file),
            paths,
            lock,
            slicer: SliceConfigBuilder::new(),
            fetcher,
            normalizer,
            runner,
            probe_window: Duration::from_secs(5),
            default_temperature: 230.0,
        }
    }

    /// Production wiring from configuration.
    pub fn from_config(config: &Config) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let paths = config.paths.resolve();
        let lock = JobLock::file(&paths.lock_file);
        let fetcher = HttpFetcher::new(Duration::from_secs(config.fetch.timeout_secs), &config.fetch.user_agent)?;
        let normalizer = CommandNormalizer::new(&config.normalizer.program, config.normalizer.args.clone());
        let slicer = match &config.slicer.base_config {
            Some(path) => SliceConfigBuilder::from_base_file(&paths.root.join(path))?,
            None => SliceConfigBuilder::new(),
        };
        Ok(Self::new(paths, lock, Arc::new(fetcher), Arc::new(normalizer), &config.toolchain.command)
            .with_slicer(slicer)
            .with_probe_window(config.toolchain.probe_window())
            .with_default_temperature(config.slicer.default_temperature))
    }

    pub fn with_slicer(mut self, slicer: SliceConfigBuilder) -> Self {
        self.slicer = slicer;
        self
    }

    pub fn with_probe_window(mut self, window: Duration) -> Self {
        self.probe_window = window;
        self
    }

    pub fn with_default_temperature(mut self, temperature: f64) -> Self {
        self.default_temperature = temperature;
        self
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn lock(&self) -> &JobLock {
        &self.lock
    }

    pub fn progress(&self) -> &ProgressReader {
        &self.progress
    }

    pub async fn submit(&self, request: PrintRequest) -> Result<JobAccepted, SubmitError> {
        let guard = self.lock.acquire()?;
        let urls = ensure_remote(&request.model_urls)?;

        let temperature = request.extrusion_temp.unwrap_or(self.default_temperature);
        let config = self.slicer.build(request.quality, &request.slicer_overrides, temperature);
        config.persist(&self.paths.slicer_config_file)?;
        tracing::info!(
            "Wrote {} quality slicer config at {}°C to {}",
            request.quality,
            temperature,
            self.paths.slicer_config_file.display()
        );

        let fetched = self.fetcher.fetch(&urls, &self.paths.fetch_model_file).await?;
        let options = NormalizeOptions {
            count: request.count,
            scale: request.scale,
        };
        let model = self
            .normalizer
            .normalize(&fetched, &self.paths.current_model_file, &options)
            .await?;

        let mut process = self.runner.launch(&self.paths.slicer_config_file, &model.path)?;
        let pid = process.pid;
        if let Err(e) = guard.transfer(pid) {
            tracing::warn!("Failed to hand job lock to pid {}: {}", pid, e);
        }

        match self.runner.probe(&mut process, self.probe_window).await? {
            ProbeOutcome::RunningPresumed => {
                let accepted = JobAccepted {
                    job_id: process.job_id,
                    pid,
                    started_at: process.started_at,
                };
                self.supervise(process);
                Ok(accepted)
            }
            ProbeOutcome::FailedEarly(exit) => {
                self.lock.release_if_owner(pid)?;
                Err(SubmitError::EarlyExit {
                    exit,
                    window: self.probe_window,
                })
            }
        }
    }

    /// Reap the job in the background and free its lock if the job could not.
    fn supervise(&self, mut process: JobProcess) {
        let lock = self.lock.clone();
        tokio::spawn(async move {
            match process.wait().await {
                Ok(exit) => tracing::info!("Job {} (pid {}) finished with {}", process.job_id, process.pid, exit),
                Err(e) => tracing::warn!("Lost track of job {} (pid {}): {}", process.job_id, process.pid, e),
            }
            if let Err(e) = lock.release_if_owner(process.pid) {
                tracing::warn!("Failed to release job lock after pid {}: {}", process.pid, e);
            }
        });
    }

    /// Log, progress and lock state, read fresh from disk.
    pub async fn status(&self) -> Result<StatusResponse, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let log = self.progress.read_log().await?;
        let progress = crate::progress::parse_progress(&log);
        let lock = self.lock.inspect()?;
        let pid = match read_pid_file(&self.paths.pid_file) {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!("Ignoring unreadable pid file {}: {}", self.paths.pid_file.display(), e);
                None
            }
        };
        Ok(StatusResponse {
            log,
            progress,
            locked: lock.is_held(),
            pid,
            lock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_urls_are_rejected_case_insensitively() {
        let err = ensure_remote(&["FILE:///etc/passwd".to_string()]).unwrap_err();
        assert_eq!(err.kind(), SubmitErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "Need a remote file");
    }

    #[test]
    fn empty_and_unparseable_urls_are_rejected() {
        assert_eq!(ensure_remote(&[]).unwrap_err().kind(), SubmitErrorKind::InvalidInput);
        assert_eq!(
            ensure_remote(&["not a url".to_string()]).unwrap_err().kind(),
            SubmitErrorKind::InvalidInput
        );
    }

    #[test]
    fn remote_urls_keep_their_order() {
        let urls = ensure_remote(&["https://a.example/x.stl".to_string(), "http://b.example/y.stl".to_string()]).unwrap();
        assert_eq!(urls[0].host_str(), Some("a.example"));
        assert_eq!(urls[1].host_str(), Some("b.example"));
    }

    #[test]
    fn early_exit_message_names_the_status() {
        let err = SubmitError::EarlyExit {
            exit: ExitReport { code: Some(1), signal: None },
            window: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Process died within 5 seconds with exit status 1");
        assert_eq!(err.kind(), SubmitErrorKind::EarlyExit);
    }

    #[test]
    fn already_locked_maps_to_conflict() {
        let err: SubmitError = LockError::AlreadyLocked {
            owner_pid: Some(7),
            acquired_at: Utc::now(),
        }
        .into();
        assert_eq!(err.kind(), SubmitErrorKind::Conflict);
    }
}
