//! Shared configuration logic for the print host and its tests.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:9292"
//!
//! [paths]
//! root = "/srv/makeme"
//! log_file = "tmp/make.log"
//!
//! [toolchain]
//! command = "make GRUE_CONFIG=make-me {model_stem}"
//! probe_window_secs = 5
//!
//! [normalizer]
//! program = "stltwalker"
//! args = ["-p", "{inputs}", "-o", "{output}"]
//! ```
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! Relative entries under `[paths]` resolve against `paths.root`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const USERNAME_ENV: &str = "MAKE_ME_USERNAME";
pub const PASSWORD_ENV: &str = "MAKE_ME_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the print host.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub slicer: SlicerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

/// HTTP listener and submission credentials.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            username: default_username(),
            password: default_password(),
        }
    }
}

impl ServerConfig {
    /// Credentials with `MAKE_ME_USERNAME` / `MAKE_ME_PASSWORD` taking precedence.
    pub fn credentials(&self) -> (String, String) {
        let username = std::env::var(USERNAME_ENV).unwrap_or_else(|_| self.username.clone());
        let password = std::env::var(PASSWORD_ENV).unwrap_or_else(|_| self.password.clone());
        (username, password)
    }
}

/// Well-known file slots used by a job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_fetch_model_file")]
    pub fetch_model_file: PathBuf,
    #[serde(default = "default_current_model_file")]
    pub current_model_file: PathBuf,
    #[serde(default = "default_slicer_config_file")]
    pub slicer_config_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            lock_file: default_lock_file(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            fetch_model_file: default_fetch_model_file(),
            current_model_file: default_current_model_file(),
            slicer_config_file: default_slicer_config_file(),
        }
    }
}

impl PathsConfig {
    /// A layout with every slot at its default location under `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Resolve every slot against `root`.
    pub fn resolve(&self) -> JobPaths {
        let join = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                self.root.join(p)
            }
        };
        JobPaths {
            root: self.root.clone(),
            lock_file: join(&self.lock_file),
            pid_file: join(&self.pid_file),
            log_file: join(&self.log_file),
            fetch_model_file: join(&self.fetch_model_file),
            current_model_file: join(&self.current_model_file),
            slicer_config_file: join(&self.slicer_config_file),
        }
    }
}

/// Resolved file slots. Each is overwritten per job except the log, which accumulates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub root: PathBuf,
    pub lock_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub fetch_model_file: PathBuf,
    pub current_model_file: PathBuf,
    pub slicer_config_file: PathBuf,
}

/// External slicing/printing toolchain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolchainConfig {
    /// Shell command template; `{config}`, `{model}` and `{model_stem}` expand to quoted paths.
    #[serde(default = "default_toolchain_command")]
    pub command: String,
    #[serde(default = "default_probe_window_secs")]
    pub probe_window_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            command: default_toolchain_command(),
            probe_window_secs: default_probe_window_secs(),
        }
    }
}

impl ToolchainConfig {
    pub fn probe_window(&self) -> Duration {
        Duration::from_secs(self.probe_window_secs)
    }
}

/// External STL normalizer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_normalizer_program")]
    pub program: String,
    /// Argument template: `{inputs}` expands to every fetched file; `{output}`,
    /// `{count}` and `{scale}` substitute in place.
    #[serde(default = "default_normalizer_args")]
    pub args: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            program: default_normalizer_program(),
            args: default_normalizer_args(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlicerConfig {
    /// JSON document the computed slicer settings are merged onto.
    #[serde(default)]
    pub base_config: Option<PathBuf>,
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            base_config: None,
            default_temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.toolchain.probe_window_secs == 0 {
            return Err(ConfigError::Invalid("toolchain.probe_window_secs must be > 0".to_string()));
        }
        if self.toolchain.command.trim().is_empty() {
            return Err(ConfigError::Invalid("toolchain.command must not be empty".to_string()));
        }
        if self.normalizer.program.trim().is_empty() {
            return Err(ConfigError::Invalid("normalizer.program must not be empty".to_string()));
        }
        Ok(())
    }
}

fn default_bind() -> String { "0.0.0.0:9292".to_string() }
fn default_username() -> String { "hubot".to_string() }
fn default_password() -> String { "isalive".to_string() }
fn default_root() -> PathBuf { PathBuf::from(".") }
fn default_lock_file() -> PathBuf { PathBuf::from("tmp/make.lock") }
fn default_pid_file() -> PathBuf { PathBuf::from("tmp/make.pid") }
fn default_log_file() -> PathBuf { PathBuf::from("tmp/make.log") }
fn default_fetch_model_file() -> PathBuf { PathBuf::from("data/fetch.stl") }
fn default_current_model_file() -> PathBuf { PathBuf::from("data/print.stl") }
fn default_slicer_config_file() -> PathBuf { PathBuf::from("config/grue-make-me.config") }
fn default_toolchain_command() -> String { "make GRUE_CONFIG=make-me {model_stem}".to_string() }
fn default_probe_window_secs() -> u64 { 5 }
fn default_normalizer_program() -> String { "stltwalker".to_string() }
fn default_normalizer_args() -> Vec<String> {
    vec![
        "-p".to_string(),
        "{inputs}".to_string(),
        "-o".to_string(),
        "{output}".to_string(),
        "--copies={count}".to_string(),
        "--scale={scale}".to_string(),
    ]
}
fn default_temperature() -> f64 { 230.0 }
fn default_fetch_timeout_secs() -> u64 { 120 }
fn default_user_agent() -> String { "makeme".to_string() }

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path.display(), e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9292");
        assert_eq!(config.toolchain.probe_window(), Duration::from_secs(5));
        assert_eq!(config.slicer.default_temperature, 230.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let toml_str = r#"
            [paths]
            root = "/srv/makeme"
            log_file = "/var/log/make.log"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let paths = config.paths.resolve();
        assert_eq!(paths.pid_file, PathBuf::from("/srv/makeme/tmp/make.pid"));
        assert_eq!(paths.current_model_file, PathBuf::from("/srv/makeme/data/print.stl"));
        assert_eq!(paths.log_file, PathBuf::from("/var/log/make.log"));
    }

    #[test]
    fn zero_probe_window_is_rejected() {
        let config: Config = toml::from_str("[toolchain]\nprobe_window_secs = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_config("/nonexistent/makeme.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
