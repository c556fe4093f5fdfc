// src/main.rs - print host entry point
use clap::{Parser, Subcommand};
use makeme::config::{self, Config};
use makeme::job_lock::JobLock;
use makeme::job_runner::kill_job;
use makeme::orchestrator::Orchestrator;
use makeme::web;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "makeme-host", version, about = "Remote print-job host")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "makeme.toml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Print the current job status as JSON
    Status,
    /// Terminate the running job and free the lock
    Kill {
        /// Seconds to wait after SIGTERM before sending SIGKILL
        #[arg(long, default_value_t = 5)]
        grace: u64,
    },
    /// Remove the job lock without touching any process
    Unlock,
}

fn load(path: &Path) -> Result<Config, config::ConfigError> {
    if !path.exists() {
        tracing::warn!("Config file '{}' not found, using defaults", path.display());
        return Ok(Config::default());
    }
    tracing::info!("Loading configuration from: {}", path.display());
    config::load_config(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = load(&cli.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", cli.config.display(), e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Status => {
            let status = Orchestrator::from_config(&config)?.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Kill { grace } => {
            let paths = config.paths.resolve();
            match kill_job(&paths.pid_file, Duration::from_secs(grace)).await? {
                Some(pid) => tracing::info!("Terminated job pid {}", pid),
                None => tracing::info!("No job recorded in {}", paths.pid_file.display()),
            }
            JobLock::file(&paths.lock_file).release()?;
            Ok(())
        }
        Command::Unlock => {
            let paths = config.paths.resolve();
            JobLock::file(&paths.lock_file).release()?;
            tracing::info!("Removed job lock {}", paths.lock_file.display());
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing::info!("Starting makeme print host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    let paths = config.paths.resolve();
    tracing::info!("Job root: {}", paths.root.display());
    tracing::info!("Toolchain: {}", config.toolchain.command);

    let app = web::api::app(config)?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
