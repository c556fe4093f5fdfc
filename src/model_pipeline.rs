//! Fetch remote model files and normalize them into the single printable model.
//!
//! Both stages are collaborators behind traits. The HTTP fetcher and the
//! command-line normalizer here are the production implementations; tests
//! swap in fakes.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("No model URLs given")]
    NoUrls,
    #[error("Request for {url} failed: {source}")]
    Http { url: Url, source: reqwest::Error },
    #[error("Download of {url} failed: HTTP {status}")]
    Status { url: Url, status: reqwest::StatusCode },
    #[error("Failed to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Model input {0} is missing")]
    MissingInput(PathBuf),
    #[error("Model input {0} is empty")]
    EmptyInput(PathBuf),
    #[error("Failed to run normalizer: {0}")]
    Spawn(io::Error),
    #[error("Normalizer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Normalizer produced no output at {0}")]
    EmptyOutput(PathBuf),
}

/// Downloaded model files, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedModel {
    pub files: Vec<PathBuf>,
}

/// The merged, printable model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedModel {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormalizeOptions {
    pub count: Option<u32>,
    pub scale: Option<f64>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `urls` next to `destination`. Callers must reject local-file URLs first.
    async fn fetch(&self, urls: &[Url], destination: &Path) -> Result<FetchedModel, FetchError>;
}

#[async_trait]
pub trait Normalizer: Send + Sync {
    /// Merge `input` into one model at `output`, replacing any previous one.
    async fn normalize(
        &self,
        input: &FetchedModel,
        output: &Path,
        options: &NormalizeOptions,
    ) -> Result<NormalizedModel, NormalizeError>;
}

/// Slot for the `index`-th download: `destination` itself, then `fetch-1.stl`, `fetch-2.stl`, ...
pub fn fetch_slot(destination: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return destination.to_path_buf();
    }
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fetch".to_string());
    let name = match destination.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    destination.with_file_name(name)
}

/// Downloads over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| FetchError::Http { url: url.clone(), source })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.clone(),
                status: response.status(),
            });
        }

        let io_err = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| FetchError::Http { url: url.clone(), source })?;
            file.write_all(&chunk).await.map_err(io_err)?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        Ok(downloaded)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, urls: &[Url], destination: &Path) -> Result<FetchedModel, FetchError> {
        if urls.is_empty() {
            return Err(FetchError::NoUrls);
        }
        let mut files = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let dest = fetch_slot(destination, index);
            let bytes = self.download(url, &dest).await?;
            tracing::info!("Fetched {} ({} bytes) to {}", url, bytes, dest.display());
            files.push(dest);
        }
        Ok(FetchedModel { files })
    }
}

/// Runs an external normalizer program built from an argument template.
#[derive(Debug, Clone)]
pub struct CommandNormalizer {
    program: String,
    args: Vec<String>,
}

impl CommandNormalizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Expand the template. `{inputs}` becomes one argument per input file;
    /// arguments naming an option that was not requested are dropped.
    pub fn render_args(&self, inputs: &[PathBuf], output: &Path, options: &NormalizeOptions) -> Vec<String> {
        let mut rendered = Vec::new();
        for arg in &self.args {
            if arg == "{inputs}" {
                rendered.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
                continue;
            }
            let mut arg = arg.replace("{output}", &output.to_string_lossy());
            if arg.contains("{count}") {
                match options.count {
                    Some(count) => arg = arg.replace("{count}", &count.to_string()),
                    None => continue,
                }
            }
            if arg.contains("{scale}") {
                match options.scale {
                    Some(scale) => arg = arg.replace("{scale}", &scale.to_string()),
                    None => continue,
                }
            }
            rendered.push(arg);
        }
        rendered
    }
}

async fn non_empty(path: &Path) -> Result<(), NormalizeError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() == 0 => Err(NormalizeError::EmptyInput(path.to_path_buf())),
        Ok(_) => Ok(()),
        Err(_) => Err(NormalizeError::MissingInput(path.to_path_buf())),
    }
}

#[async_trait]
impl Normalizer for CommandNormalizer {
    async fn normalize(
        &self,
        input: &FetchedModel,
        output: &Path,
        options: &NormalizeOptions,
    ) -> Result<NormalizedModel, NormalizeError> {
        for file in &input.files {
            non_empty(file).await?;
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(NormalizeError::Spawn)?;
        }
        // Never report a stale model from a previous job.
        match tokio::fs::remove_file(output).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(NormalizeError::Spawn(e)),
        }

        let args = self.render_args(&input.files, output, options);
        tracing::debug!("Running normalizer: {} {:?}", self.program, args);
        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(NormalizeError::Spawn)?;
        if !result.status.success() {
            return Err(NormalizeError::Failed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Err(NormalizeError::EmptyOutput(output.to_path_buf())),
        }
        tracing::info!("Normalized {} input(s) into {}", input.files.len(), output.display());
        Ok(NormalizedModel {
            path: output.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_slots_number_extra_files() {
        let dest = Path::new("/srv/data/fetch.stl");
        assert_eq!(fetch_slot(dest, 0), PathBuf::from("/srv/data/fetch.stl"));
        assert_eq!(fetch_slot(dest, 2), PathBuf::from("/srv/data/fetch-2.stl"));
    }

    #[test]
    fn template_drops_unrequested_options() {
        let normalizer = CommandNormalizer::new(
            "stltwalker",
            ["-p", "{inputs}", "-o", "{output}", "--copies={count}", "--scale={scale}"]
                .map(String::from)
                .to_vec(),
        );
        let inputs = vec![PathBuf::from("a.stl"), PathBuf::from("b.stl")];
        let args = normalizer.render_args(&inputs, Path::new("print.stl"), &NormalizeOptions::default());
        assert_eq!(args, ["-p", "a.stl", "b.stl", "-o", "print.stl"]);

        let options = NormalizeOptions { count: Some(4), scale: Some(1.5) };
        let args = normalizer.render_args(&inputs[..1], Path::new("print.stl"), &options);
        assert_eq!(args, ["-p", "a.stl", "-o", "print.stl", "--copies=4", "--scale=1.5"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_normalizer_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("fetch.stl");
        std::fs::write(&input, b"solid cube\nendsolid cube\n").unwrap();
        let output = dir.path().join("data/print.stl");

        let normalizer = CommandNormalizer::new("cp", vec!["{inputs}".into(), "{output}".into()]);
        let model = normalizer
            .normalize(&FetchedModel { files: vec![input] }, &output, &NormalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(model.path, output);
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn zero_byte_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("fetch.stl");
        std::fs::write(&input, b"").unwrap();
        let normalizer = CommandNormalizer::new("cp", vec!["{inputs}".into(), "{output}".into()]);
        let err = normalizer
            .normalize(
                &FetchedModel { files: vec![input.clone()] },
                &dir.path().join("print.stl"),
                &NormalizeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizeError::EmptyInput(p) if p == input));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("fetch.stl");
        std::fs::write(&input, b"solid").unwrap();
        let normalizer = CommandNormalizer::new("false", Vec::new());
        let err = normalizer
            .normalize(&FetchedModel { files: vec![input] }, &dir.path().join("print.stl"), &NormalizeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Failed { .. }));
    }

    #[tokio::test]
    async fn fetch_without_urls_fails() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1), "makeme-test").unwrap();
        let err = fetcher.fetch(&[], Path::new("fetch.stl")).await.unwrap_err();
        assert!(matches!(err, FetchError::NoUrls));
    }
}
