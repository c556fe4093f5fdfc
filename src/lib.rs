// makeme: remote print-job host. Accepts model URLs over HTTP, prepares a
// slicer config, and runs the print toolchain one job at a time.

pub mod job_lock;
pub mod job_runner;
pub mod model_pipeline;
pub mod orchestrator;
pub mod progress;
pub mod slice_config;
pub mod web;

pub use makeme_shared::config;

pub use job_lock::{JobLock, LockGuard};
pub use orchestrator::{JobAccepted, Orchestrator, SubmitError, SubmitErrorKind};
