// makeme_shared: configuration, wire types and auth traits shared by the print host and its clients

pub mod api_models;
pub mod auth_backend;
pub mod config;

pub use api_models::{LockState, PrintRequest, QualityPreset, StatusResponse};
pub use auth_backend::StaticCredentials;

use async_trait::async_trait;

// AuthBackend trait
#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
    /// Validate credentials. Returns true if valid.
    async fn validate(&self, username: &str, password: &str) -> bool;
}
