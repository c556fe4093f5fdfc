//! Contains the data models for API responses.
//!
//! Request and status payloads live in `makeme_shared::api_models`.

use makeme_shared::LockState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body returned when a job survives the probe window.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitAccepted {
    pub result: String,
    pub job_id: Uuid,
    pub pid: u32,
}

/// Body of every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Failed stage, e.g. `conflict`, `fetch`, `normalize`, `early_exit`.
    pub kind: String,
    /// Current holder when the lock was busy.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lock: Option<LockState>,
}
