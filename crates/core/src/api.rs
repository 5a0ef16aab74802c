//! Wire DTOs for the worker ↔ manager HTTP API.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

/// Maximum number of certificate records accepted per upload request.
pub const MAX_UPLOAD_BATCH: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub worker_name: String,
    pub category: String,
}

/// A job range handed to a worker, with the cursor to resume from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobGrant {
    pub log_name: String,
    pub log_url: String,
    pub start: u64,
    pub end: u64,
    pub current: u64,
}

/// Response to `acquire`: either a grant or `{none: true}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AcquireResponse {
    Job(JobGrant),
    None { none: bool },
}

impl AcquireResponse {
    pub fn none() -> Self {
        AcquireResponse::None { none: true }
    }

    pub fn into_grant(self) -> Option<JobGrant> {
        match self {
            AcquireResponse::Job(grant) => Some(grant),
            AcquireResponse::None { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_name: String,
    pub log_name: String,
    pub start: u64,
    pub current: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub worker_name: String,
    pub log_name: String,
    pub start: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub worker_name: String,
    pub log_name: String,
    pub start: u64,
    pub current: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub worker_name: String,
    pub log_name: String,
    pub start: u64,
    pub message: String,
}

/// One accepted CT entry as uploaded by a worker.
///
/// `ct_entry` is the verbatim Merkle leaf, base64-encoded exactly as
/// the CT log returned it in `leaf_input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub ct_entry: String,
    pub ct_log_url: String,
    pub log_name: String,
    pub worker_name: String,
    pub ct_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl UploadRecord {
    /// Decode the leaf blob back to raw bytes.
    pub fn decode_entry(&self) -> Result<Vec<u8>, base64::DecodeError> {
        B64.decode(self.ct_entry.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub inserted: u64,
    pub duplicates: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub cache_size: u64,
    pub max_size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    pub cache_stats: CacheStats,
}

/// Structured error body; always paired with a 4xx/5xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}
