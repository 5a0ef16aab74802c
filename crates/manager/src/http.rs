//! The worker-facing HTTP control surface.
//!
//! Every response is structured JSON: success bodies carry the result
//! counts, failures carry `{error}` with a 4xx/5xx status. The manager
//! never surfaces a bare error string to a worker.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::{info, warn};

use ctsieve_core::api::{
    AcquireRequest, AcquireResponse, ApiError, CacheStatsResponse, CompleteRequest, ErrorReport,
    HeartbeatRequest, MAX_UPLOAD_BATCH, OkResponse, ResumeRequest, UploadRecord, UploadResponse,
};

use crate::cache::DedupCache;
use crate::coordinator::Coordinator;
use crate::ingest::ingest_batch;
use crate::store::{CompleteOutcome, HeartbeatOutcome, Store, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub coordinator: Arc<Coordinator>,
    pub cache: Arc<DedupCache>,
}

pub(crate) enum Failure {
    Conflict(String),
    TooLarge(String),
    Internal(String),
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure::Internal(err.to_string())
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Failure::Conflict(error) => (StatusCode::CONFLICT, error),
            Failure::TooLarge(error) => (StatusCode::PAYLOAD_TOO_LARGE, error),
            Failure::Internal(error) => {
                warn!("request failed: {error}");
                (StatusCode::INTERNAL_SERVER_ERROR, error)
            }
        };
        (status, Json(ApiError { error })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/worker/acquire", post(acquire))
        .route("/api/worker/heartbeat", post(heartbeat))
        .route("/api/worker/upload", post(upload))
        .route("/api/worker/complete", post(complete))
        .route("/api/worker/resume", post(resume))
        .route("/api/worker/error", post(report_error))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", post(cache_clear))
        .with_state(state)
}

async fn health() -> Json<OkResponse> {
    Json(OkResponse::ok())
}

async fn acquire(
    State(state): State<AppState>,
    Json(req): Json<AcquireRequest>,
) -> Result<Json<AcquireResponse>, Failure> {
    let grant = state.coordinator.acquire(&req.worker_name, &req.category)?;
    Ok(Json(match grant {
        Some(grant) => AcquireResponse::Job(grant),
        None => AcquireResponse::none(),
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<OkResponse>, Failure> {
    match state
        .coordinator
        .heartbeat(&req.worker_name, &req.log_name, req.start, req.current)?
    {
        HeartbeatOutcome::Ok => Ok(Json(OkResponse::ok())),
        HeartbeatOutcome::NotOwner => Err(Failure::Conflict(format!(
            "{} [{}..] is not assigned to {}",
            req.log_name, req.start, req.worker_name
        ))),
    }
}

async fn upload(
    State(state): State<AppState>,
    Json(records): Json<Vec<UploadRecord>>,
) -> Result<Json<UploadResponse>, Failure> {
    if records.len() > MAX_UPLOAD_BATCH {
        return Err(Failure::TooLarge(format!(
            "batch of {} exceeds the {MAX_UPLOAD_BATCH}-record limit",
            records.len()
        )));
    }
    let response = ingest_batch(&state.store, &state.cache, records)?;
    Ok(Json(response))
}

async fn complete(
    State(state): State<AppState>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<OkResponse>, Failure> {
    match state
        .coordinator
        .complete(&req.worker_name, &req.log_name, req.start)?
    {
        CompleteOutcome::Ok => Ok(Json(OkResponse::ok())),
        CompleteOutcome::NotOwner => Err(Failure::Conflict(format!(
            "{} [{}..] is not assigned to {}",
            req.log_name, req.start, req.worker_name
        ))),
        CompleteOutcome::NotFinished => Err(Failure::Conflict(format!(
            "{} [{}..] has not reached its end index",
            req.log_name, req.start
        ))),
    }
}

async fn resume(
    State(state): State<AppState>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<OkResponse>, Failure> {
    match state
        .coordinator
        .resume(&req.worker_name, &req.log_name, req.start, req.current)?
    {
        HeartbeatOutcome::Ok => Ok(Json(OkResponse::ok())),
        HeartbeatOutcome::NotOwner => Err(Failure::Conflict(format!(
            "{} [{}..] is not assigned to {}",
            req.log_name, req.start, req.worker_name
        ))),
    }
}

async fn report_error(
    State(state): State<AppState>,
    Json(report): Json<ErrorReport>,
) -> Result<Json<OkResponse>, Failure> {
    warn!(
        worker = %report.worker_name,
        log = %report.log_name,
        start = report.start,
        "worker reported range failure: {}",
        report.message
    );
    state.coordinator.fail(&report.log_name, report.start)?;
    Ok(Json(OkResponse::ok()))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        cache_stats: state.cache.stats(),
    })
}

async fn cache_clear(State(state): State<AppState>) -> Json<OkResponse> {
    info!("cache cleared by operator request");
    state.cache.clear();
    Json(OkResponse::ok())
}
