// Error taxonomy (spec §7). Every component gets its own enum; AppError is
// the HTTP-facing union that knows how to turn any of them into the
// `{error, message, timestamp}` body shape of §6.1.

use axum::{
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid_public_key")]
    InvalidPublicKey,
    #[error("invalid_signature")]
    InvalidSignature,
    #[error("expired_timestamp")]
    ExpiredTimestamp,
    #[error("rate_limit_exceeded")]
    RateLimitExceeded { limit: u32, window: &'static str },
    #[error("payload_too_large")]
    PayloadTooLarge,
    #[error("invalid_json")]
    InvalidJson,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("not_found")]
    NotFound,
    #[error("invalid_transition")]
    InvalidTransition { from: String, to: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("no_valid_hosts")]
    NoValidHosts,
    #[error("batch_too_large")]
    BatchTooLarge,
    #[error("transient: {0}")]
    Transient(String),
    #[error("terminal: {0}")]
    Terminal(String),
}

/// A failed job-state transition surfaces inside a durable step as either
/// retryable (the store blipped) or terminal (the transition itself is
/// invalid, or the job doesn't exist) — see §4.3/§7.
impl From<JobError> for WorkflowError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Store(store_err) => WorkflowError::Transient(store_err.to_string()),
            other => WorkflowError::Terminal(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("service_unavailable")]
    Unavailable,
    #[error("not_found")]
    NotFound,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid_ip")]
    InvalidIp,
    #[error("invalid_selector")]
    InvalidSelector,
    #[error("invalid_request")]
    InvalidRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    timestamp: String,
}

impl AppError {
    fn code_and_status(&self) -> (&'static str, StatusCode) {
        match self {
            AppError::Gate(GateError::InvalidPublicKey) => ("invalid_public_key", StatusCode::UNAUTHORIZED),
            AppError::Gate(GateError::InvalidSignature) => ("invalid_signature", StatusCode::UNAUTHORIZED),
            AppError::Gate(GateError::ExpiredTimestamp) => ("expired_timestamp", StatusCode::UNAUTHORIZED),
            AppError::Gate(GateError::RateLimitExceeded { .. }) => ("rate_limit_exceeded", StatusCode::TOO_MANY_REQUESTS),
            AppError::Gate(GateError::PayloadTooLarge) => ("payload_too_large", StatusCode::PAYLOAD_TOO_LARGE),
            AppError::Gate(GateError::InvalidJson) => ("invalid_json", StatusCode::BAD_REQUEST),
            AppError::Job(JobError::NotFound) => ("not_found", StatusCode::NOT_FOUND),
            AppError::Job(JobError::InvalidTransition { .. }) => ("invalid_transition", StatusCode::CONFLICT),
            AppError::Job(JobError::Store(StoreError::NotFound)) => ("not_found", StatusCode::NOT_FOUND),
            AppError::Job(JobError::Store(_)) => ("service_unavailable", StatusCode::SERVICE_UNAVAILABLE),
            AppError::Workflow(WorkflowError::NoValidHosts) => ("no_valid_hosts", StatusCode::UNPROCESSABLE_ENTITY),
            AppError::Workflow(WorkflowError::BatchTooLarge) => ("batch_too_large", StatusCode::BAD_REQUEST),
            AppError::Workflow(WorkflowError::Transient(_)) => ("transient_error", StatusCode::SERVICE_UNAVAILABLE),
            AppError::Workflow(WorkflowError::Terminal(_)) => ("workflow_failed", StatusCode::INTERNAL_SERVER_ERROR),
            AppError::Store(StoreError::Unavailable) => ("service_unavailable", StatusCode::SERVICE_UNAVAILABLE),
            AppError::Store(StoreError::NotFound) => ("not_found", StatusCode::NOT_FOUND),
            AppError::Store(StoreError::Sqlx(_)) => ("service_unavailable", StatusCode::SERVICE_UNAVAILABLE),
            AppError::Store(StoreError::Serde(_)) => ("service_unavailable", StatusCode::SERVICE_UNAVAILABLE),
            AppError::InvalidIp => ("invalid_ip", StatusCode::BAD_REQUEST),
            AppError::InvalidSelector => ("invalid_selector", StatusCode::BAD_REQUEST),
            AppError::InvalidRequest(_) => ("invalid_request", StatusCode::BAD_REQUEST),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (code, status) = self.code_and_status();
        let message = self.to_string();
        tracing::warn!(error = code, %message, "request_error");
        let rate_limit = match &self {
            AppError::Gate(GateError::RateLimitExceeded { limit, window }) => Some((*limit, *window)),
            _ => None,
        };
        let body = ErrorBody {
            error: code,
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Some((limit, window)) = rate_limit {
            let headers = resp.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Window", HeaderValue::from_static(window));
        }
        resp
    }
}
