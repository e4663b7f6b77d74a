// POST /v1/mesh/ingest (spec §6.1). Wires the Signature & Rate Gate (C1)
// in front of job creation and hands the verified batch to the durable
// ingest workflow (C3).

use super::state::AppState;
use crate::crypto::{verify_envelope, EnvelopeWire};
use crate::error::{AppError, GateError};
use crate::workflow::{asn, geo, ingest};
use crate::workflow::asn::AsnEnrichRequest;
use crate::workflow::geo::GeoEnrichRequest;
use crate::workflow::ingest::IngestRequest;
use axum::extract::{ConnectInfo, State};
use base64::{engine::general_purpose::STANDARD, Engine};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;

/// axum's own `DefaultBodyLimit` is set to this in `routes::build` so a
/// valid envelope up to this size is never rejected at extraction before it
/// reaches the explicit check below (which is what actually produces the
/// spec's `{error,message,timestamp}` body for `payload_too_large`).
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Serialize)]
pub struct IngestAccepted {
    job_id: String,
    status: &'static str,
    message: &'static str,
    timestamp: String,
}

pub async fn ingest_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(axum::http::StatusCode, Json<IngestAccepted>), AppError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(AppError::Gate(GateError::PayloadTooLarge));
    }

    let envelope: EnvelopeWire =
        serde_json::from_slice(&body).map_err(|_| AppError::Gate(GateError::InvalidJson))?;

    let forwarded_for = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok());
    let rl_key = crate::ratelimit::rate_limit_key(forwarded_for, remote_addr);
    if !state.ingest_limiter.try_acquire(&rl_key).await {
        return Err(AppError::Gate(GateError::RateLimitExceeded {
            limit: state.ingest_limiter.limit,
            window: state.ingest_limiter.window,
        }));
    }

    let verified = verify_envelope(&envelope, Utc::now().timestamp())?;
    let scanner_key = STANDARD.encode(verified.public_key);

    let job_id = state
        .jobs
        .create(&scanner_key)
        .await
        .map_err(AppError::Store)?;

    tracing::info!(
        job_id = %job_id,
        pubkey_prefix = %&scanner_key[..8.min(scanner_key.len())],
        data_size = verified.data_bytes.len(),
        timestamp = envelope.timestamp,
        "ingest_accepted"
    );

    let job_id_for_workflow = job_id.clone();
    let store = state.store.clone();
    let jobs = state.jobs.clone();
    let asn_resolver = state.asn_resolver.clone();
    let geo_db = state.geo_db.clone();
    tokio::spawn(async move {
        let req = IngestRequest {
            job_id: job_id_for_workflow.clone(),
            scanner_key: scanner_key.clone(),
            raw_bytes: verified.data_bytes,
        };
        let result = match ingest::run(&store, &jobs, req).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job_id = %job_id_for_workflow, error = %e, "ingest_workflow_failed");
                return;
            }
        };

        if result.hosts.is_empty() {
            return;
        }

        // C4 enrichment is triggered on the hosts this batch touched (§2:
        // "C4 workflows are triggered on the same or subsequent batches").
        let asn_req = AsnEnrichRequest {
            job_id: format!("{job_id_for_workflow}-asn"),
            ips: result.hosts.clone(),
            force_refresh: false,
        };
        if let Err(e) = asn::run(&store, asn_resolver.as_ref(), asn_req).await {
            tracing::warn!(job_id = %job_id_for_workflow, error = %e, "asn_enrichment_failed");
        }

        let geo_req = GeoEnrichRequest {
            job_id: format!("{job_id_for_workflow}-geo"),
            ips: result.hosts,
        };
        if let Err(e) = geo::run(&store, geo_db.as_ref(), geo_req).await {
            tracing::warn!(job_id = %job_id_for_workflow, error = %e, "geo_enrichment_failed");
        }
    });

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(IngestAccepted {
            job_id,
            status: "accepted",
            message: "batch queued for processing",
            timestamp: Utc::now().to_rfc3339(),
        }),
    ))
}
