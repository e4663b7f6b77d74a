// Route table (spec §6.1). Query endpoints share the 30 req/min/user
// token-bucket class; the ingest endpoint gets its own 60/min class inside
// `ingest_handler`.

use super::state::AppState;
use super::{health, ingest, jobs, query};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;

async fn query_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, crate::error::AppError> {
    let forwarded_for = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok());
    let key = crate::ratelimit::rate_limit_key(forwarded_for, remote_addr);
    if !state.query_limiter.try_acquire(&key).await {
        return Err(crate::error::AppError::Gate(
            crate::error::GateError::RateLimitExceeded {
                limit: state.query_limiter.limit,
                window: state.query_limiter.window,
            },
        ));
    }
    Ok(next.run(request).await)
}

pub fn build(state: AppState) -> Router {
    let query_routes = Router::new()
        .route("/v1/jobs/:id", get(jobs::get_job))
        .route("/v1/jobs", get(jobs::list_jobs))
        .route("/v1/query/host/:ip", get(query::get_host))
        .route("/v1/query/graph", post(query::query_graph))
        .route("/v1/query/similar", post(query::query_similar))
        .route_layer(middleware::from_fn_with_state(state.clone(), query_rate_limit));

    Router::new()
        .route(
            "/v1/mesh/ingest",
            post(ingest::ingest_handler)
                .layer(axum::extract::DefaultBodyLimit::max(ingest::MAX_BODY_BYTES)),
        )
        .route("/health", get(health::health))
        .merge(query_routes)
        .with_state(state)
}
