// GET /health (spec §6.1, §4.5.3). Reflects store reachability and the
// optional external collaborators without making ingest depend on them.

use super::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Components {
    store: &'static str,
    embeddings: &'static str,
    workflow: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    components: Components,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store_ok = sqlx::query("SELECT 1")
        .execute(&state.store.pool)
        .await
        .is_ok();
    let embeddings_status = if state.embedding_provider.is_some() {
        "configured"
    } else {
        "unconfigured"
    };

    let status = if store_ok { "ok" } else { "degraded" };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status,
            components: Components {
                store: if store_ok { "ok" } else { "unavailable" },
                embeddings: embeddings_status,
                workflow: "ok",
            },
        }),
    )
}
