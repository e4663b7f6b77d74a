// GET /v1/query/host/{ip}, POST /v1/query/graph, POST /v1/query/similar
// (spec §6.1, §4.5.2).

use super::state::AppState;
use crate::error::AppError;
use crate::store::query::{GraphPage, GraphSelector};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct HostQueryParams {
    pub depth: Option<u8>,
}

pub async fn get_host(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Query(params): Query<HostQueryParams>,
) -> Result<Json<crate::store::query::HostView>, AppError> {
    if IpAddr::from_str(&ip).is_err() {
        return Err(AppError::InvalidIp);
    }
    let depth = params.depth.unwrap_or(1).min(5);
    let view = state
        .store
        .get_host(&ip, depth)
        .await
        .map_err(AppError::Store)?
        .ok_or(AppError::Store(crate::error::StoreError::NotFound))?;
    Ok(Json(view))
}

pub async fn query_graph(
    State(state): State<AppState>,
    Json(selector): Json<GraphSelector>,
) -> Result<Json<GraphPage>, AppError> {
    if let Some(limit) = selector.limit {
        if limit == 0 {
            return Err(AppError::InvalidSelector);
        }
    }
    let page = state
        .store
        .query_graph(&selector)
        .await
        .map_err(AppError::Store)?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct SimilarRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: u8,
}

fn default_k() -> u8 {
    10
}

#[derive(Debug, Serialize)]
pub struct SimilarResultItem {
    pub cve_id: String,
    pub title: String,
    pub summary: String,
    pub cvss: Option<f32>,
    pub cpe: Vec<String>,
    pub published_date: Option<chrono::DateTime<chrono::Utc>>,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct SimilarResponse {
    pub query: String,
    pub results: Vec<SimilarResultItem>,
    pub count: usize,
    pub timestamp: String,
}

pub async fn query_similar(
    State(state): State<AppState>,
    Json(req): Json<SimilarRequest>,
) -> Result<Json<SimilarResponse>, AppError> {
    if req.query.is_empty() || req.query.len() > 500 || req.k == 0 || req.k > 50 {
        return Err(AppError::InvalidRequest(
            "query must be 1..=500 chars and k must be 1..=50".to_string(),
        ));
    }

    let Some(embedding_provider) = &state.embedding_provider else {
        return Err(AppError::Store(crate::error::StoreError::Unavailable));
    };

    let embedding = embedding_provider
        .embed(&req.query)
        .await
        .map_err(|_| AppError::Store(crate::error::StoreError::Unavailable))?;

    let scored = state
        .store
        .query_similar(&embedding, req.k)
        .await
        .map_err(AppError::Store)?;

    let results: Vec<SimilarResultItem> = scored
        .into_iter()
        .map(|(cve_id, doc, score)| SimilarResultItem {
            cve_id,
            title: doc.title,
            summary: doc.summary,
            cvss: doc.cvss,
            cpe: doc.cpe,
            published_date: doc.published,
            score,
        })
        .collect();

    Ok(Json(SimilarResponse {
        query: req.query,
        count: results.len(),
        results,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}
