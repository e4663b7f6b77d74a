// GET /v1/jobs/{id}, GET /v1/jobs (spec §6.1).

use super::state::AppState;
use crate::error::AppError;
use crate::jobs::JobFilter;
use crate::store::model::{Job, JobState};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub state: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = state.jobs.get(&id).await?;
    Ok(Json(job))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<crate::jobs::JobPage>, AppError> {
    let wanted_state = match params.state.as_deref() {
        Some("pending") => Some(JobState::Pending),
        Some("processing") => Some(JobState::Processing),
        Some("completed") => Some(JobState::Completed),
        Some("failed") => Some(JobState::Failed),
        Some(_) | None => None,
    };
    let filter = JobFilter {
        state: wanted_state,
        since: params.since,
    };
    let page = state
        .jobs
        .list(filter, params.cursor, params.limit.unwrap_or(50))
        .await?;
    Ok(Json(page))
}
