// Job Registry (C2, spec §4.2). The sole place the `pending -> processing ->
// {completed, failed}` state machine is enforced (§3 invariant) — callers
// outside this module must never write to the `job` table directly.

use crate::error::{JobError, StoreError};
use crate::ids::new_job_id;
use crate::store::model::{Job, JobState, T_JOB};
use crate::store::Store;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub since: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub next_cursor: Option<String>,
}

#[derive(Clone)]
pub struct JobRegistry {
    store: Store,
}

impl JobRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Authoritative job creation — happens exactly once, at ingest (§9 Open
    /// Question, resolved in DESIGN.md: the workflow only transitions, it
    /// never creates).
    pub async fn create(&self, scanner_key: &str) -> Result<String, crate::error::StoreError> {
        let id = new_job_id().to_string();
        let now = Utc::now();
        self.store
            .upsert_node(
                T_JOB,
                &id,
                json!({
                    "id": id,
                    "state": JobState::Pending,
                    "scanner_key": scanner_key,
                    "created_at": now,
                    "updated_at": now,
                    "completed_at": null,
                    "host_count": 0,
                    "port_count": 0,
                    "error_message": null,
                }),
                json!({}),
            )
            .await?;
        Ok(id)
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, JobError> {
        let fields = self
            .store
            .get_node(T_JOB, job_id)
            .await
            .map_err(JobError::Store)?
            .ok_or(JobError::NotFound)?;
        serde_json::from_value(fields).map_err(|e| JobError::Store(StoreError::Serde(e)))
    }

    /// Atomic state transition, subject to the transition table. No-ops
    /// (returns Ok without touching the row) if already in the target
    /// state.
    pub async fn transition(
        &self,
        job_id: &str,
        target: JobState,
        error_message: Option<String>,
    ) -> Result<Job, JobError> {
        let current = self.get(job_id).await?;
        if current.state == target {
            return Ok(current);
        }
        if !current.state.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                from: current.state.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }

        let now = Utc::now();
        let mut patch = json!({
            "state": target,
            "updated_at": now,
        });
        if target.is_terminal() {
            patch["completed_at"] = json!(now);
        }
        if let Some(msg) = error_message {
            patch["error_message"] = json!(msg);
        }

        let fields = self
            .store
            .upsert_node(T_JOB, job_id, json!({}), patch)
            .await
            .map_err(JobError::Store)?;
        serde_json::from_value(fields).map_err(|e| JobError::Store(StoreError::Serde(e)))
    }

    /// Records the host/port counts produced by the ingest workflow's
    /// `persist` step, without changing state.
    pub async fn record_counts(
        &self,
        job_id: &str,
        host_count: u64,
        port_count: u64,
    ) -> Result<(), JobError> {
        self.store
            .upsert_node(
                T_JOB,
                job_id,
                json!({}),
                json!({
                    "host_count": host_count,
                    "port_count": port_count,
                    "updated_at": Utc::now(),
                }),
            )
            .await
            .map_err(JobError::Store)?;
        Ok(())
    }

    /// Time-ordered, filterable listing (§4.2). Kept simple — since job ids
    /// are UUIDv7 (time-ordered), sorting by id is sorting by creation time.
    pub async fn list(&self, filter: JobFilter, cursor: Option<String>, limit: u32) -> Result<JobPage, JobError> {
        let limit = limit.clamp(1, 200) as i64;
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, fields_json FROM nodes WHERE table_name = ? ORDER BY id")
                .bind(T_JOB)
                .fetch_all(&self.store.pool)
                .await
                .map_err(|e| JobError::Store(StoreError::Sqlx(e)))?;

        let mut jobs: Vec<Job> = Vec::new();
        for (_id, fields_json) in rows {
            if let Ok(job) = serde_json::from_str::<Job>(&fields_json) {
                if let Some(ref wanted) = filter.state {
                    if job.state != *wanted {
                        continue;
                    }
                }
                if let Some(since) = filter.since {
                    if job.created_at < since {
                        continue;
                    }
                }
                jobs.push(job);
            }
        }

        if let Some(cursor) = &cursor {
            jobs.retain(|j| j.id.as_str() > cursor.as_str());
        }

        let next_cursor = if jobs.len() > limit as usize {
            jobs.truncate(limit as usize);
            jobs.last().map(|j| j.id.clone())
        } else {
            None
        };

        Ok(JobPage { jobs, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> JobRegistry {
        JobRegistry::new(Store::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_starts_pending() {
        let reg = registry().await;
        let id = reg.create("scanner-1").await.unwrap();
        let job = reg.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn valid_transition_sequence_reaches_completed() {
        let reg = registry().await;
        let id = reg.create("scanner-1").await.unwrap();
        reg.transition(&id, JobState::Processing, None).await.unwrap();
        let job = reg.transition(&id, JobState::Completed, None).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.updated_at >= job.created_at);
    }

    #[tokio::test]
    async fn pending_can_fail_directly() {
        let reg = registry().await;
        let id = reg.create("scanner-1").await.unwrap();
        let job = reg
            .transition(&id, JobState::Failed, Some("bad input".into()))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("bad input"));
    }

    #[tokio::test]
    async fn completed_cannot_go_back_to_processing() {
        let reg = registry().await;
        let id = reg.create("scanner-1").await.unwrap();
        reg.transition(&id, JobState::Processing, None).await.unwrap();
        reg.transition(&id, JobState::Completed, None).await.unwrap();
        let err = reg.transition(&id, JobState::Processing, None).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn repeated_transition_to_same_state_is_noop() {
        let reg = registry().await;
        let id = reg.create("scanner-1").await.unwrap();
        reg.transition(&id, JobState::Processing, None).await.unwrap();
        let first = reg.transition(&id, JobState::Processing, None).await.unwrap();
        let second = reg.transition(&id, JobState::Processing, None).await.unwrap();
        assert_eq!(first.updated_at, second.updated_at);
    }
}
