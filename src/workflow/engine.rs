// Durable-step discipline (spec §4.3, §9). No pack repo ships a native
// durable-execution runtime, so this reproduces the contract §9 calls for
// directly: "a persistent journal keyed by (job_id, step_name) and a
// deterministic replay guard around external calls." Every C3/C4 workflow
// step runs through `run_step`.

use crate::error::WorkflowError;
use crate::store::Store;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_total: Duration,
}

impl Default for RetryPolicy {
    /// Exponential backoff 500ms base, x2, max 5 min total (§4.3).
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_total: Duration::from_secs(300),
        }
    }
}

pub struct StepJournal<'a> {
    store: &'a Store,
    job_id: String,
}

impl<'a> StepJournal<'a> {
    pub fn new(store: &'a Store, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    async fn load<T: DeserializeOwned>(&self, step_name: &str) -> Option<T> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT result_json FROM job_steps WHERE job_id = ? AND step_name = ?",
        )
        .bind(&self.job_id)
        .bind(step_name)
        .fetch_optional(&self.store.pool)
        .await
        .ok()?;
        let (json,) = row?;
        serde_json::from_str(&json).ok()
    }

    async fn save<T: Serialize>(&self, step_name: &str, result: &T) -> Result<(), WorkflowError> {
        let json = serde_json::to_string(result)
            .map_err(|e| WorkflowError::Terminal(format!("journal encode failed: {e}")))?;
        sqlx::query(
            "INSERT OR REPLACE INTO job_steps (job_id, step_name, result_json, completed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.job_id)
        .bind(step_name)
        .bind(json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.store.pool)
        .await
        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Run a named step with at-most-once externally-visible effects per
    /// successful completion. On re-entry, a previously journaled result is
    /// returned without re-executing `f`. Transient failures (classified by
    /// the caller returning `WorkflowError::Transient`) are retried with
    /// exponential backoff until `policy.max_total` is exhausted, at which
    /// point the error is promoted to `WorkflowError::Terminal`.
    pub async fn run_step<T, F, Fut>(
        &self,
        step_name: &str,
        policy: RetryPolicy,
        f: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(cached) = self.load::<T>(step_name).await {
            tracing::debug!(job_id = %self.job_id, step = step_name, "step_replayed");
            return Ok(cached);
        }

        let mut delay = policy.base_delay;
        let started = std::time::Instant::now();
        loop {
            match f().await {
                Ok(result) => {
                    self.save(step_name, &result).await?;
                    tracing::info!(job_id = %self.job_id, step = step_name, "step_completed");
                    return Ok(result);
                }
                Err(WorkflowError::Transient(msg)) => {
                    if started.elapsed() + delay > policy.max_total {
                        tracing::error!(job_id = %self.job_id, step = step_name, %msg, "step_retry_budget_exhausted");
                        return Err(WorkflowError::Terminal(msg));
                    }
                    tracing::warn!(job_id = %self.job_id, step = step_name, %msg, delay_ms = delay.as_millis() as u64, "step_retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(policy.multiplier);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn completed_step_is_not_re_executed_on_replay() {
        let store = Store::in_memory().await.unwrap();
        let journal = StepJournal::new(&store, "job-1");
        let calls = AtomicU32::new(0);

        let result: u32 = journal
            .run_step("parse", RetryPolicy::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42u32)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let replayed: u32 = journal
            .run_step("parse", RetryPolicy::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(99u32)
            })
            .await
            .unwrap();
        assert_eq!(replayed, 42, "replay must return the journaled value, not re-execute");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "step body must not run again");
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        let store = Store::in_memory().await.unwrap();
        let journal = StepJournal::new(&store, "job-2");
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_total: Duration::from_secs(5),
        };

        let result: u32 = journal
            .run_step("lookup", policy, || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(WorkflowError::Transient("not yet".into()))
                } else {
                    Ok(7u32)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_is_terminal() {
        let store = Store::in_memory().await.unwrap();
        let journal = StepJournal::new(&store, "job-3");
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(2),
            multiplier: 2.0,
            max_total: Duration::from_millis(5),
        };

        let result: Result<u32, WorkflowError> = journal
            .run_step("lookup", policy, || async {
                Err(WorkflowError::Transient("down".into()))
            })
            .await;
        assert!(matches!(result, Err(WorkflowError::Terminal(_))));
    }
}
