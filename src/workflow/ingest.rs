// Durable Ingest Workflow (C3, spec §4.3). `mark-processing -> parse ->
// persist -> mark-completed`, each step run through the engine's journal so
// a crash mid-workflow replays only the steps that didn't finish.

use super::engine::{RetryPolicy, StepJournal};
use crate::error::WorkflowError;
use crate::ids::{host_id, port_id};
use crate::jobs::JobRegistry;
use crate::store::model::{Host, JobState, Port, T_HOST, T_PORT};
use crate::store::Store;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    host: String,
    port: u16,
    #[serde(default = "default_protocol")]
    protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanData {
    pub hosts: Vec<ScanHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanHost {
    pub ip: String,
    pub ports: Vec<ScanPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPort {
    pub number: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub job_id: String,
    pub state: String,
    pub host_count: u64,
    pub port_count: u64,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistOutcome {
    host_count: u64,
    port_count: u64,
    hosts: Vec<String>,
}

pub struct IngestRequest {
    pub job_id: String,
    pub scanner_key: String,
    pub raw_bytes: Vec<u8>,
}

/// `parse` (§4.3 step 2). Malformed lines are skipped, not fatal; a batch
/// with zero valid hosts is a terminal failure.
fn parse(raw_bytes: &[u8]) -> Result<ScanData, WorkflowError> {
    let text = String::from_utf8_lossy(raw_bytes);
    let mut by_host: BTreeMap<String, Vec<ScanPort>> = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<RawRecord>(line) else {
            continue;
        };
        if record.host.is_empty() || record.port == 0 {
            continue;
        }
        by_host.entry(record.host).or_default().push(ScanPort {
            number: record.port,
            protocol: record.protocol,
        });
    }

    if by_host.is_empty() {
        return Err(WorkflowError::NoValidHosts);
    }

    let hosts = by_host
        .into_iter()
        .map(|(ip, ports)| ScanHost { ip, ports })
        .collect();
    Ok(ScanData { hosts })
}

pub async fn run(
    store: &Store,
    jobs: &JobRegistry,
    req: IngestRequest,
) -> Result<IngestResult, WorkflowError> {
    let journal = StepJournal::new(store, req.job_id.clone());
    let policy = RetryPolicy::default();

    // Step 1: mark-processing. Journaled like every other step (§4.3) so a
    // crash between this write and the next doesn't re-fire the transition
    // on replay. On failure, fail the job immediately.
    let mark_processing = journal
        .run_step("mark-processing", policy, || async {
            jobs.transition(&req.job_id, JobState::Processing, None)
                .await
                .map_err(WorkflowError::from)
        })
        .await;
    if let Err(e) = mark_processing {
        let _ = jobs
            .transition(&req.job_id, JobState::Failed, Some(e.to_string()))
            .await;
        return Err(e);
    }

    // Step 2: parse. Non-deterministic only in that it reads raw_bytes
    // passed in by the caller, not in how it derives ScanData from them.
    let raw_bytes = req.raw_bytes.clone();
    let scan_data = match journal
        .run_step("parse", policy, move || {
            let raw_bytes = raw_bytes.clone();
            async move { parse(&raw_bytes) }
        })
        .await
    {
        Ok(data) => data,
        Err(e) => {
            let _ = jobs
                .transition(&req.job_id, JobState::Failed, Some(e.to_string()))
                .await;
            return Err(e);
        }
    };

    // Step 3: persist. Upserts are idempotent so replaying this step after a
    // crash produces the same host/port records and edges (P5, §8).
    let outcome = match journal
        .run_step("persist", policy, || {
            let scan_data = scan_data.clone();
            async move { persist(store, &scan_data).await }
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = jobs
                .transition(&req.job_id, JobState::Failed, Some(e.to_string()))
                .await;
            return Err(e);
        }
    };

    if let Err(e) = jobs
        .record_counts(&req.job_id, outcome.host_count, outcome.port_count)
        .await
    {
        tracing::warn!(job_id = %req.job_id, error = %e, "failed to record ingest counts");
    }

    // Step 4: mark-completed. Journaled like the other steps; non-fatal for
    // data correctness if it fails — persist already succeeded.
    let final_job = match journal
        .run_step("mark-completed", policy, || async {
            jobs.transition(&req.job_id, JobState::Completed, None)
                .await
                .map_err(WorkflowError::from)
        })
        .await
    {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job_id = %req.job_id, error = %e, "mark-completed failed after successful persist");
            return Ok(IngestResult {
                job_id: req.job_id,
                state: JobState::Processing.as_str().to_string(),
                host_count: outcome.host_count,
                port_count: outcome.port_count,
                hosts: outcome.hosts,
            });
        }
    };

    Ok(IngestResult {
        job_id: req.job_id,
        state: final_job.state.as_str().to_string(),
        host_count: outcome.host_count,
        port_count: outcome.port_count,
        hosts: outcome.hosts,
    })
}

async fn persist(store: &Store, scan_data: &ScanData) -> Result<PersistOutcome, WorkflowError> {
    let now = Utc::now();
    let mut host_count = 0u64;
    let mut port_count = 0u64;
    let mut hosts = Vec::with_capacity(scan_data.hosts.len());

    for scan_host in &scan_data.hosts {
        hosts.push(scan_host.ip.clone());
        let hid = host_id(&scan_host.ip);
        store
            .upsert_node(
                T_HOST,
                &hid,
                json!(Host {
                    ip: scan_host.ip.clone(),
                    first_seen: now,
                    last_seen: now,
                    last_scanned_at: now,
                    asn: None,
                    country: None,
                    city: None,
                    region: None,
                }),
                json!({ "last_seen": now, "last_scanned_at": now }),
            )
            .await
            .map_err(|e| WorkflowError::Transient(e.to_string()))?;
        host_count += 1;

        for scan_port in &scan_host.ports {
            let pid = port_id(scan_port.number, &scan_port.protocol);
            store
                .upsert_node(
                    T_PORT,
                    &pid,
                    json!(Port {
                        number: scan_port.number,
                        protocol: scan_port.protocol.clone(),
                        first_seen: now,
                        last_seen: now,
                    }),
                    json!({ "last_seen": now }),
                )
                .await
                .map_err(|e| WorkflowError::Transient(e.to_string()))?;
            port_count += 1;

            store
                .relate(
                    "HAS",
                    T_HOST,
                    &hid,
                    T_PORT,
                    &pid,
                    json!({ "created_at": now }),
                    json!({ "last_seen": now }),
                )
                .await
                .map_err(|e| WorkflowError::Transient(e.to_string()))?;
        }
    }

    Ok(PersistOutcome { host_count, port_count, hosts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_groups_records_by_host() {
        let raw = b"{\"host\":\"1.2.3.4\",\"port\":22}\n{\"host\":\"1.2.3.4\",\"port\":80}\n";
        let data = parse(raw).unwrap();
        assert_eq!(data.hosts.len(), 1);
        assert_eq!(data.hosts[0].ports.len(), 2);
    }

    #[test]
    fn parse_skips_malformed_lines_without_failing() {
        let raw = b"{\"host\":\"1.2.3.4\",\"port\":22}\n{invalid json}\n{\"host\":\"1.2.3.4\",\"port\":80}\n";
        let data = parse(raw).unwrap();
        assert_eq!(data.hosts[0].ports.len(), 2);
    }

    #[test]
    fn parse_defaults_protocol_to_tcp() {
        let raw = b"{\"host\":\"1.2.3.4\",\"port\":22}\n";
        let data = parse(raw).unwrap();
        assert_eq!(data.hosts[0].ports[0].protocol, "tcp");
    }

    #[test]
    fn parse_fails_on_zero_valid_hosts() {
        let raw = b"{invalid}\nnot json at all\n";
        let err = parse(raw).unwrap_err();
        assert!(matches!(err, WorkflowError::NoValidHosts));
    }

    #[tokio::test]
    async fn happy_path_ingest_reaches_completed_with_expected_counts() {
        let store = Store::in_memory().await.unwrap();
        let jobs = JobRegistry::new(store.clone());
        let job_id = jobs.create("scanner-1").await.unwrap();
        let raw = b"{\"host\":\"192.168.1.1\",\"port\":22,\"protocol\":\"tcp\"}\n{\"host\":\"192.168.1.1\",\"port\":80,\"protocol\":\"tcp\"}".to_vec();

        let result = run(
            &store,
            &jobs,
            IngestRequest {
                job_id: job_id.clone(),
                scanner_key: "scanner-1".into(),
                raw_bytes: raw,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.state, "completed");
        assert_eq!(result.host_count, 1);
        assert_eq!(result.port_count, 2);

        let view = store.get_host("192.168.1.1", 1).await.unwrap().unwrap();
        assert_eq!(view.edges.len(), 2);
    }

    #[tokio::test]
    async fn replaying_ingest_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let jobs = JobRegistry::new(store.clone());
        let job_id = jobs.create("scanner-1").await.unwrap();
        let raw = b"{\"host\":\"10.0.0.1\",\"port\":443,\"protocol\":\"tcp\"}".to_vec();

        run(
            &store,
            &jobs,
            IngestRequest {
                job_id: job_id.clone(),
                scanner_key: "scanner-1".into(),
                raw_bytes: raw.clone(),
            },
        )
        .await
        .unwrap();

        // Re-running persist directly (simulating a crash-replay) must not
        // create duplicate port/edge rows (P5, §8).
        let scan_data = parse(&raw).unwrap();
        persist(&store, &scan_data).await.unwrap();
        persist(&store, &scan_data).await.unwrap();

        let count = store
            .count_edges("HAS", T_HOST, &host_id("10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn zero_valid_hosts_fails_the_job() {
        let store = Store::in_memory().await.unwrap();
        let jobs = JobRegistry::new(store.clone());
        let job_id = jobs.create("scanner-1").await.unwrap();

        let result = run(
            &store,
            &jobs,
            IngestRequest {
                job_id: job_id.clone(),
                scanner_key: "scanner-1".into(),
                raw_bytes: b"{not json}".to_vec(),
            },
        )
        .await;

        assert!(result.is_err());
        let job = jobs.get(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
    }
}
