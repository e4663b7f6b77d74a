// ASN Enricher (C4.1, spec §4.4.1): filter -> lookup -> update-hosts ->
// upsert-asn-nodes. Same durable-step discipline as the ingest workflow,
// each invocation its own journal keyed by a batch job id.

use super::engine::{RetryPolicy, StepJournal};
use crate::clients::asn_resolver::AsnResolver;
use crate::error::WorkflowError;
use crate::ids::host_id;
use crate::store::model::{Asn, T_ASN, T_HOST};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

const MAX_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct AsnEnrichRequest {
    pub job_id: String,
    pub ips: Vec<String>,
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AsnEnrichResponse {
    pub total: usize,
    pub enriched: usize,
    pub cached: usize,
    pub failed: usize,
    pub failed_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FilterOutcome {
    to_lookup: Vec<String>,
    cached: usize,
}

pub async fn run(
    store: &Store,
    resolver: &dyn AsnResolver,
    req: AsnEnrichRequest,
) -> Result<AsnEnrichResponse, WorkflowError> {
    if req.ips.len() > MAX_BATCH {
        return Err(WorkflowError::BatchTooLarge);
    }
    let total = req.ips.len();
    let journal = StepJournal::new(store, req.job_id.clone());
    let policy = RetryPolicy::default();

    // Step 1: filter — keep only IPs without an asn, unless force_refresh.
    let force_refresh = req.force_refresh;
    let ips = req.ips.clone();
    let store_ref = store;
    let filter_outcome: FilterOutcome = journal
        .run_step("filter", policy, move || {
            let ips = ips.clone();
            async move {
                let mut to_lookup = Vec::new();
                let mut cached = 0usize;
                for ip in &ips {
                    let hid = host_id(ip);
                    let has_asn = store_ref
                        .get_node(T_HOST, &hid)
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?
                        .and_then(|v| v.get("asn").cloned())
                        .map(|v| !v.is_null())
                        .unwrap_or(false);
                    if !force_refresh && has_asn {
                        cached += 1;
                    } else {
                        to_lookup.push(ip.clone());
                    }
                }
                Ok(FilterOutcome { to_lookup, cached })
            }
        })
        .await?;

    if filter_outcome.to_lookup.is_empty() {
        return Ok(AsnEnrichResponse {
            total,
            enriched: 0,
            cached: filter_outcome.cached,
            failed: 0,
            failed_list: Vec::new(),
        });
    }

    // Step 2: lookup — batch call to the external resolver, 30s deadline.
    let to_lookup = filter_outcome.to_lookup.clone();
    let resolved: HashMap<String, crate::clients::asn_resolver::AsnInfo> = journal
        .run_step("lookup", policy, move || {
            let to_lookup = to_lookup.clone();
            async move { resolver.lookup(&to_lookup).await.map_err(WorkflowError::Transient) }
        })
        .await?;

    let failed_list: Vec<String> = filter_outcome
        .to_lookup
        .iter()
        .filter(|ip| !resolved.contains_key(*ip))
        .cloned()
        .collect();

    // Step 3: update-hosts — MERGE asn + country onto each resolved host.
    let resolved_for_update = resolved.clone();
    journal
        .run_step("update-hosts", policy, move || {
            let resolved = resolved_for_update.clone();
            async move {
                for (ip, info) in &resolved {
                    let hid = host_id(ip);
                    store
                        .upsert_node(
                            T_HOST,
                            &hid,
                            json!({}),
                            json!({ "asn": info.number, "country": info.country }),
                        )
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                }
                Ok(())
            }
        })
        .await?;

    // Step 4: upsert-asn-nodes — dedup by AS number, RELATE host IN_ASN asn.
    let resolved_for_upsert = resolved.clone();
    journal
        .run_step("upsert-asn-nodes", policy, move || {
            let resolved = resolved_for_upsert.clone();
            async move {
                let mut by_asn: HashMap<u32, Vec<String>> = HashMap::new();
                for (ip, info) in &resolved {
                    by_asn.entry(info.number).or_default().push(ip.clone());
                }
                for (number, ips_in_asn) in &by_asn {
                    let info = resolved
                        .values()
                        .find(|i| i.number == *number)
                        .expect("asn present by construction");
                    store
                        .upsert_node(
                            T_ASN,
                            &number.to_string(),
                            json!(Asn {
                                number: *number,
                                org: info.org.clone(),
                                country: info.country.clone(),
                            }),
                            json!({ "org": info.org.clone() }),
                        )
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;

                    for ip in ips_in_asn {
                        let hid = host_id(ip);
                        store
                            .relate(
                                "IN_ASN",
                                T_HOST,
                                &hid,
                                T_ASN,
                                &number.to_string(),
                                json!({}),
                                json!({}),
                            )
                            .await
                            .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                    }
                }
                Ok(())
            }
        })
        .await?;

    Ok(AsnEnrichResponse {
        total,
        enriched: resolved.len(),
        cached: filter_outcome.cached,
        failed: failed_list.len(),
        failed_list,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::asn_resolver::AsnInfo;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubResolver {
        responses: HashMap<String, AsnInfo>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl AsnResolver for StubResolver {
        async fn lookup(&self, ips: &[String]) -> Result<HashMap<String, AsnInfo>, String> {
            *self.calls.lock().unwrap() += 1;
            Ok(ips
                .iter()
                .filter_map(|ip| self.responses.get(ip).map(|info| (ip.clone(), info.clone())))
                .collect())
        }
    }

    #[tokio::test]
    async fn enriches_seeded_hosts_and_creates_asn_edges() {
        let store = Store::in_memory().await.unwrap();
        for ip in ["8.8.8.8", "1.1.1.1"] {
            store
                .upsert_node(
                    T_HOST,
                    &host_id(ip),
                    json!({"ip": ip, "first_seen": chrono::Utc::now(), "last_seen": chrono::Utc::now(),
                           "last_scanned_at": chrono::Utc::now(), "asn": null, "country": null, "city": null, "region": null}),
                    json!({}),
                )
                .await
                .unwrap();
        }

        let resolver = StubResolver {
            responses: HashMap::from([
                ("8.8.8.8".to_string(), AsnInfo { number: 15169, org: "GOOGLE".into(), country: Some("US".into()) }),
                ("1.1.1.1".to_string(), AsnInfo { number: 13335, org: "CLOUDFLARE".into(), country: Some("US".into()) }),
            ]),
            calls: Mutex::new(0),
        };

        let resp = run(
            &store,
            &resolver,
            AsnEnrichRequest { job_id: "asn-1".into(), ips: vec!["8.8.8.8".into(), "1.1.1.1".into()], force_refresh: false },
        )
        .await
        .unwrap();

        assert_eq!(resp, AsnEnrichResponse { total: 2, enriched: 2, cached: 0, failed: 0, failed_list: vec![] });

        let edges = store.count_edges("IN_ASN", T_HOST, &host_id("8.8.8.8")).await.unwrap();
        assert_eq!(edges, 1);

        // Second invocation without force_refresh: both hosts already have asn set.
        let resp2 = run(
            &store,
            &resolver,
            AsnEnrichRequest { job_id: "asn-2".into(), ips: vec!["8.8.8.8".into(), "1.1.1.1".into()], force_refresh: false },
        )
        .await
        .unwrap();
        assert_eq!(resp2.cached, 2);
        assert_eq!(resp2.enriched, 0);

        let edges_after = store.count_edges("IN_ASN", T_HOST, &host_id("8.8.8.8")).await.unwrap();
        assert_eq!(edges_after, 1, "replay must not duplicate IN_ASN edges");
    }

    #[tokio::test]
    async fn batch_too_large_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        let resolver = StubResolver { responses: HashMap::new(), calls: Mutex::new(0) };
        let ips: Vec<String> = (0..101).map(|i| format!("10.0.0.{i}")).collect();
        let err = run(&store, &resolver, AsnEnrichRequest { job_id: "asn-x".into(), ips, force_refresh: false })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::BatchTooLarge));
    }
}
