// Geo Enricher (C4.2, spec §4.4.2): lookup -> create-geo-nodes ->
// create-relationships -> update-hosts. Partial success is tolerated; IPs
// that fail lookup are silently dropped (not an error).

use super::engine::{RetryPolicy, StepJournal};
use crate::clients::geo_db::{GeoDb, GeoInfo};
use crate::error::WorkflowError;
use crate::ids::{city_id, country_id, host_id, region_id};
use crate::store::model::{GeoPlace, T_CITY, T_COUNTRY, T_HOST, T_REGION};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct GeoEnrichRequest {
    pub job_id: String,
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GeoEnrichResponse {
    pub total: usize,
    pub resolved: usize,
    pub dropped: usize,
}

pub async fn run(
    store: &Store,
    geo_db: &dyn GeoDb,
    req: GeoEnrichRequest,
) -> Result<GeoEnrichResponse, WorkflowError> {
    let total = req.ips.len();
    let journal = StepJournal::new(store, req.job_id.clone());
    let policy = RetryPolicy::default();

    // Step 1: lookup. Local MMDB read, <10ms/IP typical — no external
    // deadline needed, but still run through the journal so a crash after
    // lookup-but-before-persist replays the same resolved set.
    let ips = req.ips.clone();
    let resolved: HashMap<String, GeoInfo> = journal
        .run_step("lookup", policy, move || {
            let ips = ips.clone();
            async move {
                let mut out = HashMap::new();
                for ip in &ips {
                    if let Some(info) = geo_db.lookup(ip) {
                        out.insert(ip.clone(), info);
                    }
                }
                Ok(out)
            }
        })
        .await?;

    let resolved_count = resolved.len();

    // Step 2: create-geo-nodes. Dedup and upsert country/region/city,
    // preserving the latest coordinates.
    let resolved_for_nodes = resolved.clone();
    journal
        .run_step("create-geo-nodes", policy, move || {
            let resolved = resolved_for_nodes.clone();
            async move {
                for info in resolved.values() {
                    let Some(cc) = &info.country_cc else { continue };
                    store
                        .upsert_node(
                            T_COUNTRY,
                            &country_id(cc),
                            json!(GeoPlace {
                                name: info.country.clone().unwrap_or_default(),
                                cc: cc.clone(),
                                lat: info.lat.unwrap_or_default(),
                                lon: info.lon.unwrap_or_default(),
                            }),
                            json!({}),
                        )
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;

                    if let Some(region) = &info.region {
                        store
                            .upsert_node(
                                T_REGION,
                                &region_id(cc, region),
                                json!(GeoPlace { name: region.clone(), cc: cc.clone(), lat: info.lat.unwrap_or_default(), lon: info.lon.unwrap_or_default() }),
                                json!({ "lat": info.lat, "lon": info.lon }),
                            )
                            .await
                            .map_err(|e| WorkflowError::Transient(e.to_string()))?;

                        if let Some(city) = &info.city {
                            store
                                .upsert_node(
                                    T_CITY,
                                    &city_id(cc, region, city),
                                    json!(GeoPlace { name: city.clone(), cc: cc.clone(), lat: info.lat.unwrap_or_default(), lon: info.lon.unwrap_or_default() }),
                                    json!({ "lat": info.lat, "lon": info.lon }),
                                )
                                .await
                                .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                        }
                    }
                }
                Ok(())
            }
        })
        .await?;

    // Step 3: create-relationships.
    let resolved_for_rel = resolved.clone();
    journal
        .run_step("create-relationships", policy, move || {
            let resolved = resolved_for_rel.clone();
            async move {
                for (ip, info) in &resolved {
                    let hid = host_id(ip);
                    let Some(cc) = &info.country_cc else { continue };
                    let (Some(region), Some(city)) = (&info.region, &info.city) else { continue };

                    let cid = city_id(cc, region, city);
                    let rid = region_id(cc, region);
                    let coid = country_id(cc);

                    store
                        .relate("IN_CITY", T_HOST, &hid, T_CITY, &cid, json!({}), json!({}))
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                    store
                        .relate("IN_REGION", T_CITY, &cid, T_REGION, &rid, json!({}), json!({}))
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                    store
                        .relate("IN_COUNTRY", T_REGION, &rid, T_COUNTRY, &coid, json!({}), json!({}))
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                }
                Ok(())
            }
        })
        .await?;

    // Step 4: update-hosts.
    let resolved_for_hosts = resolved.clone();
    journal
        .run_step("update-hosts", policy, move || {
            let resolved = resolved_for_hosts.clone();
            async move {
                for (ip, info) in &resolved {
                    let hid = host_id(ip);
                    store
                        .upsert_node(
                            T_HOST,
                            &hid,
                            json!({}),
                            json!({
                                "city": info.city,
                                "region": info.region,
                                "country": info.country,
                                "last_seen": chrono::Utc::now(),
                            }),
                        )
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                }
                Ok(())
            }
        })
        .await?;

    Ok(GeoEnrichResponse {
        total,
        resolved: resolved_count,
        dropped: total - resolved_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::host_id;
    use std::collections::HashMap as StdHashMap;

    struct StubGeoDb(StdHashMap<String, GeoInfo>);

    impl GeoDb for StubGeoDb {
        fn lookup(&self, ip: &str) -> Option<GeoInfo> {
            self.0.get(ip).cloned()
        }
    }

    #[tokio::test]
    async fn resolves_and_links_host_to_geo_hierarchy() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_node(
                T_HOST,
                &host_id("8.8.8.8"),
                json!({"ip": "8.8.8.8", "first_seen": chrono::Utc::now(), "last_seen": chrono::Utc::now(),
                       "last_scanned_at": chrono::Utc::now(), "asn": null, "country": null, "city": null, "region": null}),
                json!({}),
            )
            .await
            .unwrap();

        let mut db = StdHashMap::new();
        db.insert(
            "8.8.8.8".to_string(),
            GeoInfo {
                city: Some("Mountain View".into()),
                region: Some("California".into()),
                country: Some("United States".into()),
                country_cc: Some("US".into()),
                lat: Some(37.4),
                lon: Some(-122.0),
            },
        );
        let geo_db = StubGeoDb(db);

        let resp = run(&store, &geo_db, GeoEnrichRequest { job_id: "geo-1".into(), ips: vec!["8.8.8.8".into(), "10.0.0.1".into()] })
            .await
            .unwrap();

        assert_eq!(resp.total, 2);
        assert_eq!(resp.resolved, 1);
        assert_eq!(resp.dropped, 1);

        let view = store.get_host("8.8.8.8", 1).await.unwrap().unwrap();
        assert_eq!(view.host.city.as_deref(), Some("Mountain View"));
        assert!(view.edges.iter().any(|e| e.label == "IN_CITY"));
    }

    #[tokio::test]
    async fn unresolved_ips_are_dropped_not_errored() {
        let store = Store::in_memory().await.unwrap();
        let geo_db = StubGeoDb(StdHashMap::new());
        let resp = run(&store, &geo_db, GeoEnrichRequest { job_id: "geo-2".into(), ips: vec!["203.0.113.9".into()] })
            .await
            .unwrap();
        assert_eq!(resp.resolved, 0);
        assert_eq!(resp.dropped, 1);
    }
}
