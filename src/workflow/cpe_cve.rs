// CPE / CVE Enricher (C4.3, spec §4.4.3): generate-cpes -> query-nvd ->
// match -> upsert-vulns -> update-service-cpes -> link.

use super::engine::{RetryPolicy, StepJournal};
use crate::clients::vuln_catalog::{CveItem, VulnCatalog};
use crate::error::WorkflowError;
use crate::store::model::{Vuln, VulnDoc, T_SERVICE, T_VULN, T_VULN_DOC};
use crate::store::Store;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ServiceInput {
    pub service_id: String,
    pub name: String,
    pub product: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CpeCveRequest {
    pub batch_id: String,
    pub services: Vec<ServiceInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CpeCveResponse {
    pub services_processed: usize,
    pub cpes_generated: usize,
    pub vulns_found: usize,
    pub relationships_created: usize,
}

/// Fixed banner-regex catalogue (§4.4.3 step 1b), covering SSH, HTTP
/// servers, databases, mail, DNS, app servers, and proxies. Each entry maps
/// a banner pattern to `(vendor, product)`; the captured group is the
/// version.
static BANNER_RULES: Lazy<Vec<(Regex, &'static str, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)OpenSSH[_/]([\d.]+)").unwrap(), "openbsd", "openssh"),
        (Regex::new(r"(?i)nginx/([\d.]+)").unwrap(), "nginx", "nginx"),
        (Regex::new(r"(?i)Apache/([\d.]+)").unwrap(), "apache", "http_server"),
        (Regex::new(r"(?i)Microsoft-IIS/([\d.]+)").unwrap(), "microsoft", "iis"),
        (Regex::new(r"(?i)MySQL[ /]([\d.]+)").unwrap(), "oracle", "mysql"),
        (Regex::new(r"(?i)PostgreSQL[ /]([\d.]+)").unwrap(), "postgresql", "postgresql"),
        (Regex::new(r"(?i)Postfix[ /]?([\d.]*)").unwrap(), "postfix", "postfix"),
        (Regex::new(r"(?i)Exim[ /]([\d.]+)").unwrap(), "exim", "exim"),
        (Regex::new(r"(?i)ISC BIND ([\d.]+)").unwrap(), "isc", "bind"),
        (Regex::new(r"(?i)vsftpd ([\d.]+)").unwrap(), "vsftpd_project", "vsftpd"),
        (Regex::new(r"(?i)HAProxy version ([\d.]+)").unwrap(), "haproxy", "haproxy"),
        (Regex::new(r"(?i)Tomcat/([\d.]+)").unwrap(), "apache", "tomcat"),
    ]
});

/// Product -> vendor lookup used when `(product, version)` is known directly
/// from the scan (not derived from a banner) and needs a CPE vendor
/// component (§4.4.3 step 1). Falls back to the product name itself,
/// normalized, when unknown.
static VENDOR_LOOKUP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("nginx", "nginx"),
        ("openssh", "openbsd"),
        ("apache", "apache"),
        ("httpd", "apache"),
        ("mysql", "oracle"),
        ("postgresql", "postgresql"),
        ("postfix", "postfix"),
        ("bind", "isc"),
        ("iis", "microsoft"),
        ("vsftpd", "vsftpd_project"),
        ("haproxy", "haproxy"),
        ("tomcat", "apache"),
    ])
});

fn normalize(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn vendor_for(product: &str) -> String {
    let key = normalize(product);
    VENDOR_LOOKUP
        .get(key.as_str())
        .map(|v| v.to_string())
        .unwrap_or(key)
}

/// Lower-cases a version string without touching its internal `.`/`-`
/// separators — CPE 2.3 version components keep dotted version numbers
/// literal (`1.24.0`, not `1_24_0`); only vendor/product names get the
/// underscore normalization (§4.4.3: "lower-case/underscore component
/// normalization" applies to vendor names).
fn normalize_version(s: &str) -> String {
    s.trim().to_lowercase()
}

fn build_cpe(vendor: &str, product: &str, version: &str) -> String {
    format!(
        "cpe:2.3:a:{}:{}:{}:*:*:*:*:*:*:*",
        normalize(vendor),
        normalize(product),
        if version.is_empty() { "*".to_string() } else { normalize_version(version) }
    )
}

/// `generate-cpes` (step 1): derive and dedupe CPEs for one service.
fn generate_cpes(service: &ServiceInput) -> Vec<String> {
    let mut cpes: HashSet<String> = HashSet::new();

    if let (Some(product), Some(version)) = (&service.product, &service.version) {
        if !product.is_empty() && !version.is_empty() {
            cpes.insert(build_cpe(&vendor_for(product), product, version));
        }
    }

    if let Some(banner) = &service.banner {
        for (re, vendor, product) in BANNER_RULES.iter() {
            if let Some(caps) = re.captures(banner) {
                let version = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                cpes.insert(build_cpe(vendor, product, version));
            }
        }
    }

    if cpes.is_empty() {
        if let Some(product) = &service.product {
            if !product.is_empty() {
                cpes.insert(build_cpe(&vendor_for(product), product, ""));
            }
        }
    }

    cpes.into_iter().collect()
}

pub async fn run(
    store: &Store,
    catalog: &dyn VulnCatalog,
    req: CpeCveRequest,
) -> Result<CpeCveResponse, WorkflowError> {
    let journal = StepJournal::new(store, req.batch_id.clone());
    let policy = RetryPolicy::default();

    // Step 1: generate-cpes, per service.
    let mut cpes_by_service: HashMap<String, Vec<String>> = HashMap::new();
    let mut all_cpes: HashSet<String> = HashSet::new();
    for service in &req.services {
        let cpes = generate_cpes(service);
        all_cpes.extend(cpes.iter().cloned());
        cpes_by_service.insert(service.service_id.clone(), cpes);
    }
    let cpes_generated = all_cpes.len();

    if all_cpes.is_empty() {
        return Ok(CpeCveResponse {
            services_processed: req.services.len(),
            cpes_generated: 0,
            vulns_found: 0,
            relationships_created: 0,
        });
    }

    // Step 2: query-nvd. Collected set, batched through the catalog client.
    let cpe_list: Vec<String> = all_cpes.into_iter().collect();
    let matches: HashMap<String, Vec<CveItem>> = journal
        .run_step("query-nvd", policy, {
            let cpe_list = cpe_list.clone();
            move || {
                let cpe_list = cpe_list.clone();
                async move {
                    catalog
                        .query_by_cpe(&cpe_list)
                        .await
                        .map_err(WorkflowError::Transient)
                }
            }
        })
        .await?;

    // Step 3: match. (service_id, cve) pairs via shared CPEs, deduped.
    let mut pairs: HashSet<(String, String)> = HashSet::new();
    let mut cves_by_id: HashMap<String, CveItem> = HashMap::new();
    for (service_id, service_cpes) in &cpes_by_service {
        for cpe in service_cpes {
            if let Some(items) = matches.get(cpe) {
                for item in items {
                    cves_by_id.insert(item.cve_id.clone(), item.clone());
                    pairs.insert((service_id.clone(), item.cve_id.clone()));
                }
            }
        }
    }
    let vulns_found = cves_by_id.len();

    // Step 4: upsert-vulns (+ vuln_doc when a description exists).
    let now = Utc::now();
    let cves_for_upsert: Vec<CveItem> = cves_by_id.values().cloned().collect();
    journal
        .run_step("upsert-vulns", policy, move || {
            let cves = cves_for_upsert.clone();
            async move {
                for cve in &cves {
                    store
                        .upsert_node(
                            T_VULN,
                            &cve.cve_id,
                            json!(Vuln {
                                cve_id: cve.cve_id.clone(),
                                cvss: cve.cvss,
                                severity: cve.severity.clone(),
                                kev_flag: false,
                                first_seen: now,
                                last_updated: now,
                            }),
                            json!({ "cvss": cve.cvss, "severity": cve.severity, "last_updated": now }),
                        )
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;

                    if !cve.description.is_empty() {
                        store
                            .upsert_node(
                                T_VULN_DOC,
                                &cve.cve_id,
                                json!(VulnDoc {
                                    title: cve.cve_id.clone(),
                                    summary: cve.description.clone(),
                                    cvss: cve.cvss,
                                    cpe: cve.cpes.clone(),
                                    refs: cve.references.clone(),
                                    published: cve.published,
                                    modified: cve.modified,
                                    embedding: Vec::new(),
                                }),
                                json!({ "summary": cve.description, "cvss": cve.cvss, "modified": cve.modified }),
                            )
                            .await
                            .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                    }
                }
                Ok(())
            }
        })
        .await?;

    // Step 5: update-service-cpes. MERGE the CPE array onto each service.
    let cpes_by_service_for_update = cpes_by_service.clone();
    journal
        .run_step("update-service-cpes", policy, move || {
            let cpes_by_service = cpes_by_service_for_update.clone();
            async move {
                for (service_id, cpes) in &cpes_by_service {
                    if cpes.is_empty() {
                        continue;
                    }
                    store
                        .upsert_node(T_SERVICE, service_id, json!({}), json!({ "cpe": cpes }))
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                }
                Ok(())
            }
        })
        .await?;

    // Step 6: link. RELATE service AFFECTED_BY vuln; refresh last_confirmed
    // on duplicate without re-granting confidence.
    let pairs_for_link: Vec<(String, String)> = pairs.into_iter().collect();
    let relationships_created: usize = journal
        .run_step("link", policy, move || {
            let pairs = pairs_for_link.clone();
            async move {
                let mut relationships_created = 0usize;
                for (service_id, cve_id) in &pairs {
                    store
                        .relate(
                            "AFFECTED_BY",
                            T_SERVICE,
                            service_id,
                            T_VULN,
                            cve_id,
                            json!({ "confidence": 1.0, "first_detected": now, "last_confirmed": now }),
                            json!({ "last_confirmed": now }),
                        )
                        .await
                        .map_err(|e| WorkflowError::Transient(e.to_string()))?;
                    relationships_created += 1;
                }
                Ok(relationships_created)
            }
        })
        .await?;

    Ok(CpeCveResponse {
        services_processed: req.services.len(),
        cpes_generated,
        vulns_found,
        relationships_created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubCatalog(HashMap<String, Vec<CveItem>>);

    #[async_trait]
    impl VulnCatalog for StubCatalog {
        async fn query_by_cpe(&self, cpes: &[String]) -> Result<HashMap<String, Vec<CveItem>>, String> {
            Ok(self
                .0
                .iter()
                .filter(|(k, _)| cpes.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    #[test]
    fn generates_cpe_from_product_and_version() {
        let svc = ServiceInput {
            service_id: "s1".into(),
            name: "http".into(),
            product: Some("nginx".into()),
            version: Some("1.24.0".into()),
            banner: None,
        };
        let cpes = generate_cpes(&svc);
        assert_eq!(cpes, vec!["cpe:2.3:a:nginx:nginx:1.24.0:*:*:*:*:*:*:*".to_string()]);
    }

    #[test]
    fn generates_cpe_from_banner_when_product_version_absent() {
        let svc = ServiceInput {
            service_id: "s2".into(),
            name: "ssh".into(),
            product: None,
            version: None,
            banner: Some("SSH-2.0-OpenSSH_8.9p1".into()),
        };
        let cpes = generate_cpes(&svc);
        assert!(cpes.iter().any(|c| c.contains("openssh")));
    }

    #[test]
    fn wildcard_cpe_when_only_product_known() {
        let svc = ServiceInput {
            service_id: "s3".into(),
            name: "db".into(),
            product: Some("mysql".into()),
            version: None,
            banner: None,
        };
        let cpes = generate_cpes(&svc);
        assert!(cpes[0].ends_with(":*:*:*:*:*:*:*"));
    }

    #[tokio::test]
    async fn matches_service_to_cve_and_creates_one_edge() {
        let store = Store::in_memory().await.unwrap();
        let cpe = "cpe:2.3:a:nginx:nginx:1.24.0:*:*:*:*:*:*:*".to_string();
        let catalog = StubCatalog(HashMap::from([(
            cpe.clone(),
            vec![CveItem {
                cve_id: "CVE-2024-1111".into(),
                cvss: Some(7.5),
                severity: Some("high".into()),
                description: "example vuln".into(),
                references: vec![],
                cpes: vec![cpe.clone()],
                published: None,
                modified: None,
            }],
        )]));

        let req = CpeCveRequest {
            batch_id: "cpe-1".into(),
            services: vec![ServiceInput {
                service_id: "svc-nginx".into(),
                name: "http".into(),
                product: Some("nginx".into()),
                version: Some("1.24.0".into()),
                banner: Some("nginx/1.24.0".into()),
            }],
        };

        let resp = run(&store, &catalog, req).await.unwrap();
        assert_eq!(resp.services_processed, 1);
        assert_eq!(resp.vulns_found, 1);
        assert_eq!(resp.relationships_created, 1);

        let edges = store.count_edges("AFFECTED_BY", T_SERVICE, "svc-nginx").await.unwrap();
        assert_eq!(edges, 1);
        let service_fields = store.get_node(T_SERVICE, "svc-nginx").await.unwrap().unwrap();
        assert!(service_fields["cpe"].as_array().unwrap().len() >= 1);
    }
}
