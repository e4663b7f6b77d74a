// Vulnerability catalog (§4.4.3, §6.4): `query_by_cpe(cpes[]) ->
// map<cpe, [CVEItem]>`, throttled and retriable — modeled after an
// NVD-style REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CveItem {
    pub cve_id: String,
    pub cvss: Option<f32>,
    pub severity: Option<String>,
    pub description: String,
    pub references: Vec<String>,
    pub cpes: Vec<String>,
    pub published: Option<chrono::DateTime<chrono::Utc>>,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
pub trait VulnCatalog: Send + Sync {
    async fn query_by_cpe(&self, cpes: &[String]) -> Result<HashMap<String, Vec<CveItem>>, String>;
}

pub struct HttpVulnCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVulnCatalog {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client build");
        Self { client, base_url }
    }
}

#[derive(Deserialize)]
struct CpeMatchesResponse {
    matches: HashMap<String, Vec<CveItem>>,
}

#[async_trait]
impl VulnCatalog for HttpVulnCatalog {
    async fn query_by_cpe(&self, cpes: &[String]) -> Result<HashMap<String, Vec<CveItem>>, String> {
        let response = self
            .client
            .post(format!("{}/cpe-match", self.base_url))
            .json(&serde_json::json!({ "cpes": cpes }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err("catalog_rate_limited".to_string());
        }
        if !response.status().is_success() {
            return Err(format!("vuln catalog returned {}", response.status()));
        }

        let body: CpeMatchesResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(body.matches)
    }
}
