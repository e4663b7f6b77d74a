// ASN resolver (§6.4): `lookup(ips[]) -> map<ip, {number, org, country}>`,
// expected latency per batch <= 30s. Modeled as a Team Cymru-style whois
// bulk lookup exposed over HTTP by the mesh's infra (the spec doesn't name a
// wire format; a JSON batch endpoint is the simplest shape consistent with
// "batch... with a 30s deadline").

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsnInfo {
    pub number: u32,
    pub org: String,
    pub country: Option<String>,
}

#[async_trait]
pub trait AsnResolver: Send + Sync {
    async fn lookup(&self, ips: &[String]) -> Result<HashMap<String, AsnInfo>, String>;
}

pub struct HttpAsnResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAsnResolver {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client build");
        Self { client, base_url }
    }
}

#[derive(Deserialize)]
struct AsnBatchResponseEntry {
    ip: String,
    number: u32,
    org: String,
    country: Option<String>,
}

#[async_trait]
impl AsnResolver for HttpAsnResolver {
    async fn lookup(&self, ips: &[String]) -> Result<HashMap<String, AsnInfo>, String> {
        let response = self
            .client
            .post(format!("{}/bulk", self.base_url))
            .json(&serde_json::json!({ "ips": ips }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("asn resolver returned {}", response.status()));
        }

        let entries: Vec<AsnBatchResponseEntry> =
            response.json().await.map_err(|e| e.to_string())?;
        Ok(entries
            .into_iter()
            .map(|e| {
                (
                    e.ip,
                    AsnInfo {
                        number: e.number,
                        org: e.org,
                        country: e.country,
                    },
                )
            })
            .collect())
    }
}
