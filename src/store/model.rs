// Typed views over the generic node/edge tables (spec §3). Every struct here
// is a (de)serialization of a node's `fields_json`; the generic row shape
// itself lives in `super::upsert`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const T_HOST: &str = "host";
pub const T_PORT: &str = "port";
pub const T_SERVICE: &str = "service";
pub const T_BANNER: &str = "banner";
pub const T_TLS_CERT: &str = "tls_cert";
pub const T_VULN: &str = "vuln";
pub const T_VULN_DOC: &str = "vuln_doc";
pub const T_CITY: &str = "city";
pub const T_REGION: &str = "region";
pub const T_COUNTRY: &str = "country";
pub const T_ASN: &str = "asn";
pub const T_JOB: &str = "job";

pub const E_HAS: &str = "HAS";
pub const E_RUNS: &str = "RUNS";
pub const E_EVIDENCED_BY: &str = "EVIDENCED_BY";
pub const E_AFFECTED_BY: &str = "AFFECTED_BY";
pub const E_IN_CITY: &str = "IN_CITY";
pub const E_IN_REGION: &str = "IN_REGION";
pub const E_IN_COUNTRY: &str = "IN_COUNTRY";
pub const E_IN_ASN: &str = "IN_ASN";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Host {
    pub ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_scanned_at: DateTime<Utc>,
    pub asn: Option<u32>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Port {
    pub number: u16,
    pub protocol: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Service {
    pub name: String,
    pub product: String,
    pub version: String,
    pub cpe: Vec<String>,
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Banner {
    pub text: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Vuln {
    pub cve_id: String,
    pub cvss: Option<f32>,
    pub severity: Option<String>,
    pub kev_flag: bool,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VulnDoc {
    pub title: String,
    pub summary: String,
    pub cvss: Option<f32>,
    pub cpe: Vec<String>,
    pub refs: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    /// length 1536 or empty — populated lazily; §4.5.2/§9.
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeoPlace {
    pub name: String,
    pub cc: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Asn {
    pub number: u32,
    pub org: String,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Transition table from spec §3: `pending -> processing -> {completed,
    /// failed}`, plus `pending -> failed` for early validation failures.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, target),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub state: JobState,
    pub scanner_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub host_count: u64,
    pub port_count: u64,
    pub error_message: Option<String>,
}
