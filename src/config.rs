// Centralizes what the teacher read ad hoc via std::env::var(...) scattered
// through main(). One struct, read once at startup.

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub mmdb_path: Option<String>,
    pub asn_resolver_url: Option<String>,
    pub vuln_catalog_url: Option<String>,
    pub embedding_provider_url: Option<String>,
    pub rate_limit_eviction_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://spectra_red.db".to_string()),
            mmdb_path: std::env::var("SPECTRA_MMDB_PATH").ok(),
            asn_resolver_url: std::env::var("SPECTRA_ASN_RESOLVER_URL").ok(),
            vuln_catalog_url: std::env::var("SPECTRA_VULN_CATALOG_URL").ok(),
            embedding_provider_url: std::env::var("SPECTRA_EMBEDDING_URL").ok(),
            rate_limit_eviction_secs: std::env::var("SPECTRA_RL_EVICTION_SECS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(600),
        }
    }
}
