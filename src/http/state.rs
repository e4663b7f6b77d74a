// Shared application state (spec §5 "shared resources"). One instance per
// process, cloned (cheaply, via Arc-backed fields) into every handler.

use crate::clients::asn_resolver::AsnResolver;
use crate::clients::geo_db::GeoDb;
use crate::clients::vuln_catalog::VulnCatalog;
use crate::clients::embedding::EmbeddingProvider;
use crate::jobs::JobRegistry;
use crate::ratelimit::TokenBucketLimiter;
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub jobs: JobRegistry,
    pub ingest_limiter: Arc<TokenBucketLimiter>,
    pub query_limiter: Arc<TokenBucketLimiter>,
    pub asn_resolver: Arc<dyn AsnResolver>,
    pub geo_db: Arc<dyn GeoDb>,
    /// No HTTP route calls `workflow::cpe_cve::run` today (see DESIGN.md —
    /// the generic newline-JSON ingest parser never produces service-level
    /// data for it to enrich); kept on `AppState` so a future scan format
    /// that does report services can wire a handler without touching the
    /// client construction in `main.rs`.
    #[allow(dead_code)]
    pub vuln_catalog: Arc<dyn VulnCatalog>,
    pub embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
}
