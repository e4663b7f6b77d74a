// Spectra-Red — security intelligence mesh ingestion and enrichment server.

mod clients;
mod config;
mod crypto;
mod error;
mod http;
mod ids;
mod jobs;
mod ratelimit;
mod store;
mod workflow;

use clients::asn_resolver::HttpAsnResolver;
use clients::embedding::HttpEmbeddingProvider;
use clients::geo_db::MmdbGeoDb;
use clients::vuln_catalog::HttpVulnCatalog;
use config::Config;
use http::state::AppState;
use jobs::JobRegistry;
use ratelimit::{run_reclaimer, TokenBucketLimiter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or("spectra_red=info,tower_http=info".into()))
        .json()
        .init();

    let config = Config::from_env();
    info!(port = config.port, "Spectra-Red ingestion server starting");

    let store = Store::connect(&config.database_url)
        .await
        .unwrap_or_else(|e| {
            eprintln!("[fatal] could not connect to store: {e}");
            std::process::exit(1);
        });

    let jobs_registry = JobRegistry::new(store.clone());

    let asn_resolver: Arc<dyn clients::asn_resolver::AsnResolver> = Arc::new(HttpAsnResolver::new(
        config
            .asn_resolver_url
            .clone()
            .unwrap_or_else(|| "http://localhost:9101".to_string()),
    ));
    let vuln_catalog: Arc<dyn clients::vuln_catalog::VulnCatalog> = Arc::new(HttpVulnCatalog::new(
        config
            .vuln_catalog_url
            .clone()
            .unwrap_or_else(|| "http://localhost:9102".to_string()),
    ));
    let geo_db: Arc<dyn clients::geo_db::GeoDb> = match &config.mmdb_path {
        Some(path) => match MmdbGeoDb::open(path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open MMDB, geo enrichment disabled");
                Arc::new(clients::geo_db::NullGeoDb)
            }
        },
        None => Arc::new(clients::geo_db::NullGeoDb),
    };
    let embedding_provider: Option<Arc<dyn clients::embedding::EmbeddingProvider>> = config
        .embedding_provider_url
        .clone()
        .map(|url| Arc::new(HttpEmbeddingProvider::new(url)) as Arc<dyn clients::embedding::EmbeddingProvider>);

    let ingest_limiter = Arc::new(TokenBucketLimiter::new(60, 60, "1m"));
    let query_limiter = Arc::new(TokenBucketLimiter::new(30, 60, "1m"));

    let idle_window = Duration::from_secs(config.rate_limit_eviction_secs);
    tokio::spawn(run_reclaimer(ingest_limiter.clone(), idle_window));
    tokio::spawn(run_reclaimer(query_limiter.clone(), idle_window));

    let state = AppState {
        store,
        jobs: jobs_registry,
        ingest_limiter,
        query_limiter,
        asn_resolver,
        geo_db,
        vuln_catalog,
        embedding_provider,
    };

    let app = http::routes::build(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("[fatal] could not bind port {}: {e}", config.port);
        std::process::exit(1);
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown");
    })
    .await
    .unwrap_or_else(|e| {
        eprintln!("[fatal] server error: {e}");
        std::process::exit(1);
    });
}
