// Graph & Vector Store Adapter (C5, spec §4.5). Backed by sqlite via sqlx —
// the only database stack present anywhere in the retrieval pack
// (`casparian_db`/`casparian_schema`). Nodes and edges are stored generically
// so every write goes through one of the two primitives in `upsert.rs`
// (§4.5.1: "direct inserts are forbidden in component contracts").

pub mod model;
pub mod query;
pub mod upsert;

use crate::error::StoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A single-connection pool over `sqlite::memory:`. Capped at one
    /// connection deliberately: sqlite's in-memory mode gives each new
    /// connection its own anonymous database, so a pool with more than one
    /// connection would scatter a test's writes and reads across unrelated
    /// databases. One connection keeps the whole pool pointed at the same
    /// in-memory database for the store's lifetime.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                table_name TEXT NOT NULL,
                id TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS edges (
                label TEXT NOT NULL,
                src_table TEXT NOT NULL,
                src_id TEXT NOT NULL,
                dst_table TEXT NOT NULL,
                dst_id TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (label, src_table, src_id, dst_table, dst_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_edges_src ON edges (src_table, src_id, label)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges (dst_table, dst_id, label)",
        )
        .execute(&self.pool)
        .await?;

        // Durable-step journal backing `workflow::engine` (spec §4.3/§9).
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_steps (
                job_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                result_json TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (job_id, step_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
