// The two write primitives spec §4.5.1 requires everything else to go
// through: `UpsertNode` and `Relate`. Both are create-if-absent-else-merge,
// which is what makes re-running ingest/enrichment idempotent (§3 invariant,
// P5/P6 in §8).

use super::Store;
use crate::error::StoreError;
use chrono::Utc;
use serde_json::Value;

/// Shallow JSON-merge-patch: every top-level key in `patch` overwrites the
/// same key in `base`; keys absent from `patch` are left untouched. Good
/// enough here because every entity in §3 is a flat record.
fn merge_fields(base: &mut Value, patch: &Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
}

impl Store {
    /// Create-if-absent, else merge `update_fields` onto the existing row.
    /// Returns the row's final fields after the write.
    pub async fn upsert_node(
        &self,
        table: &str,
        id: &str,
        create_fields: Value,
        update_fields: Value,
    ) -> Result<Value, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT fields_json FROM nodes WHERE table_name = ? AND id = ?")
                .bind(table)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let final_fields = match existing {
            Some((fields_json,)) => {
                let mut fields: Value = serde_json::from_str(&fields_json)?;
                merge_fields(&mut fields, &update_fields);
                sqlx::query(
                    "UPDATE nodes SET fields_json = ?, updated_at = ? WHERE table_name = ? AND id = ?",
                )
                .bind(serde_json::to_string(&fields)?)
                .bind(&now)
                .bind(table)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                fields
            }
            None => {
                sqlx::query(
                    "INSERT INTO nodes (table_name, id, fields_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(table)
                .bind(id)
                .bind(serde_json::to_string(&create_fields)?)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                create_fields
            }
        };

        tx.commit().await?;
        Ok(final_fields)
    }

    pub async fn get_node(&self, table: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT fields_json FROM nodes WHERE table_name = ? AND id = ?")
                .bind(table)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(j,)| serde_json::from_str(&j)).transpose()?)
    }

    /// Idempotent edge creation keyed by `(label, src, dst)`. On duplicate,
    /// merges `on_duplicate_update` (typically refreshing `last_seen` /
    /// `last_confirmed`) rather than inserting a second edge.
    pub async fn relate(
        &self,
        label: &str,
        src_table: &str,
        src_id: &str,
        dst_table: &str,
        dst_id: &str,
        edge_fields: Value,
        on_duplicate_update: Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT fields_json FROM edges WHERE label = ? AND src_table = ? AND src_id = ? AND dst_table = ? AND dst_id = ?",
        )
        .bind(label)
        .bind(src_table)
        .bind(src_id)
        .bind(dst_table)
        .bind(dst_id)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some((fields_json,)) => {
                let mut fields: Value = serde_json::from_str(&fields_json)?;
                merge_fields(&mut fields, &on_duplicate_update);
                sqlx::query(
                    "UPDATE edges SET fields_json = ?, updated_at = ? WHERE label = ? AND src_table = ? AND src_id = ? AND dst_table = ? AND dst_id = ?",
                )
                .bind(serde_json::to_string(&fields)?)
                .bind(&now)
                .bind(label)
                .bind(src_table)
                .bind(src_id)
                .bind(dst_table)
                .bind(dst_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO edges (label, src_table, src_id, dst_table, dst_id, fields_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(label)
                .bind(src_table)
                .bind(src_id)
                .bind(dst_table)
                .bind(dst_id)
                .bind(serde_json::to_string(&edge_fields)?)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn count_edges(
        &self,
        label: &str,
        src_table: &str,
        src_id: &str,
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM edges WHERE label = ? AND src_table = ? AND src_id = ?",
        )
        .bind(label)
        .bind(src_table)
        .bind(src_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::T_HOST;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_node_creates_then_merges() {
        let store = Store::in_memory().await.unwrap();
        let created = store
            .upsert_node(T_HOST, "1_2_3_4", json!({"ip": "1.2.3.4", "asn": null}), json!({}))
            .await
            .unwrap();
        assert_eq!(created["ip"], "1.2.3.4");

        let updated = store
            .upsert_node(
                T_HOST,
                "1_2_3_4",
                json!({"ip": "1.2.3.4"}),
                json!({"asn": 15169}),
            )
            .await
            .unwrap();
        assert_eq!(updated["asn"], 15169);
        assert_eq!(updated["ip"], "1.2.3.4");
    }

    #[tokio::test]
    async fn relate_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store
            .relate("HAS", "host", "h1", "port", "p1", json!({"n": 1}), json!({"n": 2}))
            .await
            .unwrap();
        store
            .relate("HAS", "host", "h1", "port", "p1", json!({"n": 1}), json!({"n": 2}))
            .await
            .unwrap();
        let count = store.count_edges("HAS", "host", "h1").await.unwrap();
        assert_eq!(count, 1);
    }
}
