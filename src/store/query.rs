// Read APIs (spec §4.5.2): host traversal, selector-filtered graph query,
// and vector similarity over vuln_doc embeddings.

use super::model::{self, Host, VulnDoc};
use super::Store;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::Sqlite;
use sqlx::QueryBuilder;

#[derive(Debug, Clone, Serialize)]
pub struct EdgeView {
    pub label: String,
    pub target_table: String,
    pub target_id: String,
    pub target_fields: Value,
    pub children: Vec<EdgeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    pub id: String,
    pub host: Host,
    pub edges: Vec<EdgeView>,
}

impl Store {
    /// Bounded traversal (§4.5.2, P8). `depth` 0 returns the host alone;
    /// each further level follows outgoing edges one hop further and never
    /// recurses past `depth` (§9: "bound every traversal by an explicit
    /// depth").
    pub async fn get_host(&self, ip: &str, depth: u8) -> Result<Option<HostView>, StoreError> {
        let id = crate::ids::host_id(ip);
        let Some(fields) = self.get_node(model::T_HOST, &id).await? else {
            return Ok(None);
        };
        let host: Host = serde_json::from_value(fields)?;
        let depth = depth.min(5);
        let edges = if depth == 0 {
            Vec::new()
        } else {
            self.traverse(model::T_HOST, &id, depth).await?
        };
        Ok(Some(HostView { id, host, edges }))
    }

    fn traverse<'a>(
        &'a self,
        table: &'a str,
        id: &'a str,
        remaining_depth: u8,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<EdgeView>, StoreError>> + 'a>>
    {
        Box::pin(async move {
            if remaining_depth == 0 {
                return Ok(Vec::new());
            }
            let rows: Vec<(String, String, String, String)> = sqlx::query_as(
                "SELECT label, dst_table, dst_id, fields_json FROM edges WHERE src_table = ? AND src_id = ?",
            )
            .bind(table)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

            let mut out = Vec::with_capacity(rows.len());
            for (label, dst_table, dst_id, _edge_fields) in rows {
                let target_fields = self
                    .get_node(&dst_table, &dst_id)
                    .await?
                    .unwrap_or(Value::Null);
                let children = self
                    .traverse(&dst_table, &dst_id, remaining_depth - 1)
                    .await?;
                out.push(EdgeView {
                    label,
                    target_table: dst_table,
                    target_id: dst_id,
                    target_fields,
                    children,
                });
            }
            Ok(out)
        })
    }

    /// Selector-filtered host listing (§4.5.2, §6.1 POST /v1/query/graph).
    pub async fn query_graph(&self, selector: &GraphSelector) -> Result<GraphPage, StoreError> {
        let limit = selector.limit.unwrap_or(50).clamp(1, 200);

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT h.id, h.fields_json FROM nodes h \
             LEFT JOIN edges e_has ON e_has.src_table = 'host' AND e_has.src_id = h.id AND e_has.label = 'HAS' AND e_has.dst_table = 'port' \
             LEFT JOIN nodes p ON p.table_name = 'port' AND p.id = e_has.dst_id \
             LEFT JOIN edges e_runs ON e_runs.src_table = 'port' AND e_runs.src_id = p.id AND e_runs.label = 'RUNS' AND e_runs.dst_table = 'service' \
             LEFT JOIN nodes sv ON sv.table_name = 'service' AND sv.id = e_runs.dst_id \
             WHERE h.table_name = 'host'",
        );

        if let Some(asn) = selector.asn {
            qb.push(" AND json_extract(h.fields_json, '$.asn') = ").push_bind(asn);
        }
        if let Some(country) = &selector.country {
            qb.push(" AND json_extract(h.fields_json, '$.country') = ").push_bind(country.clone());
        }
        if let Some(city) = &selector.city {
            qb.push(" AND json_extract(h.fields_json, '$.city') = ").push_bind(city.clone());
        }
        if let Some(region) = &selector.region {
            qb.push(" AND json_extract(h.fields_json, '$.region') = ").push_bind(region.clone());
        }
        if let Some(port) = selector.port {
            qb.push(" AND json_extract(p.fields_json, '$.number') = ").push_bind(port);
        }
        if let Some(name) = &selector.service_name {
            qb.push(" AND json_extract(sv.fields_json, '$.name') = ").push_bind(name.clone());
        }
        if let Some(product) = &selector.service_product {
            qb.push(" AND json_extract(sv.fields_json, '$.product') = ").push_bind(product.clone());
        }
        if let Some(cursor) = &selector.cursor {
            qb.push(" AND h.id > ").push_bind(cursor.clone());
        }

        qb.push(" ORDER BY h.id LIMIT ").push_bind(limit + 1);

        let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut results: Vec<GraphResultItem> = Vec::with_capacity(rows.len());
        for (id, fields_json) in rows {
            let host: Host = serde_json::from_str(&fields_json)?;
            results.push(GraphResultItem { id, host });
        }

        let next_cursor = if results.len() > limit as usize {
            results.pop().map(|item| item.id)
        } else {
            None
        };

        Ok(GraphPage { results, next_cursor })
    }

    /// Cosine similarity over `vuln_doc.embedding` (§4.5.2). Rows with an
    /// empty embedding are never returned (§9's resolution of the embedding
    /// Open Question). Brute-force because sqlite has no native vector
    /// index; acceptable at this store's scale and documented in DESIGN.md.
    pub async fn query_similar(
        &self,
        query_embedding: &[f32],
        k: u8,
    ) -> Result<Vec<(String, VulnDoc, f32)>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, fields_json FROM nodes WHERE table_name = ?")
                .bind(model::T_VULN_DOC)
                .fetch_all(&self.pool)
                .await?;

        let mut scored: Vec<(String, VulnDoc, f32)> = Vec::new();
        for (id, fields_json) in rows {
            let doc: VulnDoc = serde_json::from_str(&fields_json)?;
            if doc.embedding.is_empty() {
                continue;
            }
            if let Some(score) = cosine_similarity(query_embedding, &doc.embedding) {
                scored.push((id, doc, score));
            }
        }
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k as usize);
        Ok(scored)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    // Cosine distance metric (§3 invariant) expressed as a [0,1] similarity
    // score: (cos_sim + 1) / 2, so opposite vectors score 0 and identical
    // vectors score 1.
    Some(((dot / (norm_a * norm_b)) + 1.0) / 2.0)
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GraphSelector {
    pub asn: Option<u32>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub port: Option<u16>,
    pub service_name: Option<String>,
    pub service_product: Option<String>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphResultItem {
    pub id: String,
    #[serde(flatten)]
    pub host: Host,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphPage {
    pub results: Vec<GraphResultItem>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_scores_one() {
        let v = vec![1.0, 2.0, 3.0];
        let score = cosine_similarity(&v, &v).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors_scores_half() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let score = cosine_similarity(&a, &b).unwrap();
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_rejects_mismatched_length() {
        assert!(cosine_similarity(&[1.0, 2.0], &[1.0]).is_none());
    }

    #[tokio::test]
    async fn get_host_depth_zero_has_no_edges() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_node(
                model::T_HOST,
                "1_2_3_4",
                serde_json::json!({
                    "ip": "1.2.3.4", "first_seen": chrono::Utc::now(), "last_seen": chrono::Utc::now(),
                    "last_scanned_at": chrono::Utc::now(), "asn": null, "country": null, "city": null, "region": null
                }),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        let view = store.get_host("1.2.3.4", 0).await.unwrap().unwrap();
        assert!(view.edges.is_empty());
    }

    #[tokio::test]
    async fn query_similar_skips_empty_embeddings() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_node(
                model::T_VULN_DOC,
                "CVE-2024-0001",
                serde_json::json!({
                    "title": "t", "summary": "s", "cvss": 9.0, "cpe": [], "refs": [],
                    "published": null, "modified": null, "embedding": []
                }),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        let results = store.query_similar(&[1.0, 0.0], 10).await.unwrap();
        assert!(results.is_empty());
    }
}
