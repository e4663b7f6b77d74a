// Embedding provider (§4.5.2, §6.4): `embed(text) -> float[1536]`, 10s
// deadline. Failures surface as `503` for the similarity endpoint only —
// ingest/enrich paths never depend on this synchronously (§4.5.3).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const EMBEDDING_DIM: usize = 1536;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client build");
        Self { client, base_url }
    }
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&serde_json::json!({ "text": text, "model_dim": EMBEDDING_DIM }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("embedding provider returned {}", response.status()));
        }

        let body: EmbedResponse = response.json().await.map_err(|e| e.to_string())?;
        if body.embedding.len() != EMBEDDING_DIM {
            return Err("embedding provider returned wrong dimension".to_string());
        }
        Ok(body.embedding)
    }
}
