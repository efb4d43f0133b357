use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cache::RedisGateway;

/// Vector database service for semantic recall (Qdrant REST API)
pub struct VectorService {
    pub client: reqwest::Client,
    pub base_url: String,
    embedding_url: String,
    embedding_model: String,
    embedding_dimension: usize,
}

/// Collections used by the memory service
pub const KNOWLEDGE_COLLECTION: &str = "memory_knowledge";
pub const STRATEGY_COLLECTION: &str = "memory_strategy_unit";
pub const EVENT_COLLECTION: &str = "memory_event_summary";

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

impl VectorService {
    pub fn new(
        base_url: String,
        embedding_url: String,
        embedding_model: String,
        embedding_dimension: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            embedding_url,
            embedding_model,
            embedding_dimension,
        }
    }

    /// Ensure a collection exists with the configured vector size
    pub async fn init_collection(&self, collection_name: &str) -> Result<()> {
        let check_url = format!("{}/collections/{}", self.base_url, collection_name);
        let check_response = self.client.get(&check_url).send().await?;

        if check_response.status().is_success() {
            tracing::info!("collection '{}' already exists", collection_name);
            return Ok(());
        }

        let body = serde_json::json!({
            "vectors": {
                "size": self.embedding_dimension,
                "distance": "Cosine"
            }
        });

        let response = self.client.put(&check_url).json(&body).send().await?;
        if !response.status().is_success() {
            let error = response.text().await?;
            return Err(anyhow::anyhow!("failed to create collection: {}", error));
        }

        tracing::info!("created collection '{}'", collection_name);
        Ok(())
    }

    /// Upsert one document; the payload always carries tenant_id for filtering
    pub async fn upsert(
        &self,
        collection_name: &str,
        id: &str,
        vector: Vec<f32>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let url = format!("{}/collections/{}/points", self.base_url, collection_name);

        let body = serde_json::json!({
            "points": [{
                "id": id,
                "vector": vector,
                "payload": payload
            }]
        });

        let response = self
            .client
            .put(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let error = response.text().await?;
            tracing::error!("vector upsert failed: {}", error);
            return Err(anyhow::anyhow!("failed to upsert vector: {}", error));
        }

        Ok(())
    }

    /// Similarity search with an optional Qdrant filter
    pub async fn search(
        &self,
        collection_name: &str,
        query_vector: Vec<f32>,
        limit: usize,
        filter: Option<serde_json::Value>,
    ) -> Result<Vec<SearchResult>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, collection_name
        );

        let mut body = serde_json::json!({
            "vector": query_vector,
            "limit": limit,
            "with_payload": true
        });
        if let Some(f) = filter {
            body["filter"] = f;
        }

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let error = response.text().await?;
            return Err(anyhow::anyhow!("search failed: {}", error));
        }

        let json: serde_json::Value = response.json().await?;
        let results = json["result"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        let id = item["id"]
                            .as_str()
                            .map(String::from)
                            .or_else(|| item["id"].as_u64().map(|n| n.to_string()))?;
                        Some(SearchResult {
                            id,
                            score: item["score"].as_f64()? as f32,
                            payload: serde_json::from_value(item["payload"].clone()).ok()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(results)
    }

    pub async fn delete(&self, collection_name: &str, id: &str) -> Result<()> {
        let url = format!(
            "{}/collections/{}/points/delete",
            self.base_url, collection_name
        );
        let body = serde_json::json!({ "points": [id] });

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let error = response.text().await?;
            return Err(anyhow::anyhow!("failed to delete vector: {}", error));
        }
        Ok(())
    }

    /// Embed text via the embedding service, with a Redis cache in front
    pub async fn generate_embedding_cached(
        &self,
        text: &str,
        cache: &RedisGateway,
    ) -> Result<Vec<f32>> {
        if let Ok(Some(cached)) = cache.get_cached_embedding(text).await {
            tracing::debug!("embedding cache hit");
            return Ok(cached);
        }

        let embedding = self.generate_embedding(text).await?;

        // Fire-and-forget write-back
        let cache_clone = cache.clone();
        let embedding_clone = embedding.clone();
        let text_owned = text.to_string();
        tokio::spawn(async move {
            let _ = cache_clone
                .cache_embedding(&text_owned, &embedding_clone)
                .await;
        });

        Ok(embedding)
    }

    /// Embed text via the embedding service
    pub async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.embedding_url);
        let body = serde_json::json!({
            "model": self.embedding_model,
            "prompt": text
        });

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            // Deterministic hash vector keeps recall alive without the service
            tracing::warn!("embedding service failed, using fallback");
            return Ok(self.simple_embedding(text));
        }

        let json: serde_json::Value = response.json().await?;
        let embedding = json["embedding"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_else(|| self.simple_embedding(text));

        Ok(embedding)
    }

    /// Hash-derived vector used when the embedding service is unavailable
    fn simple_embedding(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();

        let mut embedding = Vec::with_capacity(self.embedding_dimension);
        for i in 0..self.embedding_dimension {
            let byte = hash[i % 32] as f32;
            embedding.push((byte / 255.0) * 2.0 - 1.0);
        }
        embedding
    }

    /// Tenant-scoped similarity search over a memory collection
    pub async fn search_tenant(
        &self,
        cache: &RedisGateway,
        collection: &str,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let query_embedding = self.generate_embedding_cached(query, cache).await?;
        let filter = serde_json::json!({
            "must": [{
                "key": "tenant_id",
                "match": { "value": tenant_id }
            }]
        });
        self.search(collection, query_embedding, limit, Some(filter))
            .await
    }

    /// Upsert a memory document with standard bookkeeping fields
    pub async fn upsert_memory(
        &self,
        cache: &RedisGateway,
        collection: &str,
        id: &str,
        content: &str,
        mut payload: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let embedding = self.generate_embedding_cached(content, cache).await?;
        payload.insert("content".to_string(), serde_json::json!(content));
        payload.insert(
            "timestamp".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
        self.upsert(collection, id, embedding, payload).await
    }
}
