use anyhow::Result;

/// Cross-encoder reranker client.
///
/// Scores (query, document) pairs against a reranker service. The primary
/// model is tried first, then the fallback model; when both fail the caller
/// keeps its fused ordering.
pub struct RerankService {
    pub client: reqwest::Client,
    pub base_url: String,
    enabled: bool,
    model: String,
    fallback_model: String,
}

impl RerankService {
    pub fn new(base_url: String, enabled: bool, model: String, fallback_model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url,
            enabled,
            model,
            fallback_model,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Relevance scores for the documents, in input order
    async fn score_with_model(
        &self,
        model: &str,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<f64>> {
        let body = serde_json::json!({
            "model": model,
            "query": query,
            "documents": documents,
        });

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("reranker error ({}): {}", status, error_text));
        }

        let json: serde_json::Value = response.json().await?;
        let results = json["results"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("reranker returned no results array"))?;

        let mut scores = vec![0.0_f64; documents.len()];
        for item in results {
            let index = item["index"].as_u64().unwrap_or(u64::MAX) as usize;
            let score = item["relevance_score"]
                .as_f64()
                .or_else(|| item["score"].as_f64())
                .unwrap_or(0.0);
            if index < scores.len() {
                scores[index] = score;
            }
        }
        Ok(scores)
    }

    /// Score the documents against the query; primary model first, then the
    /// fallback cross-encoder
    pub async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        match self.score_with_model(&self.model, query, documents).await {
            Ok(scores) => {
                tracing::debug!("reranked {} documents with {}", documents.len(), self.model);
                Ok(scores)
            }
            Err(primary_err) => {
                tracing::warn!(
                    "reranker model {} failed ({}), trying {}",
                    self.model,
                    primary_err,
                    self.fallback_model
                );
                let scores = self
                    .score_with_model(&self.fallback_model, query, documents)
                    .await?;
                Ok(scores)
            }
        }
    }
}
