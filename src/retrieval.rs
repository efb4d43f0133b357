use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::Arc;

use crate::audit::{compact_json, hash_text, write_audit};
use crate::cache::RedisGateway;
use crate::config::Settings;
use crate::db;
use crate::decay::decay_weight;
use crate::error::ApiError;
use crate::models::*;
use crate::rerank::RerankService;
use crate::vector::{VectorService, KNOWLEDGE_COLLECTION, STRATEGY_COLLECTION};

// ============================================================
// Hybrid Retriever
// ============================================================
//
// One memory query runs through:
//   route -> per-route recall (SQL + vector) -> decay-weighted RRF fusion
//   -> cross-encoder rerank -> reactivation -> citations -> audit
//
// The vector store and the reranker degrade gracefully: recall falls back
// to the SQL result, ranking falls back to the fused order.
// ============================================================

const RRF_K: f64 = 60.0;
const FUSED_CANDIDATES: usize = 20;
const VECTOR_RECALL: usize = 20;

/// Keyword routing. The lists are configuration so the rule can be swapped
/// per deployment.
pub fn route_query(
    intent_hint: Option<&str>,
    query: &str,
    knowledge_keywords: &[String],
    strategy_keywords: &[String],
) -> RouteDecision {
    let hint = intent_hint.unwrap_or("").to_lowercase();
    let text = query.to_lowercase();

    if knowledge_keywords.iter().any(|k| hint.contains(&k.to_lowercase())) {
        return RouteDecision::Knowledge;
    }
    if knowledge_keywords.iter().any(|k| text.contains(&k.to_lowercase())) {
        return RouteDecision::Knowledge;
    }
    if strategy_keywords.iter().any(|k| hint.contains(&k.to_lowercase())) {
        return RouteDecision::Strategy;
    }
    if strategy_keywords.iter().any(|k| text.contains(&k.to_lowercase())) {
        return RouteDecision::Strategy;
    }
    RouteDecision::Fallback
}

/// Reciprocal-rank fusion with multiplicative decay weights. Each list
/// position contributes w/(rank + k); duplicate ids accumulate score and
/// keep the first content seen.
pub fn rrf_fuse(
    sql_hits: &[MemoryQueryHit],
    vector_hits: &[MemoryQueryHit],
    decay_weights: &HashMap<String, f64>,
    keep: usize,
) -> Vec<MemoryQueryHit> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut hit_map: HashMap<String, MemoryQueryHit> = HashMap::new();

    for (rank, hit) in sql_hits.iter().enumerate() {
        let weight = decay_weights.get(&hit.id).copied().unwrap_or(1.0);
        *scores.entry(hit.id.clone()).or_insert(0.0) += weight / (rank as f64 + RRF_K);
        hit_map.entry(hit.id.clone()).or_insert_with(|| hit.clone());
    }
    for (rank, hit) in vector_hits.iter().enumerate() {
        let weight = decay_weights.get(&hit.id).copied().unwrap_or(1.0);
        *scores.entry(hit.id.clone()).or_insert(0.0) += weight / (rank as f64 + RRF_K);
        hit_map.entry(hit.id.clone()).or_insert_with(|| hit.clone());
    }

    let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    ranked
        .into_iter()
        .take(keep)
        .filter_map(|(id, score)| {
            hit_map.remove(&id).map(|mut hit| {
                hit.score = score;
                hit
            })
        })
        .collect()
}

pub struct RetrievalService {
    pool: Pool<Postgres>,
    gateway: Option<RedisGateway>,
    vector: Option<Arc<VectorService>>,
    rerank: Arc<RerankService>,
    settings: Settings,
}

impl RetrievalService {
    pub fn new(
        pool: Pool<Postgres>,
        gateway: Option<RedisGateway>,
        vector: Option<Arc<VectorService>>,
        rerank: Arc<RerankService>,
        settings: Settings,
    ) -> Self {
        Self {
            pool,
            gateway,
            vector,
            rerank,
            settings,
        }
    }

    /// Vector recall for one collection; failures degrade to an empty list
    async fn vector_recall(
        &self,
        collection: &str,
        id_field: &str,
        hit_type: &str,
        tenant_id: &str,
        query: &str,
    ) -> Vec<MemoryQueryHit> {
        let (Some(vector), Some(gateway)) = (&self.vector, &self.gateway) else {
            return Vec::new();
        };
        match vector
            .search_tenant(gateway, collection, tenant_id, query, VECTOR_RECALL)
            .await
        {
            Ok(results) => results
                .into_iter()
                .filter_map(|result| {
                    let id = result.payload.get(id_field)?.as_str()?.to_string();
                    let content = result
                        .payload
                        .get("content")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    Some(MemoryQueryHit {
                        hit_type: hit_type.to_string(),
                        id,
                        score: result.score as f64,
                        content: serde_json::json!({ "content": content }),
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!("vector recall failed for {}: {}", collection, e);
                Vec::new()
            }
        }
    }

    /// Cross-encoder pass over the fused candidates; any failure keeps the
    /// fused order
    async fn rerank_hits(
        &self,
        query: &str,
        mut hits: Vec<MemoryQueryHit>,
        top_n: usize,
    ) -> Vec<MemoryQueryHit> {
        if hits.len() <= 1 || !self.rerank.is_enabled() {
            hits.truncate(top_n);
            return hits;
        }

        let documents: Vec<String> = hits.iter().map(|hit| compact_json(&hit.content)).collect();
        match self.rerank.score(query, &documents).await {
            Ok(scores) => {
                for (hit, score) in hits.iter_mut().zip(scores) {
                    hit.score = score;
                }
                hits.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            Err(e) => {
                tracing::warn!("reranking failed, keeping fused order: {}", e);
            }
        }
        hits.truncate(top_n);
        hits
    }

    async fn query_knowledge(
        &self,
        payload: &MemoryQueryRequest,
    ) -> Result<(Vec<MemoryQueryHit>, Vec<Citation>)> {
        let today = Utc::now().date_naive();
        let domains = payload
            .intent_hint
            .as_ref()
            .map(|_| self.settings.route_knowledge_keywords.clone());

        let rows = db::recall_knowledge(
            &self.pool,
            &payload.tenant_id,
            domains.as_deref(),
            Some(payload.query.as_str()),
            today,
            payload.top_k as i64,
        )
        .await?;

        let mut sql_hits = Vec::new();
        let mut decay_weights = HashMap::new();
        let now = Utc::now();
        for row in &rows {
            sql_hits.push(MemoryQueryHit {
                hit_type: "knowledge".to_string(),
                id: row.knowledge_id.clone(),
                score: 1.0,
                content: row.structured_content.clone(),
            });
            decay_weights.insert(row.knowledge_id.clone(), decay_weight(row.last_used_at, now));
        }

        let vector_hits = self
            .vector_recall(
                KNOWLEDGE_COLLECTION,
                "knowledge_id",
                "knowledge",
                &payload.tenant_id,
                &payload.query,
            )
            .await;

        let fused = rrf_fuse(&sql_hits, &vector_hits, &decay_weights, FUSED_CANDIDATES);
        let hits = self.rerank_hits(&payload.query, fused, payload.top_k).await;

        // Reactivation and citations for the returned rows
        let hit_ids: Vec<String> = hits.iter().map(|hit| hit.id.clone()).collect();
        let returned = db::knowledge_by_ids(&self.pool, &payload.tenant_id, &hit_ids).await?;
        let row_map: HashMap<&str, &MemoryKnowledge> = returned
            .iter()
            .map(|row| (row.knowledge_id.as_str(), row))
            .collect();

        let mut citations = Vec::new();
        for hit in &hits {
            if let Some(row) = row_map.get(hit.id.as_str()) {
                citations.push(Citation {
                    citation_type: "knowledge".to_string(),
                    id: row.knowledge_id.clone(),
                    version: Some(row.version.clone()),
                    snippet: row.citation_snippets.first().cloned(),
                    source_ref: row.source_ref.clone(),
                    rule_id: None,
                });
            }
        }
        db::reactivate_knowledge(&self.pool, &payload.tenant_id, &hit_ids).await?;

        Ok((hits, citations))
    }

    async fn query_strategy(
        &self,
        payload: &MemoryQueryRequest,
    ) -> Result<(Vec<MemoryQueryHit>, Vec<Citation>)> {
        let rows = db::recall_strategies(
            &self.pool,
            &payload.tenant_id,
            payload.stage.as_deref(),
            payload.objection_type.as_deref(),
            payload.intent_hint.as_deref(),
            payload.top_k as i64,
        )
        .await?;

        let mut sql_hits = Vec::new();
        let mut decay_weights = HashMap::new();
        let now = Utc::now();
        for row in &rows {
            sql_hits.push(MemoryQueryHit {
                hit_type: "strategy".to_string(),
                id: row.strategy_id.clone(),
                score: 1.0,
                content: serde_json::json!({
                    "steps": row.steps,
                    "scripts": row.scripts,
                    "dos_donts": row.dos_donts,
                }),
            });
            decay_weights.insert(row.strategy_id.clone(), decay_weight(row.last_used_at, now));
        }

        let vector_hits = self
            .vector_recall(
                STRATEGY_COLLECTION,
                "strategy_id",
                "strategy",
                &payload.tenant_id,
                &payload.query,
            )
            .await;

        let fused = rrf_fuse(&sql_hits, &vector_hits, &decay_weights, FUSED_CANDIDATES);
        let mut hits = self.rerank_hits(&payload.query, fused, payload.top_k).await;

        let hit_ids: Vec<String> = hits.iter().map(|hit| hit.id.clone()).collect();
        let returned = db::strategies_by_ids(&self.pool, &payload.tenant_id, &hit_ids).await?;
        let row_map: HashMap<String, MemoryStrategyUnit> = returned
            .into_iter()
            .map(|row| (row.strategy_id.clone(), row))
            .collect();

        let mut citations = Vec::new();
        for hit in &mut hits {
            if let Some(row) = row_map.get(&hit.id) {
                // Evidence events and live stats travel with the hit
                let evidence = db::events_by_ids(&self.pool, &payload.tenant_id, &row.evidence_event_ids)
                    .await?
                    .into_iter()
                    .map(|event| {
                        serde_json::json!({
                            "event_id": event.event_id,
                            "summary": event.summary,
                            "stage": event.stage,
                            "speaker": event.speaker,
                        })
                    })
                    .collect::<Vec<_>>();
                hit.content["evidence"] = serde_json::json!(evidence);
                hit.content["stats"] = serde_json::to_value(&row.stats)?;

                citations.push(Citation {
                    citation_type: "strategy".to_string(),
                    id: row.strategy_id.clone(),
                    version: None,
                    snippet: row.scripts.first().cloned(),
                    source_ref: None,
                    rule_id: None,
                });
            }
        }
        db::reactivate_strategies(&self.pool, &payload.tenant_id, &hit_ids).await?;

        Ok((hits, citations))
    }

    /// Full retrieval pipeline for one memory query
    pub async fn query(
        &self,
        request_id: &str,
        user_id: Option<&str>,
        payload: &MemoryQueryRequest,
    ) -> Result<MemoryQueryData, ApiError> {
        let route = route_query(
            payload.intent_hint.as_deref(),
            &payload.query,
            &self.settings.route_knowledge_keywords,
            &self.settings.route_strategy_keywords,
        );

        let (hits, citations) = match route {
            RouteDecision::Knowledge => self
                .query_knowledge(payload)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?,
            RouteDecision::Strategy => self
                .query_strategy(payload)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?,
            RouteDecision::Fallback => (Vec::new(), Vec::new()),
        };

        let input_digest = hash_text(&payload.query);
        let output_digest = hash_text(&compact_json(&serde_json::json!({ "hits": hits })));

        let audit = MemoryAudit {
            request_id: request_id.to_string(),
            tenant_id: payload.tenant_id.clone(),
            user_id: user_id.map(String::from),
            session_id: payload.session_id.clone(),
            input_digest: Some(input_digest),
            route: Some(route.as_str().to_string()),
            retrieved_ids: hits.iter().map(|hit| hit.id.clone()).collect(),
            citations: citations.clone(),
            compliance_hits: Vec::new(),
            output_digest: Some(output_digest),
            // The requested policy is recorded but does not steer routing
            metadata: serde_json::json!({ "route_policy": payload.route_policy }),
        };
        write_audit(&self.pool, &self.settings, &audit)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok(MemoryQueryData {
            route_decision: route,
            hits,
            citations,
        })
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn knowledge_keywords() -> Vec<String> {
        vec!["权益".to_string(), "活动".to_string(), "佣金".to_string()]
    }

    fn strategy_keywords() -> Vec<String> {
        vec!["异议".to_string(), "sop".to_string(), "推进".to_string()]
    }

    fn hit(id: &str) -> MemoryQueryHit {
        MemoryQueryHit {
            hit_type: "knowledge".to_string(),
            id: id.to_string(),
            score: 1.0,
            content: serde_json::json!({ "id": id }),
        }
    }

    mod routing {
        use super::*;

        #[test]
        fn entitlement_hint_routes_to_knowledge() {
            let route = route_query(
                Some("权益问答"),
                "年费减免",
                &knowledge_keywords(),
                &strategy_keywords(),
            );
            assert_eq!(route, RouteDecision::Knowledge);
        }

        #[test]
        fn keyword_in_query_routes_to_knowledge() {
            let route = route_query(None, "这次活动有什么优惠", &knowledge_keywords(), &strategy_keywords());
            assert_eq!(route, RouteDecision::Knowledge);
        }

        #[test]
        fn objection_routes_to_strategy() {
            let route = route_query(
                Some("异议处理"),
                "客户说太贵了",
                &knowledge_keywords(),
                &strategy_keywords(),
            );
            assert_eq!(route, RouteDecision::Strategy);
        }

        #[test]
        fn sop_keyword_is_case_insensitive() {
            let route = route_query(None, "What is the SOP here", &knowledge_keywords(), &strategy_keywords());
            assert_eq!(route, RouteDecision::Strategy);
        }

        #[test]
        fn knowledge_wins_over_strategy() {
            // Both keyword families present; entitlement takes precedence
            let route = route_query(
                Some("权益"),
                "异议",
                &knowledge_keywords(),
                &strategy_keywords(),
            );
            assert_eq!(route, RouteDecision::Knowledge);
        }

        #[test]
        fn no_keywords_falls_back() {
            let route = route_query(None, "hello there", &knowledge_keywords(), &strategy_keywords());
            assert_eq!(route, RouteDecision::Fallback);
        }
    }

    mod fusion {
        use super::*;

        #[test]
        fn single_list_preserves_order() {
            let sql = vec![hit("a"), hit("b"), hit("c")];
            let fused = rrf_fuse(&sql, &[], &HashMap::new(), 20);
            let ids: Vec<&str> = fused.iter().map(|h| h.id.as_str()).collect();
            assert_eq!(ids, vec!["a", "b", "c"]);
            assert!((fused[0].score - 1.0 / 60.0).abs() < 1e-9);
            assert!((fused[1].score - 1.0 / 61.0).abs() < 1e-9);
        }

        #[test]
        fn id_in_both_lists_accumulates_score() {
            let sql = vec![hit("a"), hit("b")];
            let vector = vec![hit("b"), hit("c")];
            let fused = rrf_fuse(&sql, &vector, &HashMap::new(), 20);

            // b appears at rank 1 in sql and rank 0 in vector
            assert_eq!(fused[0].id, "b");
            let expected = 1.0 / 61.0 + 1.0 / 60.0;
            assert!((fused[0].score - expected).abs() < 1e-9);
        }

        #[test]
        fn decay_weight_demotes_stale_rows() {
            let mut weights = HashMap::new();
            weights.insert("fresh".to_string(), 1.0);
            weights.insert("stale".to_string(), 0.01);

            // Stale leads the raw ranking but decays below the fresh row
            let reordered = rrf_fuse(&[hit("stale"), hit("fresh")], &[], &weights, 20);
            assert_eq!(reordered[0].id, "fresh");
        }

        #[test]
        fn keep_caps_the_candidate_count() {
            let sql: Vec<MemoryQueryHit> = (0..40).map(|i| hit(&format!("k{}", i))).collect();
            let fused = rrf_fuse(&sql, &[], &HashMap::new(), 20);
            assert_eq!(fused.len(), 20);
        }

        #[test]
        fn keep_larger_than_candidates_returns_all() {
            let sql = vec![hit("a"), hit("b")];
            let fused = rrf_fuse(&sql, &[], &HashMap::new(), 20);
            assert_eq!(fused.len(), 2);
        }

        #[test]
        fn empty_inputs_fuse_to_empty() {
            let fused = rrf_fuse(&[], &[], &HashMap::new(), 20);
            assert!(fused.is_empty());
        }
    }
}
