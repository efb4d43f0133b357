use anyhow::Result;
use sqlx::{Pool, Postgres};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::bus::{subscriber, EventBus};
use crate::cache::RedisGateway;
use crate::db;
use crate::models::{EventType, MemoryOutcomeEvent};

const DEDUP_TTL_SECONDS: u64 = 60 * 60 * 24;

// ============================================================
// Outcome Aggregator
// ============================================================
//
// Consumes `memory.outcome_recorded` and folds each outcome into the
// per-strategy statistics exactly once. Idempotence comes from a dedupe
// claim on the outcome id; the claim is released when processing fails so
// a redelivery can retry.
// ============================================================

pub struct OutcomeAggregator {
    pool: Pool<Postgres>,
    gateway: Option<RedisGateway>,
    // Process-local fallback when Redis is not configured
    seen: Mutex<HashSet<String>>,
}

impl OutcomeAggregator {
    pub fn new(pool: Pool<Postgres>, gateway: Option<RedisGateway>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            gateway,
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// Attach to the bus; delivery starts immediately
    pub async fn register(self: &Arc<Self>, bus: &dyn EventBus) -> Result<()> {
        let aggregator = self.clone();
        bus.subscribe(
            EventType::MemoryOutcomeRecorded.as_str(),
            subscriber(move |payload| {
                let aggregator = aggregator.clone();
                async move {
                    let event: MemoryOutcomeEvent = serde_json::from_value(payload)?;
                    aggregator.handle_outcome(event).await
                }
            }),
        )
        .await?;
        tracing::info!("outcome aggregator subscribed");
        Ok(())
    }

    async fn claim(&self, key: &str) -> bool {
        match &self.gateway {
            Some(gateway) => match gateway.claim_nx_ex(key, DEDUP_TTL_SECONDS).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!("dedupe claim failed for {}: {}", key, e);
                    false
                }
            },
            None => self.seen.lock().expect("dedupe set poisoned").insert(key.to_string()),
        }
    }

    async fn release(&self, key: &str) {
        match &self.gateway {
            Some(gateway) => {
                let _ = gateway.del(key).await;
            }
            None => {
                self.seen.lock().expect("dedupe set poisoned").remove(key);
            }
        }
    }

    pub async fn handle_outcome(&self, payload: MemoryOutcomeEvent) -> Result<()> {
        let dedupe_key = format!("memory:outcome:{}", payload.outcome_id);
        if !self.claim(&dedupe_key).await {
            tracing::debug!("duplicate outcome dropped: {}", payload.outcome_id);
            return Ok(());
        }

        match self.apply(&payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Give a later redelivery a chance to reprocess
                self.release(&dedupe_key).await;
                Err(e)
            }
        }
    }

    async fn apply(&self, payload: &MemoryOutcomeEvent) -> Result<()> {
        let mut strategy_ids = payload.strategy_ids.clone();
        if strategy_ids.is_empty() {
            if let Some(event) =
                db::get_event(&self.pool, &payload.tenant_id, &payload.event_id).await?
            {
                strategy_ids = resolve_strategy_ids(
                    &event.coach_suggestions_taken,
                    &event.coach_suggestions_shown,
                    payload.adopted,
                );
            }
        }

        if strategy_ids.is_empty() {
            return Ok(());
        }

        let progressed = progressed(payload.stage_before.as_deref(), payload.stage_after.as_deref());
        let risked = payload.compliance_result.as_deref() == Some("blocked");

        for strategy_id in &strategy_ids {
            let Some(mut strategy) =
                db::get_strategy(&self.pool, &payload.tenant_id, strategy_id).await?
            else {
                continue;
            };

            strategy
                .stats
                .record_outcome(payload.adopted, progressed, risked);

            // Evidence links are a set; the event id appears at most once
            if !strategy.evidence_event_ids.contains(&payload.event_id) {
                strategy.evidence_event_ids.push(payload.event_id.clone());
            }

            db::commit_strategy_stats(
                &self.pool,
                &payload.tenant_id,
                strategy_id,
                &strategy.stats,
                &strategy.evidence_event_ids,
            )
            .await?;
        }

        tracing::debug!(
            "outcome {} folded into {} strategies",
            payload.outcome_id,
            strategy_ids.len()
        );
        Ok(())
    }
}

/// Strategies affected by an outcome: taken suggestions always count,
/// shown-only suggestions count only when the rep adopted the advice
pub fn resolve_strategy_ids(taken: &[String], shown: &[String], adopted: bool) -> Vec<String> {
    if !taken.is_empty() {
        taken.to_vec()
    } else if adopted {
        shown.to_vec()
    } else {
        Vec::new()
    }
}

fn progressed(stage_before: Option<&str>, stage_after: Option<&str>) -> bool {
    match (stage_before, stage_after) {
        (Some(before), Some(after)) => !before.is_empty() && !after.is_empty() && before != after,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taken_suggestions_always_resolve() {
        let taken = vec!["s1".to_string()];
        let shown = vec!["s2".to_string()];
        assert_eq!(resolve_strategy_ids(&taken, &shown, false), vec!["s1"]);
        assert_eq!(resolve_strategy_ids(&taken, &shown, true), vec!["s1"]);
    }

    #[test]
    fn shown_suggestions_resolve_only_when_adopted() {
        let shown = vec!["s2".to_string(), "s3".to_string()];
        assert_eq!(resolve_strategy_ids(&[], &shown, true), shown);
        assert!(resolve_strategy_ids(&[], &shown, false).is_empty());
    }

    #[test]
    fn progress_requires_a_real_stage_change() {
        assert!(progressed(Some("discovery"), Some("proposal")));
        assert!(!progressed(Some("discovery"), Some("discovery")));
        assert!(!progressed(None, Some("proposal")));
        assert!(!progressed(Some("discovery"), None));
        assert!(!progressed(Some(""), Some("proposal")));
    }
}
