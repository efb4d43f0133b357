use crate::models::*;
use anyhow::Result;
use chrono::{NaiveDate, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row};

/// Initialize database schema
pub async fn init_schema(pool: &Pool<Postgres>) -> Result<()> {
    // ============================================================
    // Memory events table (append-only turn observations)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_events (
            tenant_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            channel TEXT,
            turn_index INT,
            speaker TEXT NOT NULL,
            raw_text_ref TEXT,
            summary TEXT,
            intent_top1 TEXT,
            intent_topk JSONB DEFAULT '[]',
            stage TEXT,
            objection_type TEXT,
            entities JSONB DEFAULT '[]',
            sentiment TEXT,
            tension DOUBLE PRECISION,
            compliance_flags JSONB DEFAULT '[]',
            coach_suggestions_shown JSONB DEFAULT '[]',
            coach_suggestions_taken JSONB DEFAULT '[]',
            metadata JSONB DEFAULT '{}',
            created_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (tenant_id, event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memory_events_session ON memory_events(tenant_id, session_id)",
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Knowledge table (versioned, effectivity-windowed)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_knowledge (
            tenant_id TEXT NOT NULL,
            knowledge_id TEXT NOT NULL,
            version TEXT NOT NULL,
            domain TEXT NOT NULL,
            product_id TEXT,
            structured_content JSONB NOT NULL DEFAULT '{}',
            source_ref TEXT,
            effective_from DATE NOT NULL,
            effective_to DATE,
            is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
            citation_snippets JSONB DEFAULT '[]',
            last_used_at TIMESTAMPTZ,
            use_count BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            updated_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (tenant_id, knowledge_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memory_knowledge_domain ON memory_knowledge(tenant_id, domain)",
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Strategy units table
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_strategy_units (
            tenant_id TEXT NOT NULL,
            strategy_id TEXT NOT NULL,
            strategy_type TEXT NOT NULL,
            trigger_intent TEXT,
            trigger_stage TEXT,
            trigger_objection_type TEXT,
            trigger_level TEXT,
            trigger_condition JSONB DEFAULT '{}',
            steps JSONB DEFAULT '[]',
            scripts JSONB DEFAULT '[]',
            dos_donts JSONB DEFAULT '{}',
            evidence_event_ids JSONB DEFAULT '[]',
            stats JSONB DEFAULT '{}',
            is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
            last_used_at TIMESTAMPTZ,
            use_count BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            updated_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (tenant_id, strategy_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Outcomes table (immutable)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_outcomes (
            outcome_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            session_id TEXT,
            adopted BOOLEAN NOT NULL,
            adopt_type TEXT,
            stage_before TEXT,
            stage_after TEXT,
            eval_scores JSONB DEFAULT '{}',
            compliance_result TEXT,
            final_result TEXT,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Personas table (per-user coaching profile)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_personas (
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            level TEXT,
            weakness_tags JSONB DEFAULT '[]',
            last_eval_summary TEXT,
            last_improvements JSONB DEFAULT '[]',
            next_actions JSONB DEFAULT '[]',
            history_stats JSONB DEFAULT '{}',
            created_at TIMESTAMPTZ DEFAULT NOW(),
            updated_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (tenant_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Audit table (append-only)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_audits (
            request_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            user_id TEXT,
            session_id TEXT,
            input_digest TEXT,
            route TEXT,
            retrieved_ids JSONB DEFAULT '[]',
            citations JSONB DEFAULT '[]',
            compliance_hits JSONB DEFAULT '[]',
            output_digest TEXT,
            metadata JSONB DEFAULT '{}',
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memory_audits_tenant ON memory_audits(tenant_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn json_list(value: serde_json::Value) -> Vec<String> {
    serde_json::from_value(value).unwrap_or_default()
}

// ============================================================
// Events
// ============================================================

pub async fn insert_event(pool: &Pool<Postgres>, event: &MemoryEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO memory_events (
            tenant_id, event_id, user_id, session_id, channel, turn_index, speaker,
            raw_text_ref, summary, intent_top1, intent_topk, stage, objection_type,
            entities, sentiment, tension, compliance_flags,
            coach_suggestions_shown, coach_suggestions_taken, metadata
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)
        ON CONFLICT (tenant_id, event_id) DO NOTHING
        "#,
    )
    .bind(&event.tenant_id)
    .bind(&event.event_id)
    .bind(&event.user_id)
    .bind(&event.session_id)
    .bind(&event.channel)
    .bind(event.turn_index)
    .bind(&event.speaker)
    .bind(&event.raw_text_ref)
    .bind(&event.summary)
    .bind(&event.intent_top1)
    .bind(serde_json::json!(event.intent_topk))
    .bind(&event.stage)
    .bind(&event.objection_type)
    .bind(serde_json::json!(event.entities))
    .bind(&event.sentiment)
    .bind(event.tension)
    .bind(serde_json::json!(event.compliance_flags))
    .bind(serde_json::json!(event.coach_suggestions_shown))
    .bind(serde_json::json!(event.coach_suggestions_taken))
    .bind(&event.metadata)
    .execute(pool)
    .await?;
    Ok(())
}

fn event_from_row(row: &PgRow) -> Result<MemoryEvent> {
    Ok(MemoryEvent {
        event_id: row.try_get("event_id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        channel: row.try_get("channel")?,
        turn_index: row.try_get("turn_index")?,
        speaker: row.try_get("speaker")?,
        raw_text_ref: row.try_get("raw_text_ref")?,
        summary: row.try_get("summary")?,
        intent_top1: row.try_get("intent_top1")?,
        intent_topk: json_list(row.try_get("intent_topk")?),
        stage: row.try_get("stage")?,
        objection_type: row.try_get("objection_type")?,
        entities: json_list(row.try_get("entities")?),
        sentiment: row.try_get("sentiment")?,
        tension: row.try_get("tension")?,
        compliance_flags: json_list(row.try_get("compliance_flags")?),
        coach_suggestions_shown: json_list(row.try_get("coach_suggestions_shown")?),
        coach_suggestions_taken: json_list(row.try_get("coach_suggestions_taken")?),
        metadata: row.try_get("metadata")?,
    })
}

pub async fn get_event(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    event_id: &str,
) -> Result<Option<MemoryEvent>> {
    let row = sqlx::query("SELECT * FROM memory_events WHERE tenant_id = $1 AND event_id = $2")
        .bind(tenant_id)
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| event_from_row(&r)).transpose()
}

/// Evidence lookup for strategy hits
pub async fn events_by_ids(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    event_ids: &[String],
) -> Result<Vec<MemoryEvent>> {
    if event_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        "SELECT * FROM memory_events WHERE tenant_id = $1 AND event_id = ANY($2)",
    )
    .bind(tenant_id)
    .bind(event_ids)
    .fetch_all(pool)
    .await?;
    rows.iter().map(event_from_row).collect()
}

// ============================================================
// Knowledge
// ============================================================

pub async fn upsert_knowledge(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    payload: &KnowledgeWriteRequest,
    effective_from: NaiveDate,
    effective_to: Option<NaiveDate>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO memory_knowledge (
            tenant_id, knowledge_id, version, domain, product_id, structured_content,
            source_ref, effective_from, effective_to, is_enabled, citation_snippets
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
        ON CONFLICT (tenant_id, knowledge_id, version) DO UPDATE SET
            domain = EXCLUDED.domain,
            product_id = EXCLUDED.product_id,
            structured_content = EXCLUDED.structured_content,
            source_ref = EXCLUDED.source_ref,
            effective_from = EXCLUDED.effective_from,
            effective_to = EXCLUDED.effective_to,
            is_enabled = EXCLUDED.is_enabled,
            citation_snippets = EXCLUDED.citation_snippets,
            updated_at = NOW()
        "#,
    )
    .bind(tenant_id)
    .bind(&payload.knowledge_id)
    .bind(&payload.version)
    .bind(&payload.domain)
    .bind(&payload.product_id)
    .bind(&payload.structured_content)
    .bind(&payload.source_ref)
    .bind(effective_from)
    .bind(effective_to)
    .bind(payload.is_enabled)
    .bind(serde_json::json!(payload.citation_snippets))
    .execute(pool)
    .await?;
    Ok(())
}

fn knowledge_from_row(row: &PgRow) -> Result<MemoryKnowledge> {
    Ok(MemoryKnowledge {
        tenant_id: row.try_get("tenant_id")?,
        knowledge_id: row.try_get("knowledge_id")?,
        version: row.try_get("version")?,
        domain: row.try_get("domain")?,
        product_id: row.try_get("product_id")?,
        structured_content: row.try_get("structured_content")?,
        source_ref: row.try_get("source_ref")?,
        effective_from: row.try_get("effective_from")?,
        effective_to: row.try_get("effective_to")?,
        is_enabled: row.try_get("is_enabled")?,
        citation_snippets: json_list(row.try_get("citation_snippets")?),
        last_used_at: row.try_get("last_used_at")?,
        use_count: row.try_get("use_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Enabled rows inside the effectivity window, newest first.
/// `domains` narrows by domain; `query` applies a substring match over the
/// JSON-encoded content. An empty query skips the substring filter.
pub async fn recall_knowledge(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    domains: Option<&[String]>,
    query: Option<&str>,
    today: NaiveDate,
    limit: i64,
) -> Result<Vec<MemoryKnowledge>> {
    let pattern = query.filter(|q| !q.is_empty()).map(|q| format!("%{}%", q));
    let rows = sqlx::query(
        r#"
        SELECT * FROM memory_knowledge
        WHERE tenant_id = $1
          AND is_enabled = TRUE
          AND effective_from <= $2
          AND (effective_to IS NULL OR effective_to >= $2)
          AND ($3::text[] IS NULL OR domain = ANY($3))
          AND ($4::text IS NULL OR structured_content::text ILIKE $4)
        ORDER BY updated_at DESC
        LIMIT $5
        "#,
    )
    .bind(tenant_id)
    .bind(today)
    .bind(domains)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(knowledge_from_row).collect()
}

pub async fn knowledge_by_ids(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    ids: &[String],
) -> Result<Vec<MemoryKnowledge>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        "SELECT * FROM memory_knowledge WHERE tenant_id = $1 AND knowledge_id = ANY($2)",
    )
    .bind(tenant_id)
    .bind(ids)
    .fetch_all(pool)
    .await?;
    rows.iter().map(knowledge_from_row).collect()
}

/// Reactivation: bump recall bookkeeping for rows that were just returned
pub async fn reactivate_knowledge(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    ids: &[String],
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE memory_knowledge
        SET last_used_at = $3, use_count = use_count + 1
        WHERE tenant_id = $1 AND knowledge_id = ANY($2)
        "#,
    )
    .bind(tenant_id)
    .bind(ids)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================
// Strategy units
// ============================================================

pub async fn upsert_strategy(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    payload: &StrategyWriteRequest,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO memory_strategy_units (
            tenant_id, strategy_id, strategy_type,
            trigger_intent, trigger_stage, trigger_objection_type, trigger_level,
            trigger_condition, steps, scripts, dos_donts, evidence_event_ids, stats, is_enabled
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,TRUE)
        ON CONFLICT (tenant_id, strategy_id) DO UPDATE SET
            strategy_type = EXCLUDED.strategy_type,
            trigger_intent = EXCLUDED.trigger_intent,
            trigger_stage = EXCLUDED.trigger_stage,
            trigger_objection_type = EXCLUDED.trigger_objection_type,
            trigger_level = EXCLUDED.trigger_level,
            trigger_condition = EXCLUDED.trigger_condition,
            steps = EXCLUDED.steps,
            scripts = EXCLUDED.scripts,
            dos_donts = EXCLUDED.dos_donts,
            evidence_event_ids = EXCLUDED.evidence_event_ids,
            stats = EXCLUDED.stats,
            updated_at = NOW()
        "#,
    )
    .bind(tenant_id)
    .bind(&payload.strategy_id)
    .bind(&payload.strategy_type)
    .bind(&payload.trigger_condition.intent)
    .bind(&payload.trigger_condition.stage)
    .bind(&payload.trigger_condition.objection_type)
    .bind(&payload.trigger_condition.level)
    .bind(serde_json::to_value(&payload.trigger_condition)?)
    .bind(serde_json::json!(payload.steps))
    .bind(serde_json::json!(payload.scripts))
    .bind(&payload.dos_donts)
    .bind(serde_json::json!(payload.evidence_event_ids))
    .bind(serde_json::to_value(&payload.stats)?)
    .execute(pool)
    .await?;
    Ok(())
}

fn strategy_from_row(row: &PgRow) -> Result<MemoryStrategyUnit> {
    let trigger: TriggerCondition =
        serde_json::from_value(row.try_get("trigger_condition")?).unwrap_or_default();
    let stats: StrategyStats = serde_json::from_value(row.try_get("stats")?).unwrap_or_default();
    Ok(MemoryStrategyUnit {
        tenant_id: row.try_get("tenant_id")?,
        strategy_id: row.try_get("strategy_id")?,
        strategy_type: row.try_get("strategy_type")?,
        trigger_condition: trigger,
        steps: json_list(row.try_get("steps")?),
        scripts: json_list(row.try_get("scripts")?),
        dos_donts: row.try_get("dos_donts")?,
        evidence_event_ids: json_list(row.try_get("evidence_event_ids")?),
        stats,
        is_enabled: row.try_get("is_enabled")?,
        last_used_at: row.try_get("last_used_at")?,
        use_count: row.try_get("use_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Enabled strategies matching the trigger filters. A NULL trigger column
/// matches any requested value.
pub async fn recall_strategies(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    stage: Option<&str>,
    objection_type: Option<&str>,
    intent: Option<&str>,
    limit: i64,
) -> Result<Vec<MemoryStrategyUnit>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM memory_strategy_units
        WHERE tenant_id = $1
          AND is_enabled = TRUE
          AND ($2::text IS NULL OR trigger_stage IS NULL OR trigger_stage = $2)
          AND ($3::text IS NULL OR trigger_objection_type IS NULL OR trigger_objection_type = $3)
          AND ($4::text IS NULL OR trigger_intent IS NULL OR trigger_intent = $4)
        ORDER BY updated_at DESC
        LIMIT $5
        "#,
    )
    .bind(tenant_id)
    .bind(stage)
    .bind(objection_type)
    .bind(intent)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(strategy_from_row).collect()
}

pub async fn strategies_by_ids(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    ids: &[String],
) -> Result<Vec<MemoryStrategyUnit>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        "SELECT * FROM memory_strategy_units WHERE tenant_id = $1 AND strategy_id = ANY($2)",
    )
    .bind(tenant_id)
    .bind(ids)
    .fetch_all(pool)
    .await?;
    rows.iter().map(strategy_from_row).collect()
}

pub async fn get_strategy(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    strategy_id: &str,
) -> Result<Option<MemoryStrategyUnit>> {
    let row = sqlx::query(
        "SELECT * FROM memory_strategy_units WHERE tenant_id = $1 AND strategy_id = $2",
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| strategy_from_row(&r)).transpose()
}

/// Enabled strategies of one type, e.g. compliance_replacement units
pub async fn strategies_by_type(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    strategy_type: &str,
) -> Result<Vec<MemoryStrategyUnit>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM memory_strategy_units
        WHERE tenant_id = $1 AND strategy_type = $2 AND is_enabled = TRUE
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_type)
    .fetch_all(pool)
    .await?;
    rows.iter().map(strategy_from_row).collect()
}

pub async fn reactivate_strategies(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    ids: &[String],
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE memory_strategy_units
        SET last_used_at = $3, use_count = use_count + 1
        WHERE tenant_id = $1 AND strategy_id = ANY($2)
        "#,
    )
    .bind(tenant_id)
    .bind(ids)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Stats and evidence update for one strategy, committed atomically
pub async fn commit_strategy_stats(
    pool: &Pool<Postgres>,
    tenant_id: &str,
    strategy_id: &str,
    stats: &StrategyStats,
    evidence_event_ids: &[String],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE memory_strategy_units
        SET stats = $3, evidence_event_ids = $4, updated_at = NOW()
        WHERE tenant_id = $1 AND strategy_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(strategy_id)
    .bind(serde_json::to_value(stats)?)
    .bind(serde_json::json!(evidence_event_ids))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

// ============================================================
// Outcomes
// ============================================================

pub async fn insert_outcome(pool: &Pool<Postgres>, outcome: &MemoryOutcome) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO memory_outcomes (
            outcome_id, tenant_id, event_id, session_id, adopted, adopt_type,
            stage_before, stage_after, eval_scores, compliance_result, final_result
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
        "#,
    )
    .bind(&outcome.outcome_id)
    .bind(&outcome.tenant_id)
    .bind(&outcome.event_id)
    .bind(&outcome.session_id)
    .bind(outcome.adopted)
    .bind(&outcome.adopt_type)
    .bind(&outcome.stage_before)
    .bind(&outcome.stage_after)
    .bind(&outcome.eval_scores)
    .bind(&outcome.compliance_result)
    .bind(&outcome.final_result)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================
// Personas
// ============================================================

pub async fn upsert_persona(pool: &Pool<Postgres>, persona: &MemoryPersona) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO memory_personas (
            tenant_id, user_id, level, weakness_tags, last_eval_summary,
            last_improvements, next_actions, history_stats
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        ON CONFLICT (tenant_id, user_id) DO UPDATE SET
            level = EXCLUDED.level,
            weakness_tags = EXCLUDED.weakness_tags,
            last_eval_summary = EXCLUDED.last_eval_summary,
            last_improvements = EXCLUDED.last_improvements,
            next_actions = EXCLUDED.next_actions,
            history_stats = EXCLUDED.history_stats,
            updated_at = NOW()
        "#,
    )
    .bind(&persona.tenant_id)
    .bind(&persona.user_id)
    .bind(&persona.level)
    .bind(serde_json::json!(persona.weakness_tags))
    .bind(&persona.last_eval_summary)
    .bind(serde_json::json!(persona.last_improvements))
    .bind(serde_json::json!(persona.next_actions))
    .bind(&persona.history_stats)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================
// Audits
// ============================================================

pub async fn insert_audit(pool: &Pool<Postgres>, audit: &MemoryAudit) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO memory_audits (
            request_id, tenant_id, user_id, session_id, input_digest, route,
            retrieved_ids, citations, compliance_hits, output_digest, metadata
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
        ON CONFLICT (request_id) DO NOTHING
        "#,
    )
    .bind(&audit.request_id)
    .bind(&audit.tenant_id)
    .bind(&audit.user_id)
    .bind(&audit.session_id)
    .bind(&audit.input_digest)
    .bind(&audit.route)
    .bind(serde_json::json!(audit.retrieved_ids))
    .bind(serde_json::to_value(&audit.citations)?)
    .bind(serde_json::json!(audit.compliance_hits))
    .bind(&audit.output_digest)
    .bind(&audit.metadata)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_audit(pool: &Pool<Postgres>, request_id: &str) -> Result<Option<MemoryAudit>> {
    let row = sqlx::query("SELECT * FROM memory_audits WHERE request_id = $1")
        .bind(request_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| {
        let citations: Vec<Citation> =
            serde_json::from_value(r.try_get("citations")?).unwrap_or_default();
        Ok(MemoryAudit {
            request_id: r.try_get("request_id")?,
            tenant_id: r.try_get("tenant_id")?,
            user_id: r.try_get("user_id")?,
            session_id: r.try_get("session_id")?,
            input_digest: r.try_get("input_digest")?,
            route: r.try_get("route")?,
            retrieved_ids: json_list(r.try_get("retrieved_ids")?),
            citations,
            compliance_hits: json_list(r.try_get("compliance_hits")?),
            output_digest: r.try_get("output_digest")?,
            metadata: r.try_get("metadata")?,
        })
    })
    .transpose()
}
