use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::audit::{hash_text, write_audit};
use crate::auth::{self, CurrentUser};
use crate::compliance::{ComplianceContext, RiskLevel};
use crate::error::ApiError;
use crate::models::*;
use crate::vector::{EVENT_COLLECTION, KNOWLEDGE_COLLECTION, STRATEGY_COLLECTION};
use crate::{db, AppState};

fn request_id_from(headers: &HeaderMap, fallback: Option<&str>) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .or_else(|| fallback.map(String::from))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn parse_date(value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ApiError::Validation(format!("Invalid date format: {}", value)))
}

// ============================================================
// Auth Endpoints
// ============================================================

/// POST /api/v1/auth/token - Credential login
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    if !auth::verify_login(&state.settings, &payload.username, &payload.password) {
        return Err(ApiError::Unauthorized("bad credentials".to_string()));
    }
    let access_token = auth::issue_token(&state.settings, &payload.username)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

/// GET /api/v1/auth/me - Current subject
pub async fn me(user: CurrentUser) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "username": user.username,
        "user_id": user.user_id,
        "role": user.role,
        "tenant_id": user.tenant_id,
    }))
}

// ============================================================
// Memory Write Endpoints
// ============================================================

/// POST /api/v1/memory/write/event
pub async fn write_event(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<EventWriteRequest>,
) -> Result<Json<ApiEnvelope<EventWriteData>>, ApiError> {
    let request_id = request_id_from(&headers, None);
    user.enforce_tenant(&payload.tenant_id)?;

    let event = MemoryEvent {
        event_id: payload.event_id.clone(),
        tenant_id: payload.tenant_id.clone(),
        user_id: payload.user_id.clone(),
        session_id: payload.session_id.clone(),
        channel: payload.channel.clone(),
        turn_index: payload.turn_index,
        speaker: payload.speaker.clone(),
        raw_text_ref: payload.raw_text_ref.clone(),
        summary: payload.summary.clone(),
        intent_top1: payload.intent_top1.clone(),
        intent_topk: payload.intent_topk.clone(),
        stage: payload.stage.clone(),
        objection_type: payload.objection_type.clone(),
        entities: payload.entities.clone(),
        sentiment: payload.sentiment.clone(),
        tension: payload.tension,
        compliance_flags: payload.compliance_flags.clone(),
        coach_suggestions_shown: payload.coach_suggestions_shown.clone(),
        coach_suggestions_taken: payload.coach_suggestions_taken.clone(),
        metadata: payload.metadata.clone(),
    };
    db::insert_event(&state.db, &event).await?;

    let mut stored = vec!["postgres".to_string()];
    if let (Some(summary), Some(vector), Some(redis)) =
        (&payload.summary, &state.vector, &state.redis)
    {
        let mut meta: HashMap<String, serde_json::Value> = HashMap::new();
        meta.insert("tenant_id".to_string(), serde_json::json!(payload.tenant_id));
        meta.insert("user_id".to_string(), serde_json::json!(payload.user_id));
        meta.insert("session_id".to_string(), serde_json::json!(payload.session_id));
        meta.insert("event_id".to_string(), serde_json::json!(payload.event_id));
        meta.insert("speaker".to_string(), serde_json::json!(payload.speaker));
        meta.insert("stage".to_string(), serde_json::json!(payload.stage));
        match vector
            .upsert_memory(redis, EVENT_COLLECTION, &payload.event_id, summary, meta)
            .await
        {
            Ok(()) => stored.push("vector".to_string()),
            Err(e) => tracing::warn!("event vector upsert failed: {}", e),
        }
    }

    let recorded = serde_json::json!({
        "event_id": payload.event_id,
        "tenant_id": payload.tenant_id,
        "session_id": payload.session_id,
        "speaker": payload.speaker,
        "stage": payload.stage,
    });
    if let Err(e) = state
        .bus
        .publish(EventType::MemoryEventRecorded.as_str(), recorded)
        .await
    {
        tracing::warn!("failed to publish event-recorded: {}", e);
    }

    Ok(Json(ApiEnvelope::ok(
        request_id,
        EventWriteData {
            event_id: payload.event_id,
            stored,
        },
    )))
}

/// POST /api/v1/memory/write/outcome
pub async fn write_outcome(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<OutcomeWriteRequest>,
) -> Result<Json<ApiEnvelope<OutcomeWriteData>>, ApiError> {
    let request_id = request_id_from(&headers, None);
    let tenant_id = user.tenant_id.clone().unwrap_or_else(|| "default".to_string());
    let outcome_id = uuid::Uuid::new_v4().to_string();

    let outcome = MemoryOutcome {
        outcome_id: outcome_id.clone(),
        event_id: payload.event_id.clone(),
        session_id: payload.session_id.clone(),
        tenant_id: tenant_id.clone(),
        adopted: payload.adopted,
        adopt_type: payload.adopt_type.clone(),
        stage_before: payload.stage_before.clone(),
        stage_after: payload.stage_after.clone(),
        eval_scores: payload.eval_scores.clone(),
        compliance_result: payload.compliance_result.clone(),
        final_result: payload.final_result.clone(),
    };
    db::insert_outcome(&state.db, &outcome).await?;

    // Stats update happens asynchronously through the bus; handlers dedupe
    // on outcome_id, so redeliveries are harmless
    let strategy_ids = match db::get_event(&state.db, &tenant_id, &payload.event_id).await? {
        Some(event) => crate::outcomes::resolve_strategy_ids(
            &event.coach_suggestions_taken,
            &event.coach_suggestions_shown,
            payload.adopted,
        ),
        None => Vec::new(),
    };

    let event_payload = MemoryOutcomeEvent {
        event_id: payload.event_id.clone(),
        outcome_id: outcome_id.clone(),
        tenant_id,
        adopted: payload.adopted,
        adopt_type: payload.adopt_type.clone(),
        stage_before: payload.stage_before.clone(),
        stage_after: payload.stage_after.clone(),
        compliance_result: payload.compliance_result.clone(),
        final_result: payload.final_result.clone(),
        session_id: payload.session_id.clone(),
        user_id: Some(user.user_id.clone()),
        strategy_ids,
        request_id: Some(request_id.clone()),
    };
    if let Ok(value) = serde_json::to_value(&event_payload) {
        if let Err(e) = state
            .bus
            .publish(EventType::MemoryOutcomeRecorded.as_str(), value)
            .await
        {
            tracing::warn!("failed to publish outcome event: {}", e);
        }
    }

    Ok(Json(ApiEnvelope::ok(
        request_id,
        OutcomeWriteData {
            outcome_id,
            adopted: payload.adopted,
        },
    )))
}

/// POST /api/v1/memory/write/persona
pub async fn write_persona(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<PersonaWriteRequest>,
) -> Result<Json<ApiEnvelope<PersonaWriteData>>, ApiError> {
    let request_id = request_id_from(&headers, None);
    let tenant_id = user.tenant_id.clone().unwrap_or_else(|| "default".to_string());

    let persona = MemoryPersona {
        tenant_id,
        user_id: payload.user_id.clone(),
        level: payload.level,
        weakness_tags: payload.weakness_tags,
        last_eval_summary: payload.last_eval_summary,
        last_improvements: payload.last_improvements,
        next_actions: payload.next_actions,
        history_stats: payload.history_stats,
    };
    db::upsert_persona(&state.db, &persona).await?;

    Ok(Json(ApiEnvelope::ok(
        request_id,
        PersonaWriteData {
            user_id: payload.user_id,
            updated: true,
        },
    )))
}

/// POST /api/v1/memory/write/knowledge
pub async fn write_knowledge(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<KnowledgeWriteRequest>,
) -> Result<Json<ApiEnvelope<KnowledgeWriteData>>, ApiError> {
    let request_id = request_id_from(&headers, None);
    user.enforce_tenant(&payload.tenant_id)?;

    let effective_from = parse_date(&payload.effective_from)?;
    let effective_to = payload
        .effective_to
        .as_deref()
        .map(parse_date)
        .transpose()?;

    db::upsert_knowledge(&state.db, &payload.tenant_id, &payload, effective_from, effective_to)
        .await?;

    if let (Some(vector), Some(redis)) = (&state.vector, &state.redis) {
        let content = serde_json::to_string(&payload.structured_content).unwrap_or_default();
        let mut meta: HashMap<String, serde_json::Value> = HashMap::new();
        meta.insert("tenant_id".to_string(), serde_json::json!(payload.tenant_id));
        meta.insert(
            "knowledge_id".to_string(),
            serde_json::json!(payload.knowledge_id),
        );
        meta.insert("domain".to_string(), serde_json::json!(payload.domain));
        meta.insert("version".to_string(), serde_json::json!(payload.version));
        meta.insert("is_enabled".to_string(), serde_json::json!(payload.is_enabled));
        let point_id = format!("{}:{}", payload.knowledge_id, payload.version);
        if let Err(e) = vector
            .upsert_memory(redis, KNOWLEDGE_COLLECTION, &point_id, &content, meta)
            .await
        {
            tracing::warn!("knowledge vector upsert failed: {}", e);
        }
    }

    let update = serde_json::json!({
        "event_id": uuid::Uuid::new_v4().to_string(),
        "document_id": payload.knowledge_id,
        "operation": "upsert",
        "tenant_id": payload.tenant_id,
    });
    if let Err(e) = state
        .bus
        .publish(EventType::KnowledgeUpdated.as_str(), update)
        .await
    {
        tracing::warn!("failed to publish knowledge update: {}", e);
    }

    Ok(Json(ApiEnvelope::ok(
        request_id,
        KnowledgeWriteData {
            knowledge_id: payload.knowledge_id,
            version: payload.version,
        },
    )))
}

/// POST /api/v1/memory/write/strategy
pub async fn write_strategy(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<StrategyWriteRequest>,
) -> Result<Json<ApiEnvelope<StrategyWriteData>>, ApiError> {
    let request_id = request_id_from(&headers, None);
    user.enforce_tenant(&payload.tenant_id)?;

    db::upsert_strategy(&state.db, &payload.tenant_id, &payload).await?;

    if let (Some(vector), Some(redis)) = (&state.vector, &state.redis) {
        let content = serde_json::json!({
            "steps": payload.steps,
            "scripts": payload.scripts,
        })
        .to_string();
        let mut meta: HashMap<String, serde_json::Value> = HashMap::new();
        meta.insert("tenant_id".to_string(), serde_json::json!(payload.tenant_id));
        meta.insert(
            "strategy_id".to_string(),
            serde_json::json!(payload.strategy_id),
        );
        meta.insert("type".to_string(), serde_json::json!(payload.strategy_type));
        meta.insert(
            "trigger_stage".to_string(),
            serde_json::json!(payload.trigger_condition.stage),
        );
        meta.insert(
            "trigger_intent".to_string(),
            serde_json::json!(payload.trigger_condition.intent),
        );
        if let Err(e) = vector
            .upsert_memory(redis, STRATEGY_COLLECTION, &payload.strategy_id, &content, meta)
            .await
        {
            tracing::warn!("strategy vector upsert failed: {}", e);
        }
    }

    Ok(Json(ApiEnvelope::ok(
        request_id,
        StrategyWriteData {
            strategy_id: payload.strategy_id,
        },
    )))
}

// ============================================================
// Memory Query / Compliance / Trace
// ============================================================

/// POST /api/v1/memory/query - Hybrid retrieval
pub async fn query_memory(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<MemoryQueryRequest>,
) -> Result<Json<ApiEnvelope<MemoryQueryData>>, ApiError> {
    let request_id = request_id_from(&headers, None);
    user.enforce_tenant(&payload.tenant_id)?;

    let limit_key = format!("memory_query:{}", payload.tenant_id);
    if !state
        .rate_limiter
        .is_allowed(
            &limit_key,
            state.settings.rate_limit_requests,
            state.settings.rate_limit_window_secs,
        )
        .await
    {
        return Err(ApiError::RateLimited);
    }

    let data = state
        .retrieval
        .query(&request_id, Some(&user.user_id), &payload)
        .await?;

    Ok(Json(ApiEnvelope::ok(request_id, data)))
}

/// POST /api/v1/memory/comply/check - Compliance gate for candidate output
pub async fn comply_check(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<ComplianceCheckRequest>,
) -> Result<Json<ApiEnvelope<ComplianceCheckData>>, ApiError> {
    let request_id = request_id_from(&headers, payload.request_id.as_deref());

    let context = ComplianceContext {
        session_id: payload.session_id.clone(),
        user_id: Some(user.user_id.clone()),
        tenant_id: user.tenant_id.clone(),
    };
    let outcome = state
        .compliance
        .check(&state.db, &payload.candidate_response, context)
        .await;

    let hits: Vec<ComplianceHit> = outcome
        .risk_flags
        .iter()
        .map(|flag| ComplianceHit {
            rule_id: flag.risk_type.clone(),
            reason: "compliance_risk".to_string(),
        })
        .collect();

    let (status, action, safe_response) = match outcome.risk_level {
        RiskLevel::Block => (
            "blocked".to_string(),
            "rewrite".to_string(),
            Some(outcome.safe_rewrite.clone()),
        ),
        _ => ("ok".to_string(), "pass".to_string(), None),
    };

    let audit = MemoryAudit {
        request_id: request_id.clone(),
        tenant_id: user.tenant_id.clone().unwrap_or_else(|| "default".to_string()),
        user_id: Some(user.user_id.clone()),
        session_id: payload.session_id.clone(),
        input_digest: Some(hash_text(&payload.candidate_response)),
        route: Some("compliance".to_string()),
        retrieved_ids: Vec::new(),
        citations: payload.citations.clone(),
        compliance_hits: hits.iter().map(|hit| hit.rule_id.clone()).collect(),
        output_digest: Some(hash_text(
            safe_response.as_deref().unwrap_or(&payload.candidate_response),
        )),
        metadata: serde_json::json!({}),
    };
    write_audit(&state.db, &state.settings, &audit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(ApiEnvelope {
        request_id,
        status,
        data: ComplianceCheckData {
            action,
            hits,
            safe_response,
        },
    }))
}

/// POST /api/v1/memory/trace - Audit row lookup
pub async fn audit_trace(
    State(state): State<AppState>,
    _user: CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<AuditTraceRequest>,
) -> Result<Json<ApiEnvelope<AuditTraceData>>, ApiError> {
    let request_id = request_id_from(&headers, Some(&payload.request_id));

    let data = match db::get_audit(&state.db, &payload.request_id).await? {
        Some(record) => AuditTraceData {
            input_digest: record.input_digest,
            route: record.route,
            retrieved_ids: record.retrieved_ids,
            citations: record.citations,
            compliance_hits: record.compliance_hits,
            output_digest: record.output_digest,
        },
        // Unknown request ids return an empty shell, not a 404
        None => AuditTraceData::default(),
    };

    Ok(Json(ApiEnvelope::ok(request_id, data)))
}

// ============================================================
// Health
// ============================================================

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();

    let redis_status = match &state.redis {
        Some(redis) => {
            if redis.ping().await.is_ok() {
                "ok"
            } else {
                "error"
            }
        }
        None => "disabled",
    };

    let vector_status = if state.vector.is_some() { "ok" } else { "disabled" };

    let downgrades = state.downgrades.get_active_issues();
    let healthy = db_ok && redis_status != "error" && downgrades.is_empty();

    Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "system_health": {
            "db": if db_ok { "ok" } else { "error" },
            "redis": redis_status,
            "vector_store": vector_status,
            "a2a": state.a2a.stats(),
            "downgrades": downgrades,
        }
    }))
}

// ============================================================
// WebSocket Endpoint
// ============================================================

/// GET /ws/:session_id?token=...
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = params.get("token") else {
        return ApiError::Unauthorized("missing token".to_string()).into_response();
    };
    let claims = match auth::decode_token(&state.settings, token) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, claims.user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, user_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(64);

    if let Err(e) = state.router.connect(&session_id, &user_id, frame_tx).await {
        tracing::error!("session register failed for {}: {}", session_id, e);
        return;
    }

    // Writer pump: everything routed to this session goes out the socket
    let writer = tokio::spawn(async move {
        while let Some(text) = frame_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let connected = ServerFrame::Connected {
        session_id: session_id.clone(),
        server_id: state.router.server_id().to_string(),
    };
    if let Ok(frame) = serde_json::to_value(&connected) {
        let _ = state.router.send_json(&session_id, frame).await;
    }

    let session_event = serde_json::json!({
        "event_id": uuid::Uuid::new_v4().to_string(),
        "session_id": session_id,
        "user_id": user_id,
        "action": "connected",
    });
    if let Err(e) = state
        .bus
        .publish(EventType::SessionStarted.as_str(), session_event)
        .await
    {
        tracing::warn!("session start publish failed: {}", e);
    }

    while let Some(Ok(message)) = ws_rx.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("undecodable client frame on {}: {}", session_id, e);
                let error = ServerFrame::Error {
                    message: "unrecognized frame".to_string(),
                };
                if let Ok(value) = serde_json::to_value(&error) {
                    let _ = state.router.send_json(&session_id, value).await;
                }
                continue;
            }
        };

        match frame {
            ClientFrame::UserMessage { content, turn_id }
            | ClientFrame::TranscriptChunk { content, turn_id } => {
                if let Some(turn_id) = &turn_id {
                    match state.router.is_duplicate_turn(&session_id, turn_id).await {
                        Ok(true) => {
                            tracing::info!(
                                "duplicate turn dropped: session={} turn={}",
                                session_id,
                                turn_id
                            );
                            continue;
                        }
                        Ok(false) => {
                            let _ = state.router.mark_turn_seen(&session_id, turn_id).await;
                        }
                        Err(e) => tracing::error!("turn guard check failed: {}", e),
                    }
                }

                let turn_event = serde_json::json!({
                    "event_id": uuid::Uuid::new_v4().to_string(),
                    "session_id": session_id,
                    "user_id": user_id,
                    "turn_id": turn_id,
                    "content": content,
                });
                if let Err(e) = state
                    .bus
                    .publish(EventType::TurnCompleted.as_str(), turn_event)
                    .await
                {
                    tracing::error!("turn publish failed: {}", e);
                    let error = ServerFrame::Error {
                        message: "message could not be processed".to_string(),
                    };
                    if let Ok(value) = serde_json::to_value(&error) {
                        let _ = state.router.send_json(&session_id, value).await;
                    }
                }
            }
            ClientFrame::Ack { sequence } => {
                if let Err(e) = state.router.ack_chunk(&session_id, sequence).await {
                    tracing::error!("ack handling failed: {}", e);
                }
            }
            ClientFrame::Ping => {
                let pong = ServerFrame::Message {
                    data: serde_json::json!({ "pong": true }),
                };
                if let Ok(value) = serde_json::to_value(&pong) {
                    let _ = state.router.send_json(&session_id, value).await;
                }
            }
            ClientFrame::Close => break,
        }
    }

    if let Err(e) = state.router.disconnect(&session_id).await {
        tracing::error!("session cleanup failed for {}: {}", session_id, e);
    }
    let closed = serde_json::json!({
        "event_id": uuid::Uuid::new_v4().to_string(),
        "session_id": session_id,
        "user_id": user_id,
        "action": "disconnected",
    });
    if let Err(e) = state
        .bus
        .publish(EventType::SessionCompleted.as_str(), closed)
        .await
    {
        tracing::warn!("session close publish failed: {}", e);
    }
    writer.abort();
    tracing::info!("socket closed: session={}", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_prefers_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "req-123".parse().unwrap());
        assert_eq!(request_id_from(&headers, Some("fallback")), "req-123");
    }

    #[test]
    fn request_id_falls_back_then_generates() {
        let headers = HeaderMap::new();
        assert_eq!(request_id_from(&headers, Some("fallback")), "fallback");
        let generated = request_id_from(&headers, None);
        assert!(!generated.is_empty());
    }

    #[test]
    fn bad_dates_are_validation_errors() {
        assert!(parse_date("2025-06-01").is_ok());
        assert!(matches!(parse_date("06/01/2025"), Err(ApiError::Validation(_))));
        assert!(matches!(parse_date("not-a-date"), Err(ApiError::Validation(_))));
    }
}
