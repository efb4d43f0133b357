use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================
// A2A Protocol
// ============================================================

/// Agent message types
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Query,
    Command,
    Ack,
}

/// Message priority levels
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// Agent-to-agent message envelope
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct A2aMessage {
    pub message_id: String,
    pub message_type: MessageType,
    pub from_agent: String,
    /// None means broadcast
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    pub conversation_id: String,
    /// Epoch seconds
    pub timestamp: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub requires_ack: bool,
}

fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl A2aMessage {
    pub fn new(
        message_type: MessageType,
        from_agent: impl Into<String>,
        to_agent: Option<String>,
        conversation_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            message_type,
            from_agent: from_agent.into(),
            to_agent,
            conversation_id: conversation_id.into(),
            timestamp: now_epoch(),
            payload,
            reply_to: None,
            priority: MessagePriority::Normal,
            metadata: HashMap::new(),
            ttl: None,
            requires_ack: false,
        }
    }

    /// Build a response to this message; `reply_to` carries the request id
    pub fn create_response(&self, payload: serde_json::Value, from_agent: &str) -> A2aMessage {
        let mut msg = A2aMessage::new(
            MessageType::Response,
            from_agent,
            Some(self.from_agent.clone()),
            self.conversation_id.clone(),
            payload,
        );
        msg.reply_to = Some(self.message_id.clone());
        msg.priority = self.priority;
        msg
    }

    /// Build an acknowledgment for this message
    pub fn create_ack(&self, from_agent: &str) -> A2aMessage {
        let mut msg = A2aMessage::new(
            MessageType::Ack,
            from_agent,
            Some(self.from_agent.clone()),
            self.conversation_id.clone(),
            serde_json::json!({ "ack_for": self.message_id }),
        );
        msg.reply_to = Some(self.message_id.clone());
        msg
    }

    /// Request wrapper: `{action, parameters}` payload with ack required
    pub fn new_request(
        from_agent: &str,
        to_agent: &str,
        conversation_id: &str,
        action: &str,
        parameters: serde_json::Value,
        timeout_secs: f64,
    ) -> Self {
        let mut msg = A2aMessage::new(
            MessageType::Request,
            from_agent,
            Some(to_agent.to_string()),
            conversation_id,
            serde_json::json!({ "action": action, "parameters": parameters }),
        );
        msg.metadata
            .insert("timeout".to_string(), serde_json::json!(timeout_secs));
        msg.requires_ack = true;
        msg
    }

    /// Query wrapper: `{query, filters, limit}` payload
    pub fn new_query(
        from_agent: &str,
        to_agent: &str,
        conversation_id: &str,
        query: &str,
        filters: serde_json::Value,
        limit: usize,
    ) -> Self {
        A2aMessage::new(
            MessageType::Query,
            from_agent,
            Some(to_agent.to_string()),
            conversation_id,
            serde_json::json!({ "query": query, "filters": filters, "limit": limit }),
        )
    }

    /// Event wrapper: `{event_type, data}` payload, broadcast when `to_agent` is None
    pub fn new_event(
        from_agent: &str,
        to_agent: Option<String>,
        conversation_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Self {
        A2aMessage::new(
            MessageType::Event,
            from_agent,
            to_agent,
            conversation_id,
            serde_json::json!({ "event_type": event_type, "data": data }),
        )
    }
}

/// Success/error payload for responses
pub fn response_payload(
    success: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
) -> serde_json::Value {
    let mut payload = serde_json::json!({ "success": success, "metadata": {} });
    if let Some(result) = result {
        payload["result"] = result;
    }
    if let Some(error) = error {
        payload["error"] = serde_json::json!(error);
    }
    payload
}

/// Agent liveness state
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Degraded,
    Busy,
}

/// Registry entry for a live agent
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub last_seen: f64,
    #[serde(default = "default_agent_version")]
    pub version: String,
}

fn default_agent_version() -> String {
    "1.0.0".to_string()
}

// ============================================================
// Bus events
// ============================================================

/// Event topics on the bus (dotted names on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    SessionStarted,
    SessionCompleted,
    TurnCompleted,
    ComplianceViolation,
    KnowledgeUpdated,
    MemoryEventRecorded,
    MemoryOutcomeRecorded,
    RequestDegraded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStarted => "session.started",
            EventType::SessionCompleted => "session.completed",
            EventType::TurnCompleted => "workflow.turn_completed",
            EventType::ComplianceViolation => "audit.compliance_violation",
            EventType::KnowledgeUpdated => "knowledge.updated",
            EventType::MemoryEventRecorded => "memory.event_recorded",
            EventType::MemoryOutcomeRecorded => "memory.outcome_recorded",
            EventType::RequestDegraded => "traffic.request_degraded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload for `memory.outcome_recorded`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryOutcomeEvent {
    pub event_id: String,
    pub outcome_id: String,
    pub tenant_id: String,
    pub adopted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adopt_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub strategy_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Payload for `audit.compliance_violation`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub reason: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_content: Option<String>,
    pub risk_score: f64,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Payload for `traffic.request_degraded`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitEvent {
    pub event_id: String,
    pub key: String,
    pub limit: u64,
    pub window: u64,
    pub current_count: u64,
    pub reason: String,
}

// ============================================================
// Memory domain rows
// ============================================================

/// Turn-level observation written by the coaching pipeline; immutable
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<i32>,
    /// sales, customer, npc or agent
    pub speaker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_top1: Option<String>,
    #[serde(default)]
    pub intent_topk: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objection_type: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tension: Option<f64>,
    #[serde(default)]
    pub compliance_flags: Vec<String>,
    #[serde(default)]
    pub coach_suggestions_shown: Vec<String>,
    #[serde(default)]
    pub coach_suggestions_taken: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Versioned knowledge row with an effectivity window
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryKnowledge {
    pub tenant_id: String,
    pub knowledge_id: String,
    pub version: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub structured_content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    pub effective_from: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<NaiveDate>,
    pub is_enabled: bool,
    #[serde(default)]
    pub citation_snippets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Per-strategy adoption statistics
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StrategyStats {
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub adopted_count: i64,
    #[serde(default)]
    pub progress_count: i64,
    #[serde(default)]
    pub risk_count: i64,
    #[serde(default)]
    pub adoption_rate: f64,
    #[serde(default)]
    pub progress_rate: f64,
    #[serde(default)]
    pub risk_rate: f64,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

impl StrategyStats {
    /// Fold a single outcome into the counters and recompute the rates
    pub fn record_outcome(&mut self, adopted: bool, progressed: bool, risked: bool) {
        self.total_count += 1;
        if adopted {
            self.adopted_count += 1;
        }
        if progressed {
            self.progress_count += 1;
        }
        if risked {
            self.risk_count += 1;
        }
        let total = self.total_count as f64;
        self.adoption_rate = round4(self.adopted_count as f64 / total);
        self.progress_rate = round4(self.progress_count as f64 / total);
        self.risk_rate = round4(self.risk_count as f64 / total);
    }
}

/// Trigger condition for a strategy unit; None fields match any value
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TriggerCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objection_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Reusable coaching strategy with evidence links and live stats
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryStrategyUnit {
    pub tenant_id: String,
    pub strategy_id: String,
    #[serde(rename = "type")]
    pub strategy_type: String,
    #[serde(default)]
    pub trigger_condition: TriggerCondition,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub dos_donts: serde_json::Value,
    #[serde(default)]
    pub evidence_event_ids: Vec<String>,
    #[serde(default)]
    pub stats: StrategyStats,
    pub is_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a coached turn; immutable once written
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryOutcome {
    pub outcome_id: String,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub tenant_id: String,
    pub adopted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adopt_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_after: Option<String>,
    #[serde(default)]
    pub eval_scores: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
}

/// Per-user coaching profile
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryPersona {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub weakness_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_eval_summary: Option<String>,
    #[serde(default)]
    pub last_improvements: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub history_stats: serde_json::Value,
}

/// Structured reference to a retrieved row
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Citation {
    #[serde(rename = "type")]
    pub citation_type: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// Append-only record of one memory request
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryAudit {
    pub request_id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default)]
    pub retrieved_ids: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub compliance_hits: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ============================================================
// API contracts
// ============================================================

/// Generic write/query envelope: `{request_id, status, data}`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiEnvelope<T> {
    pub request_id: String,
    pub status: String,
    pub data: T,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(request_id: String, data: T) -> Self {
        Self {
            request_id,
            status: "ok".to_string(),
            data,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
pub struct EventWriteRequest {
    pub event_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    pub channel: Option<String>,
    pub turn_index: Option<i32>,
    pub speaker: String,
    pub raw_text_ref: Option<String>,
    pub summary: Option<String>,
    pub intent_top1: Option<String>,
    #[serde(default)]
    pub intent_topk: Vec<String>,
    pub stage: Option<String>,
    pub objection_type: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    pub sentiment: Option<String>,
    pub tension: Option<f64>,
    #[serde(default)]
    pub compliance_flags: Vec<String>,
    #[serde(default)]
    pub coach_suggestions_shown: Vec<String>,
    #[serde(default)]
    pub coach_suggestions_taken: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EventWriteData {
    pub event_id: String,
    pub stored: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutcomeWriteRequest {
    pub event_id: String,
    pub session_id: Option<String>,
    pub adopted: bool,
    pub adopt_type: Option<String>,
    pub stage_before: Option<String>,
    pub stage_after: Option<String>,
    #[serde(default)]
    pub eval_scores: serde_json::Value,
    pub compliance_result: Option<String>,
    pub final_result: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OutcomeWriteData {
    pub outcome_id: String,
    pub adopted: bool,
}

#[derive(Debug, Deserialize)]
pub struct PersonaWriteRequest {
    pub user_id: String,
    pub level: Option<String>,
    #[serde(default)]
    pub weakness_tags: Vec<String>,
    pub last_eval_summary: Option<String>,
    #[serde(default)]
    pub last_improvements: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub history_stats: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PersonaWriteData {
    pub user_id: String,
    pub updated: bool,
}

#[derive(Debug, Deserialize)]
pub struct KnowledgeWriteRequest {
    pub knowledge_id: String,
    pub tenant_id: String,
    pub version: String,
    pub domain: String,
    pub product_id: Option<String>,
    pub structured_content: serde_json::Value,
    pub source_ref: Option<String>,
    pub effective_from: String,
    pub effective_to: Option<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub citation_snippets: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct KnowledgeWriteData {
    pub knowledge_id: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct StrategyWriteRequest {
    pub strategy_id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub strategy_type: String,
    #[serde(default)]
    pub trigger_condition: TriggerCondition,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub dos_donts: serde_json::Value,
    #[serde(default)]
    pub evidence_event_ids: Vec<String>,
    #[serde(default)]
    pub stats: StrategyStats,
}

#[derive(Debug, Serialize)]
pub struct StrategyWriteData {
    pub strategy_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryQueryRequest {
    pub query: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub intent_hint: Option<String>,
    pub stage: Option<String>,
    pub objection_type: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub require_citations: bool,
    pub route_policy: Option<String>,
}

fn default_top_k() -> usize {
    5
}

/// Route chosen for a memory query
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RouteDecision {
    Knowledge,
    Strategy,
    Fallback,
}

impl RouteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteDecision::Knowledge => "knowledge",
            RouteDecision::Strategy => "strategy",
            RouteDecision::Fallback => "fallback",
        }
    }
}

/// One retrieved row with its fused or reranked score
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryQueryHit {
    #[serde(rename = "type")]
    pub hit_type: String,
    pub id: String,
    pub score: f64,
    pub content: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct MemoryQueryData {
    pub route_decision: RouteDecision,
    pub hits: Vec<MemoryQueryHit>,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Deserialize)]
pub struct ComplianceCheckRequest {
    pub candidate_response: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ComplianceHit {
    pub rule_id: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ComplianceCheckData {
    pub action: String,
    pub hits: Vec<ComplianceHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_response: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuditTraceRequest {
    pub request_id: String,
}

#[derive(Debug, Serialize, Default)]
pub struct AuditTraceData {
    pub input_digest: Option<String>,
    pub route: Option<String>,
    pub retrieved_ids: Vec<String>,
    pub citations: Vec<Citation>,
    pub compliance_hits: Vec<String>,
    pub output_digest: Option<String>,
}

// ============================================================
// WebSocket frames
// ============================================================

/// Client to server frames
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    UserMessage {
        content: String,
        turn_id: Option<String>,
    },
    TranscriptChunk {
        content: String,
        turn_id: Option<String>,
    },
    Ack {
        sequence: u64,
    },
    Ping,
    Close,
}

/// Server to client frames
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        session_id: String,
        server_id: String,
    },
    NpcResponse {
        content: String,
        sequence: u64,
    },
    CoachAdvice {
        content: String,
        sequence: u64,
    },
    ToolStatus {
        tool_name: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
    },
    Error {
        message: String,
    },
    Ack {
        sequence: u64,
    },
    StateRecovered {
        session_id: String,
    },
    Message {
        data: serde_json::Value,
    },
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod a2a_message_tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn response_carries_reply_to_of_request() {
            let request = A2aMessage::new_request(
                "sdr",
                "coach",
                "conv-1",
                "get_suggestion",
                serde_json::json!({ "stage": "discovery" }),
                5.0,
            );
            assert!(request.requires_ack);
            assert_eq!(request.message_type, MessageType::Request);

            let response = request.create_response(
                response_payload(true, Some(serde_json::json!(1)), None),
                "coach",
            );
            assert_eq!(response.message_type, MessageType::Response);
            assert_eq!(
                response.reply_to.as_deref(),
                Some(request.message_id.as_str())
            );
            assert_eq!(response.to_agent.as_deref(), Some("sdr"));
            assert_eq!(response.conversation_id, "conv-1");
        }

        #[test]
        fn ack_carries_reply_to() {
            let request = A2aMessage::new_request("a", "b", "c", "x", serde_json::json!({}), 1.0);
            let ack = request.create_ack("b");
            assert_eq!(ack.message_type, MessageType::Ack);
            assert_eq!(ack.reply_to.as_deref(), Some(request.message_id.as_str()));
            assert_eq!(ack.payload["ack_for"], serde_json::json!(request.message_id));
        }

        #[test]
        fn message_type_serializes_lowercase() {
            let msg =
                A2aMessage::new_event("a", None, "conv", "agent_online", serde_json::json!({}));
            let json = serde_json::to_string(&msg).unwrap();
            assert!(json.contains("\"message_type\":\"event\""));
            // Broadcast messages omit to_agent entirely
            assert!(!json.contains("to_agent"));
        }

        #[test]
        fn wire_roundtrip_preserves_fields() {
            let mut msg = A2aMessage::new(
                MessageType::Command,
                "orchestrator",
                Some("coach".to_string()),
                "conv-9",
                serde_json::json!({ "op": "reset" }),
            );
            msg.priority = MessagePriority::Urgent;
            msg.ttl = Some(30);

            let decoded: A2aMessage =
                serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
            assert_eq!(decoded.message_id, msg.message_id);
            assert_eq!(decoded.priority, MessagePriority::Urgent);
            assert_eq!(decoded.ttl, Some(30));
            assert_eq!(decoded.payload["op"], serde_json::json!("reset"));
        }
    }

    mod stats_tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn record_outcome_updates_counts_and_rates() {
            let mut stats = StrategyStats::default();
            stats.record_outcome(true, false, false);
            stats.record_outcome(true, true, false);
            stats.record_outcome(false, false, true);

            assert_eq!(stats.total_count, 3);
            assert_eq!(stats.adopted_count, 2);
            assert_eq!(stats.progress_count, 1);
            assert_eq!(stats.risk_count, 1);
            assert_eq!(stats.adoption_rate, 0.6667);
            assert_eq!(stats.progress_rate, 0.3333);
            assert_eq!(stats.risk_rate, 0.3333);
        }

        #[test]
        fn counts_never_exceed_total() {
            let mut stats = StrategyStats::default();
            for _ in 0..20 {
                stats.record_outcome(true, true, true);
            }
            assert!(stats.adopted_count <= stats.total_count);
            assert!(stats.progress_count <= stats.total_count);
            assert!(stats.risk_count <= stats.total_count);
            assert_eq!(stats.adoption_rate, 1.0);
        }
    }

    mod ws_frame_tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn client_frames_parse_by_type_tag() {
            let frame: ClientFrame =
                serde_json::from_str(r#"{"type":"user_message","content":"hi","turn_id":"t1"}"#)
                    .unwrap();
            match frame {
                ClientFrame::UserMessage { content, turn_id } => {
                    assert_eq!(content, "hi");
                    assert_eq!(turn_id.as_deref(), Some("t1"));
                }
                other => panic!("unexpected frame: {:?}", other),
            }

            let ack: ClientFrame = serde_json::from_str(r#"{"type":"ack","sequence":7}"#).unwrap();
            assert!(matches!(ack, ClientFrame::Ack { sequence: 7 }));
        }

        #[test]
        fn server_chunk_frames_carry_sequence() {
            let frame = ServerFrame::CoachAdvice {
                content: "slow down".to_string(),
                sequence: 3,
            };
            let json = serde_json::to_string(&frame).unwrap();
            assert!(json.contains("\"type\":\"coach_advice\""));
            assert!(json.contains("\"sequence\":3"));
        }
    }

    mod citation_tests {
        use super::*;

        #[test]
        fn citation_type_renamed_in_json() {
            let citation = Citation {
                citation_type: "knowledge".to_string(),
                id: "k1".to_string(),
                version: Some("v2".to_string()),
                snippet: None,
                source_ref: None,
                rule_id: None,
            };
            let json = serde_json::to_string(&citation).unwrap();
            assert!(json.contains("\"type\":\"knowledge\""));
            assert!(!json.contains("citation_type"));
            assert!(!json.contains("snippet"));
        }
    }
}
