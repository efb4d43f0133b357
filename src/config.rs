use anyhow::Result;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Development,
    Staging,
    Production,
    Testing,
}

impl EnvState {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" => EnvState::Production,
            "staging" => EnvState::Staging,
            "testing" => EnvState::Testing,
            _ => EnvState::Development,
        }
    }
}

/// Application settings loaded from the environment (and .env via dotenvy)
#[derive(Debug, Clone)]
pub struct Settings {
    pub env_state: EnvState,

    // Server
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,

    // Persistence
    pub database_url: String,
    pub redis_url: String,

    // Bus
    pub use_redis_bus: bool,
    pub bus_group_name: String,
    pub history_ttl_secs: u64,

    // Security
    pub secret_key: Option<String>,
    pub jwt_algorithm: String,
    pub access_token_expire_minutes: u64,
    pub admin_username: String,
    pub admin_password_sha256: Option<String>,

    // WebSocket router
    pub websocket_manager_type: String,
    pub websocket_ping_interval_secs: u64,
    pub websocket_message_ttl_secs: u64,
    pub turn_guard_ttl_secs: u64,

    // Retrieval
    pub qdrant_url: String,
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub rag_top_k: usize,
    pub rag_similarity_threshold: f32,
    pub bge_reranker_enabled: bool,
    pub reranker_url: String,
    pub reranker_model: String,
    pub reranker_fallback_model: String,

    // Routing keyword lists (pluggable; defaults cover the sales domain)
    pub route_knowledge_keywords: Vec<String>,
    pub route_strategy_keywords: Vec<String>,

    // Compliance
    pub compliance_intercept_words: Vec<String>,
    pub security_injection_patterns: Vec<String>,

    // Rate limit
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u64,
    pub rate_limit_window_secs: u64,

    // Audit
    pub audit_log_enabled: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            env_state: EnvState::parse(&env_or("ENV_STATE", "development")),

            host: env_or("HOST", "0.0.0.0"),
            port: env_u64("PORT", 8000) as u16,
            cors_origins: env_list("CORS_ORIGINS", &["*"]),

            database_url: env_or(
                "DATABASE_URL",
                "postgres://postgres@localhost:5432/salesmesh",
            ),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),

            use_redis_bus: env_bool("USE_REDIS_BUS", false),
            bus_group_name: env_or("BUS_GROUP_NAME", "salesmesh-group"),
            history_ttl_secs: env_u64("HISTORY_TTL_SECONDS", 3600),

            secret_key: env_opt("SECRET_KEY"),
            jwt_algorithm: env_or("JWT_ALGORITHM", "HS256"),
            access_token_expire_minutes: env_u64("ACCESS_TOKEN_EXPIRE_MINUTES", 30),
            admin_username: env_or("ADMIN_USERNAME", "admin"),
            admin_password_sha256: env_opt("ADMIN_PASSWORD_SHA256"),

            websocket_manager_type: env_or("WEBSOCKET_MANAGER_TYPE", "memory"),
            websocket_ping_interval_secs: env_u64("WEBSOCKET_PING_INTERVAL", 30),
            websocket_message_ttl_secs: env_u64("WEBSOCKET_MESSAGE_TTL", 3600),
            turn_guard_ttl_secs: env_u64("TURN_GUARD_TTL", 300),

            qdrant_url: env_or("QDRANT_URL", "http://localhost:6333"),
            embedding_url: env_or("EMBEDDING_URL", "http://localhost:11434"),
            embedding_model: env_or("EMBEDDING_MODEL", "bge-m3"),
            embedding_dimension: env_usize("EMBEDDING_DIMENSION", 1024),
            rag_top_k: env_usize("RAG_TOP_K", 5),
            rag_similarity_threshold: env_or("RAG_SIMILARITY_THRESHOLD", "0.75")
                .parse()
                .unwrap_or(0.75),
            bge_reranker_enabled: env_bool("BGE_RERANKER_ENABLED", true),
            reranker_url: env_or("RERANKER_URL", "http://localhost:8085"),
            reranker_model: env_or("BGE_RERANKER_MODEL", "BAAI/bge-reranker-base"),
            reranker_fallback_model: env_or(
                "RERANKER_FALLBACK_MODEL",
                "cross-encoder/ms-marco-TinyBERT-L-2-v2",
            ),

            route_knowledge_keywords: env_list(
                "ROUTE_KNOWLEDGE_KEYWORDS",
                &["权益", "活动", "佣金"],
            ),
            route_strategy_keywords: env_list("ROUTE_STRATEGY_KEYWORDS", &["异议", "sop", "推进"]),

            compliance_intercept_words: env_list(
                "COMPLIANCE_INTERCEPT_WORDS",
                &["refund", "complaint", "lawsuit", "scam"],
            ),
            security_injection_patterns: env_list(
                "SECURITY_INJECTION_PATTERNS",
                &[
                    r"(ignore|disregard|forget)\s+(all\s+)?(instructions|rules|directions)",
                    r"system\s+prompt",
                    r"you\s+are\s+now\s+a",
                ],
            ),

            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true),
            rate_limit_requests: env_u64("RATE_LIMIT_REQUESTS", 60),
            rate_limit_window_secs: env_u64("RATE_LIMIT_WINDOW", 60),

            audit_log_enabled: env_bool("AUDIT_LOG_ENABLED", true),
        };

        if settings.env_state == EnvState::Production && settings.secret_key.is_none() {
            anyhow::bail!("Missing required production setting: SECRET_KEY");
        }

        Ok(settings)
    }

    pub fn is_production(&self) -> bool {
        self.env_state == EnvState::Production
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_state_parses_known_values() {
        assert_eq!(EnvState::parse("production"), EnvState::Production);
        assert_eq!(EnvState::parse("Staging"), EnvState::Staging);
        assert_eq!(EnvState::parse("testing"), EnvState::Testing);
        assert_eq!(EnvState::parse("anything-else"), EnvState::Development);
    }

    #[test]
    fn list_parsing_splits_and_trims() {
        std::env::set_var("TEST_LIST_KEY", "a, b ,c,");
        let parsed = env_list("TEST_LIST_KEY", &["x"]);
        assert_eq!(parsed, vec!["a", "b", "c"]);
        std::env::remove_var("TEST_LIST_KEY");
        assert_eq!(env_list("TEST_LIST_KEY", &["x"]), vec!["x"]);
    }
}
