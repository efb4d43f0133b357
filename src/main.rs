mod a2a;
mod agent;
mod audit;
mod auth;
mod bus;
mod cache;
mod compliance;
mod config;
mod db;
mod decay;
mod downgrade;
mod error;
mod handlers;
mod models;
mod outcomes;
mod rate_limit;
mod rerank;
mod retrieval;
mod vector;
mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use a2a::{A2aMessageBus, MemoryA2aTransport, RedisA2aTransport};
use bus::{EventBus, MemoryEventBus, RedisEventBus};
use cache::RedisGateway;
use compliance::ComplianceChecker;
use config::Settings;
use downgrade::DowngradeRegistry;
use outcomes::OutcomeAggregator;
use rate_limit::RateLimiter;
use rerank::RerankService;
use retrieval::RetrievalService;
use vector::{VectorService, EVENT_COLLECTION, KNOWLEDGE_COLLECTION, STRATEGY_COLLECTION};
use ws::{MemorySessionRouter, RedisSessionRouter, SessionRouter};

/// Global application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub db: sqlx::Pool<sqlx::Postgres>,
    pub redis: Option<RedisGateway>,
    pub bus: Arc<dyn EventBus>,
    pub a2a: Arc<A2aMessageBus>,
    pub router: Arc<dyn SessionRouter>,
    pub retrieval: Arc<RetrievalService>,
    pub compliance: Arc<ComplianceChecker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub downgrades: Arc<DowngradeRegistry>,
    pub vector: Option<Arc<VectorService>>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env().expect("invalid configuration");
    let downgrades = Arc::new(DowngradeRegistry::new());

    // ============================================================
    // Initialize Services
    // ============================================================

    tracing::info!("Connecting to Postgres...");
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&settings.database_url)
        .await
        .expect("Failed to connect to Postgres");

    db::init_schema(&db_pool)
        .await
        .expect("Failed to initialize database schema");
    tracing::info!("Connected to Postgres");

    tracing::info!("Connecting to Redis...");
    let redis = match RedisGateway::connect(&settings.redis_url).await {
        Ok(gateway) => {
            tracing::info!("Connected to Redis");
            downgrades.resolve("redis");
            Some(gateway)
        }
        Err(e) => {
            tracing::warn!("Redis unavailable, running degraded: {}", e);
            downgrades.register("redis", &e.to_string());
            None
        }
    };

    // Event bus: Redis Streams when configured and reachable, otherwise
    // the in-process bus
    let event_bus: Arc<dyn EventBus> = match (&redis, settings.use_redis_bus) {
        (Some(gateway), true) => {
            tracing::info!("Using Redis event bus (group={})", settings.bus_group_name);
            Arc::new(RedisEventBus::new(
                gateway.clone(),
                &settings.bus_group_name,
                settings.history_ttl_secs,
            ))
        }
        _ => {
            tracing::info!("Using in-memory event bus");
            Arc::new(MemoryEventBus::new())
        }
    };

    // Agent fabric shares the same Redis; falls back to in-process transport
    let a2a_bus = match &redis {
        Some(gateway) => Arc::new(A2aMessageBus::new(
            Arc::new(RedisA2aTransport::new(
                gateway.clone(),
                "a2a",
                settings.history_ttl_secs,
            )),
            "a2a",
        )),
        None => Arc::new(A2aMessageBus::new(Arc::new(MemoryA2aTransport::new()), "a2a")),
    };

    // Vector store (Qdrant)
    tracing::info!("Initializing vector store...");
    let vector_service = Arc::new(VectorService::new(
        settings.qdrant_url.clone(),
        settings.embedding_url.clone(),
        settings.embedding_model.clone(),
        settings.embedding_dimension,
    ));
    for collection in [KNOWLEDGE_COLLECTION, STRATEGY_COLLECTION, EVENT_COLLECTION] {
        if let Err(e) = vector_service.init_collection(collection).await {
            tracing::warn!(
                "Could not initialize collection {} (vector store may not be running): {}",
                collection,
                e
            );
            downgrades.register("vector_store", &e.to_string());
        }
    }

    let rerank_service = Arc::new(RerankService::new(
        settings.reranker_url.clone(),
        settings.bge_reranker_enabled,
        settings.reranker_model.clone(),
        settings.reranker_fallback_model.clone(),
    ));

    let retrieval_service = Arc::new(RetrievalService::new(
        db_pool.clone(),
        redis.clone(),
        Some(vector_service.clone()),
        rerank_service,
        settings.clone(),
    ));

    let compliance_checker = Arc::new(
        ComplianceChecker::new(
            settings.compliance_intercept_words.clone(),
            settings.security_injection_patterns.clone(),
            event_bus.clone(),
        )
        .expect("invalid compliance patterns"),
    );

    let rate_limiter = Arc::new(RateLimiter::new(
        redis.clone(),
        event_bus.clone(),
        settings.rate_limit_enabled,
    ));

    // Session router: distributed when Redis is up and configured
    let session_router: Arc<dyn SessionRouter> =
        if settings.websocket_manager_type == "redis" && redis.is_some() {
            let router = RedisSessionRouter::new(
                redis.clone().expect("redis gateway"),
                settings.websocket_message_ttl_secs,
                settings.turn_guard_ttl_secs,
            );
            router.start().await.expect("Failed to start session router");
            router
        } else {
            tracing::info!("Using in-memory session router");
            Arc::new(MemorySessionRouter::new(settings.turn_guard_ttl_secs))
        };

    // ============================================================
    // Start Background Consumers
    // ============================================================

    let aggregator = OutcomeAggregator::new(db_pool.clone(), redis.clone());
    aggregator
        .register(event_bus.as_ref())
        .await
        .expect("Failed to register outcome aggregator");

    // Delivery bridge: agents address "session-relay" to fan chunks back
    // to connected clients with sequence tracking
    let relay = agent::AgentRuntime::new(
        Arc::new(agent::SessionRelayAgent::new(session_router.clone())),
        a2a_bus.clone(),
    );
    relay
        .initialize()
        .await
        .expect("Failed to initialize session relay agent");

    let app_state = AppState {
        settings: settings.clone(),
        db: db_pool,
        redis,
        bus: event_bus.clone(),
        a2a: a2a_bus.clone(),
        router: session_router.clone(),
        retrieval: retrieval_service,
        compliance: compliance_checker,
        rate_limiter,
        downgrades,
        vector: Some(vector_service),
    };

    // ============================================================
    // Build Axum Router
    // ============================================================

    let app = Router::new()
        // Auth
        .route("/api/v1/auth/token", post(handlers::login))
        .route("/api/v1/auth/me", get(handlers::me))
        // Memory writes
        .route("/api/v1/memory/write/event", post(handlers::write_event))
        .route("/api/v1/memory/write/outcome", post(handlers::write_outcome))
        .route("/api/v1/memory/write/persona", post(handlers::write_persona))
        .route("/api/v1/memory/write/knowledge", post(handlers::write_knowledge))
        .route("/api/v1/memory/write/strategy", post(handlers::write_strategy))
        // Retrieval / compliance / trace
        .route("/api/v1/memory/query", post(handlers::query_memory))
        .route("/api/v1/memory/comply/check", post(handlers::comply_check))
        .route("/api/v1/memory/trace", post(handlers::audit_trace))
        // Realtime
        .route("/ws/:session_id", get(handlers::ws_handler))
        // Health check
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app_state);

    let addr = format!("{}:{}", settings.host, settings.port);
    tracing::info!("🧠 salesmesh core listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", addr));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_bus, a2a_bus, session_router))
        .await
        .expect("Server error");
}

async fn shutdown_signal(
    event_bus: Arc<dyn EventBus>,
    a2a_bus: Arc<A2aMessageBus>,
    session_router: Arc<dyn SessionRouter>,
) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining...");
    a2a_bus.shutdown().await;
    event_bus.shutdown().await;
    session_router.shutdown().await;
}
