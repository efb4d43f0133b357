use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cache::RedisGateway;

// ============================================================
// Event Bus
// ============================================================
//
// Topic-based publish/subscribe plus request/response.
//
// Two interchangeable backends:
//   - MemoryEventBus: process-local fan-out, used in tests and when no
//     Redis bus is configured
//   - RedisEventBus: Redis Streams with consumer groups, pending-entry
//     recovery and a dead-letter stream, for at-least-once delivery
//     across processes
// ============================================================

const READ_COUNT: usize = 10;
const BLOCK_MS: usize = 1000;
const RECOVERY_INTERVAL: Duration = Duration::from_secs(10);
const MIN_IDLE_MS: u64 = 60_000;
const RECOVERY_BATCH: usize = 5;
const MAX_DELIVERIES: u64 = 5;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type Subscriber = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a bus subscriber
pub fn subscriber<F, Fut>(f: F) -> Subscriber
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// At-least-once publish to a topic
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<()>;

    /// Register a handler; delivery starts immediately
    async fn subscribe(&self, event_type: &str, handler: Subscriber) -> Result<()>;

    /// Publish and wait for a correlated reply
    async fn request(
        &self,
        event_type: &str,
        event_id: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value>;

    /// Deliver the reply for a request identified by (event_type, event_id)
    async fn respond(
        &self,
        event_type: &str,
        event_id: &str,
        value: serde_json::Value,
    ) -> Result<()>;

    async fn shutdown(&self);
}

fn response_topic(event_type: &str, event_id: &str) -> String {
    format!("response.{}.{}", event_type, event_id)
}

// ============================================================
// In-memory implementation
// ============================================================

#[derive(Default)]
pub struct MemoryEventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers_for(&self, topic: &str) -> Vec<Subscriber> {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn remove_topic(&self, topic: &str) {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .remove(topic);
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<()> {
        let handlers = self.handlers_for(event_type);
        for handler in handlers {
            if let Err(e) = handler(payload.clone()).await {
                tracing::error!("subscriber failed for {}: {}", event_type, e);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Subscriber) -> Result<()> {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn request(
        &self,
        event_type: &str,
        event_id: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let topic = response_topic(event_type, event_id);
        let (tx, rx) = oneshot::channel::<serde_json::Value>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let slot_clone = slot.clone();
        self.subscribe(
            &topic,
            subscriber(move |value| {
                let slot = slot_clone.clone();
                async move {
                    if let Some(tx) = slot.lock().expect("response slot poisoned").take() {
                        let _ = tx.send(value);
                    }
                    Ok(())
                }
            }),
        )
        .await?;

        self.publish(event_type, payload).await?;

        let result = tokio::time::timeout(timeout, rx).await;
        // The transient topic goes away on every exit path
        self.remove_topic(&topic);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => anyhow::bail!("response channel closed for {}", event_type),
            Err(_) => anyhow::bail!("timeout waiting for response to {} {}", event_type, event_id),
        }
    }

    async fn respond(
        &self,
        event_type: &str,
        event_id: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.publish(&response_topic(event_type, event_id), value)
            .await
    }

    async fn shutdown(&self) {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .clear();
    }
}

// ============================================================
// Redis Streams implementation
// ============================================================

pub struct RedisEventBus {
    gateway: RedisGateway,
    group_name: String,
    consumer_name: String,
    history_ttl_secs: u64,
    subscribers: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl RedisEventBus {
    pub fn new(gateway: RedisGateway, group_name: &str, history_ttl_secs: u64) -> Self {
        Self {
            gateway,
            group_name: group_name.to_string(),
            consumer_name: format!("consumer-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            history_ttl_secs,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn stream_key(event_type: &str) -> String {
        format!("stream:{}", event_type)
    }

    fn response_key(event_type: &str, event_id: &str) -> String {
        format!("response:{}:{}", event_type, event_id)
    }

    /// Field map -> JSON object; values that fail to parse pass through as strings
    fn decode_fields(fields: HashMap<String, String>) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (field, raw) in fields {
            let value = serde_json::from_str(&raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
            object.insert(field, value);
        }
        serde_json::Value::Object(object)
    }

    /// Run every registered handler; Ok means the entry may be acked
    async fn dispatch(
        subscribers: &Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
        event_type: &str,
        payload: serde_json::Value,
    ) -> bool {
        let handlers = subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .get(event_type)
            .cloned()
            .unwrap_or_default();

        let mut all_ok = true;
        for handler in handlers {
            if let Err(e) = handler(payload.clone()).await {
                tracing::error!("subscriber failed for {}: {}", event_type, e);
                all_ok = false;
            }
        }
        all_ok
    }

    /// Claim idle pending entries and retry them; entries past the delivery
    /// cap move to the dead-letter stream instead
    async fn recover_pending(
        gateway: &RedisGateway,
        subscribers: &Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
        event_type: &str,
        group: &str,
        consumer: &str,
    ) {
        let stream = Self::stream_key(event_type);
        let pending = match gateway.xpending(&stream, group, 100).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("pending scan failed for {}: {}", stream, e);
                return;
            }
        };

        let mut claimable = Vec::new();
        let mut dead = Vec::new();
        for entry in pending {
            if entry.idle_ms < MIN_IDLE_MS {
                continue;
            }
            if entry.times_delivered > MAX_DELIVERIES {
                dead.push(entry.id);
            } else if claimable.len() < RECOVERY_BATCH {
                claimable.push(entry.id);
            }
        }

        // Exhausted entries are parked on the dead-letter stream and acked
        for id in dead {
            if let Ok(claimed) = gateway
                .xclaim(&stream, group, consumer, MIN_IDLE_MS as usize, &[id.clone()])
                .await
            {
                for (entry_id, fields) in claimed {
                    let dlq = format!("dlq:{}", event_type);
                    let fields_vec: Vec<(String, String)> = fields.into_iter().collect();
                    if let Err(e) = gateway.xadd(&dlq, &fields_vec).await {
                        tracing::error!("dead-letter append failed for {}: {}", dlq, e);
                        continue;
                    }
                    tracing::warn!("entry {} on {} exceeded delivery cap, dead-lettered", entry_id, stream);
                    let _ = gateway.xack(&stream, group, &entry_id).await;
                }
            }
        }

        if claimable.is_empty() {
            return;
        }

        match gateway
            .xclaim(&stream, group, consumer, MIN_IDLE_MS as usize, &claimable)
            .await
        {
            Ok(claimed) => {
                if !claimed.is_empty() {
                    tracing::info!("claimed {} pending entries on {}", claimed.len(), stream);
                }
                for (entry_id, fields) in claimed {
                    let payload = Self::decode_fields(fields);
                    if Self::dispatch(subscribers, event_type, payload).await {
                        let _ = gateway.xack(&stream, group, &entry_id).await;
                    }
                }
            }
            Err(e) => tracing::warn!("claim failed for {}: {}", stream, e),
        }
    }

    fn spawn_consumer_loop(&self, event_type: String) {
        let gateway = self.gateway.clone();
        let subscribers = self.subscribers.clone();
        let group = self.group_name.clone();
        let consumer = self.consumer_name.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let stream = Self::stream_key(&event_type);

            // Create the group up front; retried with backoff while Redis is away
            loop {
                match gateway.ensure_group(&stream, &group).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!("group create failed for {}: {}, retrying", stream, e);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        }
                    }
                }
            }
            tracing::info!("consuming {} as {}/{}", stream, group, consumer);

            let mut last_recovery = tokio::time::Instant::now();
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let entries = tokio::select! {
                    _ = cancel.cancelled() => return,
                    read = gateway.xread_group(&stream, &group, &consumer, READ_COUNT, BLOCK_MS) => {
                        match read {
                            Ok(entries) => entries,
                            Err(e) => {
                                tracing::error!("stream read failed for {}: {}", stream, e);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                continue;
                            }
                        }
                    }
                };

                for (entry_id, fields) in entries {
                    let payload = Self::decode_fields(fields);
                    // Failed handlers leave the entry pending for recovery
                    if Self::dispatch(&subscribers, &event_type, payload).await {
                        if let Err(e) = gateway.xack(&stream, &group, &entry_id).await {
                            tracing::warn!("ack failed for {} {}: {}", stream, entry_id, e);
                        }
                    }
                }

                if last_recovery.elapsed() >= RECOVERY_INTERVAL {
                    last_recovery = tokio::time::Instant::now();
                    Self::recover_pending(&gateway, &subscribers, &event_type, &group, &consumer)
                        .await;
                }
            }
        });

        self.tasks
            .lock()
            .expect("task registry poisoned")
            .push(handle);
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<()> {
        // One stream field per payload key, each JSON-encoded; scalars are
        // wrapped so the entry is always a field map
        let object = match payload {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        // Conversation-scoped entries also land in a bounded history list
        let conversation_id = object
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .map(String::from);

        let fields: Vec<(String, String)> = object
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        self.gateway
            .xadd(&Self::stream_key(event_type), &fields)
            .await?;

        if let Some(conversation_id) = conversation_id {
            let history_key = format!("history:{}", conversation_id);
            let entry = serde_json::json!({
                "event_type": event_type,
                "fields": fields.iter().cloned().collect::<HashMap<_, _>>(),
            });
            if let Err(e) = self
                .gateway
                .lpush_ex(&history_key, &entry.to_string(), self.history_ttl_secs)
                .await
            {
                tracing::warn!("history append failed for {}: {}", history_key, e);
            }
        }

        tracing::debug!("published to stream:{}", event_type);
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Subscriber) -> Result<()> {
        let first_for_topic = {
            let mut subscribers = self
                .subscribers
                .lock()
                .expect("subscriber registry poisoned");
            let entry = subscribers.entry(event_type.to_string()).or_default();
            entry.push(handler);
            entry.len() == 1
        };
        if first_for_topic {
            self.spawn_consumer_loop(event_type.to_string());
        }
        Ok(())
    }

    async fn request(
        &self,
        event_type: &str,
        event_id: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let response_key = Self::response_key(event_type, event_id);
        self.publish(event_type, payload).await?;

        let waited = self
            .gateway
            .blpop(&response_key, timeout.as_secs_f64())
            .await;
        // Ephemeral response key never outlives the request
        let _ = self.gateway.del(&response_key).await;

        match waited? {
            Some(raw) => Ok(serde_json::from_str(&raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw))),
            None => anyhow::bail!("timeout waiting for response to {} {}", event_type, event_id),
        }
    }

    async fn respond(
        &self,
        event_type: &str,
        event_id: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let response_key = Self::response_key(event_type, event_id);
        self.gateway.lpush(&response_key, &value.to_string()).await
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .tasks
            .lock()
            .expect("task registry poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        tracing::info!("event bus shut down");
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn memory_bus_delivers_to_subscriber_exactly_once() {
        let bus = MemoryEventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        bus.subscribe(
            "memory.event_recorded",
            subscriber(move |_payload| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish("memory.event_recorded", serde_json::json!({ "event_id": "e1" }))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_bus_handler_error_does_not_poison_other_subscribers() {
        let bus = MemoryEventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "topic",
            subscriber(|_payload| async { anyhow::bail!("boom") }),
        )
        .await
        .unwrap();

        let calls_clone = calls.clone();
        bus.subscribe(
            "topic",
            subscriber(move |_payload| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish("topic", serde_json::json!({})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_bus_request_response_roundtrip() {
        let bus = Arc::new(MemoryEventBus::new());

        // The consumer answers on the correlated response topic
        let bus_clone = bus.clone();
        bus.subscribe(
            "workflow.turn_completed",
            subscriber(move |payload| {
                let bus = bus_clone.clone();
                async move {
                    let event_id = payload["event_id"].as_str().unwrap_or_default().to_string();
                    bus.respond(
                        "workflow.turn_completed",
                        &event_id,
                        serde_json::json!({ "handled": true }),
                    )
                    .await
                }
            }),
        )
        .await
        .unwrap();

        let reply = bus
            .request(
                "workflow.turn_completed",
                "t-42",
                serde_json::json!({ "event_id": "t-42" }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(reply["handled"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn memory_bus_request_times_out_without_responder() {
        let bus = MemoryEventBus::new();
        let result = bus
            .request(
                "session.started",
                "nobody-home",
                serde_json::json!({ "event_id": "nobody-home" }),
                Duration::from_millis(50),
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn field_decoding_passes_unparseable_values_through() {
        let mut fields = HashMap::new();
        fields.insert("count".to_string(), "3".to_string());
        fields.insert("name".to_string(), "\"coach\"".to_string());
        fields.insert("raw".to_string(), "not json at all {".to_string());

        let value = RedisEventBus::decode_fields(fields);
        assert_eq!(value["count"], serde_json::json!(3));
        assert_eq!(value["name"], serde_json::json!("coach"));
        assert_eq!(value["raw"], serde_json::json!("not json at all {"));
    }

    #[test]
    fn concurrent_requests_use_distinct_response_topics() {
        assert_ne!(
            response_topic("memory.outcome_recorded", "a"),
            response_topic("memory.outcome_recorded", "b")
        );
    }
}
