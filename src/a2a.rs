use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::cache::RedisGateway;
use crate::models::{A2aMessage, AgentRecord, AgentStatus, MessageType};

// ============================================================
// A2A Message Bus
// ============================================================
//
// Direct and broadcast messaging between agents, an agent registry with
// capability discovery, correlation-id request/response, and bounded
// per-conversation history.
//
// The wire transport is pluggable: Redis Pub/Sub in production, an
// in-process broadcast channel for tests and single-node runs. Channel
// layout: `{prefix}:{agent_id}` for directed traffic, `{prefix}:broadcast`
// for fan-out; registry lives at `{prefix}:agents`, history at
// `{prefix}:history:{conversation_id}`.
// ============================================================

pub type MessageFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;
pub type MessageHandler = Arc<dyn Fn(A2aMessage) -> MessageFuture + Send + Sync>;

/// Wrap an async closure into a message handler
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(A2aMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Wire + state backend for the bus
#[async_trait]
pub trait A2aTransport: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to a set of channels; messages arrive on the returned
    /// receiver until it is dropped
    async fn subscribe(&self, channels: Vec<String>) -> Result<mpsc::Receiver<String>>;

    async fn registry_put(&self, agent_id: &str, record: String) -> Result<()>;
    async fn registry_delete(&self, agent_id: &str) -> Result<()>;
    async fn registry_get(&self, agent_id: &str) -> Result<Option<String>>;
    async fn registry_all(&self) -> Result<Vec<String>>;

    async fn history_append(&self, conversation_id: &str, payload: String) -> Result<()>;
    /// Newest first, as stored
    async fn history_read(&self, conversation_id: &str, limit: usize) -> Result<Vec<String>>;
    async fn history_clear(&self, conversation_id: &str) -> Result<()>;
}

// ── Redis transport ───────────────────────────────────────────

pub struct RedisA2aTransport {
    gateway: RedisGateway,
    prefix: String,
    history_ttl_secs: u64,
}

impl RedisA2aTransport {
    pub fn new(gateway: RedisGateway, prefix: &str, history_ttl_secs: u64) -> Self {
        Self {
            gateway,
            prefix: prefix.to_string(),
            history_ttl_secs,
        }
    }

    fn registry_key(&self) -> String {
        format!("{}:agents", self.prefix)
    }

    fn history_key(&self, conversation_id: &str) -> String {
        format!("{}:history:{}", self.prefix, conversation_id)
    }
}

#[async_trait]
impl A2aTransport for RedisA2aTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.gateway.publish(channel, &payload).await
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self.gateway.pubsub().await?;
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        // Receiver dropped means the subscription ended
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("undecodable pub/sub payload: {}", e),
                }
            }
        });
        Ok(rx)
    }

    async fn registry_put(&self, agent_id: &str, record: String) -> Result<()> {
        self.gateway
            .hset(&self.registry_key(), agent_id, &record)
            .await
    }

    async fn registry_delete(&self, agent_id: &str) -> Result<()> {
        self.gateway
            .hdel(&self.registry_key(), &[agent_id.to_string()])
            .await
    }

    async fn registry_get(&self, agent_id: &str) -> Result<Option<String>> {
        self.gateway.hget(&self.registry_key(), agent_id).await
    }

    async fn registry_all(&self) -> Result<Vec<String>> {
        let map = self.gateway.hgetall(&self.registry_key()).await?;
        Ok(map.into_values().collect())
    }

    async fn history_append(&self, conversation_id: &str, payload: String) -> Result<()> {
        self.gateway
            .lpush_ex(&self.history_key(conversation_id), &payload, self.history_ttl_secs)
            .await
    }

    async fn history_read(&self, conversation_id: &str, limit: usize) -> Result<Vec<String>> {
        self.gateway
            .lrange(&self.history_key(conversation_id), 0, limit as isize - 1)
            .await
    }

    async fn history_clear(&self, conversation_id: &str) -> Result<()> {
        self.gateway.del(&self.history_key(conversation_id)).await
    }
}

// ── In-process transport ──────────────────────────────────────

pub struct MemoryA2aTransport {
    sender: tokio::sync::broadcast::Sender<(String, String)>,
    registry: Mutex<HashMap<String, String>>,
    history: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for MemoryA2aTransport {
    fn default() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(1024);
        Self {
            sender,
            registry: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }
}

impl MemoryA2aTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl A2aTransport for MemoryA2aTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // No subscribers is fine; broadcast send only fails when empty
        let _ = self.sender.send((channel.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<mpsc::Receiver<String>> {
        let wanted: HashSet<String> = channels.into_iter().collect();
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok((channel, payload)) => {
                        if wanted.contains(&channel) && tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("in-process transport lagged, skipped {}", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn registry_put(&self, agent_id: &str, record: String) -> Result<()> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .insert(agent_id.to_string(), record);
        Ok(())
    }

    async fn registry_delete(&self, agent_id: &str) -> Result<()> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .remove(agent_id);
        Ok(())
    }

    async fn registry_get(&self, agent_id: &str) -> Result<Option<String>> {
        Ok(self
            .registry
            .lock()
            .expect("registry poisoned")
            .get(agent_id)
            .cloned())
    }

    async fn registry_all(&self) -> Result<Vec<String>> {
        Ok(self
            .registry
            .lock()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn history_append(&self, conversation_id: &str, payload: String) -> Result<()> {
        let mut history = self.history.lock().expect("history poisoned");
        // Same ordering as the list store: newest at the front
        history
            .entry(conversation_id.to_string())
            .or_default()
            .insert(0, payload);
        Ok(())
    }

    async fn history_read(&self, conversation_id: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .history
            .lock()
            .expect("history poisoned")
            .get(conversation_id)
            .map(|items| items.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn history_clear(&self, conversation_id: &str) -> Result<()> {
        self.history
            .lock()
            .expect("history poisoned")
            .remove(conversation_id);
        Ok(())
    }
}

// ── The bus ───────────────────────────────────────────────────

pub struct A2aMessageBus {
    transport: Arc<dyn A2aTransport>,
    prefix: String,
    local_registry: Mutex<HashMap<String, AgentRecord>>,
    subscriptions: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    pending_requests: Arc<Mutex<HashMap<String, oneshot::Sender<A2aMessage>>>>,
}

impl A2aMessageBus {
    pub fn new(transport: Arc<dyn A2aTransport>, prefix: &str) -> Self {
        Self {
            transport,
            prefix: prefix.to_string(),
            local_registry: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn channel_for(&self, agent_id: Option<&str>) -> String {
        match agent_id {
            Some(agent_id) => format!("{}:{}", self.prefix, agent_id),
            None => format!("{}:broadcast", self.prefix),
        }
    }

    pub async fn register_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        capabilities: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            capabilities,
            status: AgentStatus::Online,
            metadata,
            last_seen: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            version: "1.0.0".to_string(),
        };

        self.local_registry
            .lock()
            .expect("local registry poisoned")
            .insert(agent_id.to_string(), record.clone());
        self.transport
            .registry_put(agent_id, serde_json::to_string(&record)?)
            .await?;

        let event = A2aMessage::new_event(
            agent_id,
            None,
            "system",
            "agent_online",
            serde_json::to_value(&record)?,
        );
        self.publish(event).await?;

        tracing::info!("agent registered: {} ({})", agent_id, agent_type);
        Ok(())
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let known = self
            .local_registry
            .lock()
            .expect("local registry poisoned")
            .remove(agent_id)
            .is_some();
        if !known {
            return Ok(());
        }

        let event = A2aMessage::new_event(
            agent_id,
            None,
            "system",
            "agent_offline",
            serde_json::json!({}),
        );
        self.publish(event).await?;

        self.transport.registry_delete(agent_id).await?;

        if let Some(task) = self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .remove(agent_id)
        {
            task.abort();
        }

        tracing::info!("agent unregistered: {}", agent_id);
        Ok(())
    }

    pub async fn get_agent_info(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        if let Some(record) = self
            .local_registry
            .lock()
            .expect("local registry poisoned")
            .get(agent_id)
        {
            return Ok(Some(record.clone()));
        }
        match self.transport.registry_get(agent_id).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Registry scan filtered in process; offline agents never match
    pub async fn discover_agents(
        &self,
        capability: Option<&str>,
        agent_type: Option<&str>,
    ) -> Result<Vec<AgentRecord>> {
        let mut agents = Vec::new();
        for raw in self.transport.registry_all().await? {
            let record: AgentRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("unreadable registry entry: {}", e);
                    continue;
                }
            };
            if record.status == AgentStatus::Offline {
                continue;
            }
            if let Some(capability) = capability {
                if !record.capabilities.iter().any(|c| c == capability) {
                    continue;
                }
            }
            if let Some(agent_type) = agent_type {
                if record.agent_type != agent_type {
                    continue;
                }
            }
            agents.push(record);
        }
        Ok(agents)
    }

    pub async fn publish(&self, message: A2aMessage) -> Result<()> {
        let channel = self.channel_for(message.to_agent.as_deref());
        let payload = serde_json::to_string(&message)?;

        self.transport.publish(&channel, payload.clone()).await?;
        self.transport
            .history_append(&message.conversation_id, payload)
            .await?;

        tracing::debug!(
            "published {:?} from {} to {}",
            message.message_type,
            message.from_agent,
            message.to_agent.as_deref().unwrap_or("broadcast")
        );
        Ok(())
    }

    /// Listen on the agent's directed channel and the broadcast channel.
    /// Acks are emitted before the handler runs; responses resolve pending
    /// requests instead of reaching the handler.
    pub async fn subscribe(&self, agent_id: &str, handler: MessageHandler) -> Result<()> {
        {
            let subscriptions = self.subscriptions.lock().expect("subscriptions poisoned");
            if subscriptions.contains_key(agent_id) {
                tracing::warn!("agent {} already subscribed", agent_id);
                return Ok(());
            }
        }

        let channels = vec![self.channel_for(Some(agent_id)), self.channel_for(None)];
        let mut receiver = self.transport.subscribe(channels).await?;

        let transport = self.transport.clone();
        let pending = self.pending_requests.clone();
        let agent = agent_id.to_string();
        let prefix = self.prefix.clone();

        let task = tokio::spawn(async move {
            while let Some(raw) = receiver.recv().await {
                let message: A2aMessage = match serde_json::from_str(&raw) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!("undecodable a2a message: {}", e);
                        continue;
                    }
                };

                if message.from_agent == agent {
                    continue;
                }

                if message.requires_ack {
                    let ack = message.create_ack(&agent);
                    let channel = match &ack.to_agent {
                        Some(to) => format!("{}:{}", prefix, to),
                        None => format!("{}:broadcast", prefix),
                    };
                    if let Ok(payload) = serde_json::to_string(&ack) {
                        let _ = transport.publish(&channel, payload.clone()).await;
                        let _ = transport.history_append(&ack.conversation_id, payload).await;
                    }
                }

                if message.message_type == MessageType::Response {
                    if let Some(reply_to) = &message.reply_to {
                        let waiter = pending
                            .lock()
                            .expect("pending requests poisoned")
                            .remove(reply_to);
                        if let Some(tx) = waiter {
                            let _ = tx.send(message);
                            continue;
                        }
                    }
                }

                if let Err(e) = handler(message).await {
                    tracing::error!("message handler failed for {}: {}", agent, e);
                }
            }
            tracing::info!("subscription ended for agent {}", agent);
        });

        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .insert(agent_id.to_string(), task);

        tracing::info!("agent subscribed: {}", agent_id);
        Ok(())
    }

    /// Correlation is purely by message_id; concurrent requests never interfere
    pub async fn request(&self, message: A2aMessage, timeout: Duration) -> Result<A2aMessage> {
        let message_id = message.message_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_requests
            .lock()
            .expect("pending requests poisoned")
            .insert(message_id.clone(), tx);

        let publish_result = self.publish(message).await;
        if let Err(e) = publish_result {
            self.pending_requests
                .lock()
                .expect("pending requests poisoned")
                .remove(&message_id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        // The pending slot is removed on every exit path to avoid leaks
        self.pending_requests
            .lock()
            .expect("pending requests poisoned")
            .remove(&message_id);

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => anyhow::bail!("response channel closed for request {}", message_id),
            Err(_) => anyhow::bail!("request timeout: {}", message_id),
        }
    }

    /// Chronological conversation history
    pub async fn get_conversation_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<A2aMessage>> {
        let raw_messages = self.transport.history_read(conversation_id, limit).await?;
        let mut messages = Vec::new();
        for raw in raw_messages.into_iter().rev() {
            match serde_json::from_str::<A2aMessage>(&raw) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::error!("unreadable history entry: {}", e),
            }
        }
        Ok(messages)
    }

    pub async fn clear_conversation_history(&self, conversation_id: &str) -> Result<()> {
        self.transport.history_clear(conversation_id).await
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "registered_agents": self.local_registry.lock().expect("local registry poisoned").len(),
            "active_subscriptions": self.subscriptions.lock().expect("subscriptions poisoned").len(),
            "pending_requests": self.pending_requests.lock().expect("pending requests poisoned").len(),
        })
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .drain()
            .collect();
        for (agent_id, task) in tasks {
            task.abort();
            tracing::debug!("subscription cancelled for {}", agent_id);
        }
        self.pending_requests
            .lock()
            .expect("pending requests poisoned")
            .clear();
        tracing::info!("a2a message bus shut down");
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_bus() -> A2aMessageBus {
        A2aMessageBus::new(Arc::new(MemoryA2aTransport::new()), "a2a")
    }

    #[tokio::test]
    async fn directed_message_reaches_recipient_not_sender() {
        let bus = Arc::new(memory_bus());
        let received = Arc::new(AtomicUsize::new(0));

        let received_clone = received.clone();
        bus.subscribe(
            "coach",
            message_handler(move |_message| {
                let received = received_clone.clone();
                async move {
                    received.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let sender_received = Arc::new(AtomicUsize::new(0));
        let sender_clone = sender_received.clone();
        bus.subscribe(
            "sdr",
            message_handler(move |_message| {
                let counter = sender_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let message = A2aMessage::new(
            MessageType::Event,
            "sdr",
            Some("coach".to_string()),
            "conv-1",
            serde_json::json!({ "event_type": "nudge", "data": {} }),
        );
        bus.publish(message).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(sender_received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let bus = Arc::new(memory_bus());
        let coach_count = Arc::new(AtomicUsize::new(0));
        let sdr_count = Arc::new(AtomicUsize::new(0));

        let coach_clone = coach_count.clone();
        bus.subscribe(
            "coach",
            message_handler(move |_| {
                let counter = coach_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let sdr_clone = sdr_count.clone();
        bus.subscribe(
            "sdr",
            message_handler(move |_| {
                let counter = sdr_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let event =
            A2aMessage::new_event("sdr", None, "system", "agent_online", serde_json::json!({}));
        bus.publish(event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coach_count.load(Ordering::SeqCst), 1);
        assert_eq!(sdr_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_resolves_on_matching_reply_to() {
        let bus = Arc::new(memory_bus());

        // Responder echoes the request parameters back
        let bus_clone = bus.clone();
        bus.subscribe(
            "coach",
            message_handler(move |message| {
                let bus = bus_clone.clone();
                async move {
                    if message.message_type == MessageType::Request {
                        let response = message.create_response(
                            crate::models::response_payload(
                                true,
                                Some(message.payload["parameters"].clone()),
                                None,
                            ),
                            "coach",
                        );
                        bus.publish(response).await?;
                    }
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.subscribe("sdr", message_handler(|_| async { Ok(()) }))
            .await
            .unwrap();

        let request = A2aMessage::new_request(
            "sdr",
            "coach",
            "conv-7",
            "get_suggestion",
            serde_json::json!({ "stage": "discovery" }),
            5.0,
        );
        let response = bus.request(request, Duration::from_secs(2)).await.unwrap();

        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.payload["success"], serde_json::json!(true));
        assert_eq!(
            response.payload["result"]["stage"],
            serde_json::json!("discovery")
        );
    }

    #[tokio::test]
    async fn ack_is_emitted_for_requires_ack_messages() {
        let bus = Arc::new(memory_bus());
        let acks = Arc::new(AtomicUsize::new(0));

        bus.subscribe("coach", message_handler(|_| async { Ok(()) }))
            .await
            .unwrap();

        // Sender watches its own channel for the ack
        let acks_clone = acks.clone();
        bus.subscribe(
            "sdr",
            message_handler(move |message| {
                let acks = acks_clone.clone();
                async move {
                    if message.message_type == MessageType::Ack {
                        acks.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let mut message = A2aMessage::new(
            MessageType::Command,
            "sdr",
            Some("coach".to_string()),
            "conv-2",
            serde_json::json!({ "op": "pause" }),
        );
        message.requires_ack = true;
        bus.publish(message).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_filters_by_capability_and_type() {
        let bus = memory_bus();
        bus.register_agent(
            "coach-1",
            "CoachAgent",
            vec!["coaching".to_string(), "objection_handling".to_string()],
            HashMap::new(),
        )
        .await
        .unwrap();
        bus.register_agent("sdr-1", "SdrAgent", vec!["sales".to_string()], HashMap::new())
            .await
            .unwrap();

        let coaches = bus.discover_agents(Some("coaching"), None).await.unwrap();
        assert_eq!(coaches.len(), 1);
        assert_eq!(coaches[0].agent_id, "coach-1");

        let sdrs = bus.discover_agents(None, Some("SdrAgent")).await.unwrap();
        assert_eq!(sdrs.len(), 1);

        let none = bus.discover_agents(Some("billing"), None).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn history_reads_in_chronological_order() {
        let bus = memory_bus();
        for i in 0..3 {
            let message = A2aMessage::new(
                MessageType::Event,
                "sdr",
                None,
                "conv-h",
                serde_json::json!({ "n": i }),
            );
            bus.publish(message).await.unwrap();
        }

        let history = bus.get_conversation_history("conv-h", 100).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].payload["n"], serde_json::json!(0));
        assert_eq!(history[2].payload["n"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn unregister_removes_from_registry() {
        let bus = memory_bus();
        bus.register_agent("coach-1", "CoachAgent", vec![], HashMap::new())
            .await
            .unwrap();
        assert!(bus.get_agent_info("coach-1").await.unwrap().is_some());

        bus.unregister_agent("coach-1").await.unwrap();
        assert!(bus.get_agent_info("coach-1").await.unwrap().is_none());
    }
}
