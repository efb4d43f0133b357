use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::a2a::{message_handler, A2aMessageBus};
use crate::models::{response_payload, A2aMessage, AgentRecord, MessageType};

// ============================================================
// Agent Runtime
// ============================================================
//
// An Agent implements the domain behavior; the runtime wires it to the
// message bus: registration, subscription, per-type dispatch, ack and
// error-response generation. Handler failures become `{success: false,
// error}` responses for requests/queries and never escape the loop.
// ============================================================

#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_id(&self) -> &str;

    fn agent_type(&self) -> &str;

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    /// Handle an incoming request; the return value becomes the response result
    async fn handle_request(&self, message: &A2aMessage) -> Result<serde_json::Value> {
        let action = message.payload["action"].as_str().unwrap_or("unknown");
        anyhow::bail!("agent {} does not handle requests (action: {})", self.agent_type(), action)
    }

    /// Handle an incoming query
    async fn handle_query(&self, _message: &A2aMessage) -> Result<serde_json::Value> {
        anyhow::bail!("agent {} does not handle queries", self.agent_type())
    }

    /// Handle an incoming event; default is observe-and-continue
    async fn handle_event(&self, message: &A2aMessage) -> Result<()> {
        let event_type = message.payload["event_type"].as_str().unwrap_or("unknown");
        tracing::debug!(
            "agent {} received event {} from {}",
            self.agent_id(),
            event_type,
            message.from_agent
        );
        Ok(())
    }

    /// Handle an incoming command; default is a no-op with a warning
    async fn handle_command(&self, _message: &A2aMessage) -> Result<()> {
        tracing::warn!("agent {} does not handle commands", self.agent_type());
        Ok(())
    }
}

pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    bus: Arc<A2aMessageBus>,
    conversation_id: Mutex<Option<String>>,
    initialized: AtomicBool,
}

impl AgentRuntime {
    pub fn new(agent: Arc<dyn Agent>, bus: Arc<A2aMessageBus>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            bus,
            conversation_id: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn agent_id(&self) -> String {
        self.agent.agent_id().to_string()
    }

    /// Register with the bus and start receiving messages
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            tracing::warn!("agent {} already initialized", self.agent.agent_id());
            return Ok(());
        }

        self.bus
            .register_agent(
                self.agent.agent_id(),
                self.agent.agent_type(),
                self.agent.capabilities(),
                self.agent.metadata(),
            )
            .await?;

        let agent = self.agent.clone();
        let bus = self.bus.clone();
        self.bus
            .subscribe(
                self.agent.agent_id(),
                message_handler(move |message| {
                    let agent = agent.clone();
                    let bus = bus.clone();
                    async move { Self::dispatch(agent, bus, message).await }
                }),
            )
            .await?;

        tracing::info!(
            "agent initialized: {} ({})",
            self.agent.agent_id(),
            self.agent.agent_type()
        );
        Ok(())
    }

    async fn dispatch(
        agent: Arc<dyn Agent>,
        bus: Arc<A2aMessageBus>,
        message: A2aMessage,
    ) -> Result<()> {
        match message.message_type {
            MessageType::Request => {
                match agent.handle_request(&message).await {
                    Ok(result) => {
                        let response = message.create_response(
                            response_payload(true, Some(result), None),
                            agent.agent_id(),
                        );
                        bus.publish(response).await?;
                    }
                    Err(e) => {
                        tracing::error!("request handler failed: {}", e);
                        let response = message.create_response(
                            response_payload(false, None, Some(e.to_string())),
                            agent.agent_id(),
                        );
                        bus.publish(response).await?;
                    }
                }
            }
            MessageType::Query => {
                match agent.handle_query(&message).await {
                    Ok(result) => {
                        let response = message.create_response(
                            response_payload(true, Some(result), None),
                            agent.agent_id(),
                        );
                        bus.publish(response).await?;
                    }
                    Err(e) => {
                        tracing::error!("query handler failed: {}", e);
                        let response = message.create_response(
                            response_payload(false, None, Some(e.to_string())),
                            agent.agent_id(),
                        );
                        bus.publish(response).await?;
                    }
                }
            }
            MessageType::Event => {
                if let Err(e) = agent.handle_event(&message).await {
                    tracing::error!("event handler failed: {}", e);
                }
            }
            MessageType::Command => {
                if let Err(e) = agent.handle_command(&message).await {
                    tracing::error!("command handler failed: {}", e);
                }
            }
            MessageType::Ack => {
                tracing::debug!(
                    "agent {} acked by {}",
                    agent.agent_id(),
                    message.from_agent
                );
            }
            MessageType::Response => {
                // Responses with no pending waiter land here; nothing to do
                tracing::debug!("late response discarded: {}", message.message_id);
            }
        }
        Ok(())
    }

    fn conversation_or_random(&self) -> String {
        self.conversation_id
            .lock()
            .expect("conversation context poisoned")
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Send a request to another agent and wait for its response
    pub async fn send_request(
        &self,
        to_agent: &str,
        action: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> Result<A2aMessage> {
        let message = A2aMessage::new_request(
            self.agent.agent_id(),
            to_agent,
            &self.conversation_or_random(),
            action,
            parameters,
            timeout.as_secs_f64(),
        );
        self.bus.request(message, timeout).await
    }

    pub async fn send_query(
        &self,
        to_agent: &str,
        query: &str,
        filters: serde_json::Value,
        limit: usize,
        timeout: Duration,
    ) -> Result<A2aMessage> {
        let message = A2aMessage::new_query(
            self.agent.agent_id(),
            to_agent,
            &self.conversation_or_random(),
            query,
            filters,
            limit,
        );
        self.bus.request(message, timeout).await
    }

    /// Broadcast an event to every agent on the bus
    pub async fn broadcast_event(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let conversation = self
            .conversation_id
            .lock()
            .expect("conversation context poisoned")
            .clone()
            .unwrap_or_else(|| "system".to_string());
        let message =
            A2aMessage::new_event(self.agent.agent_id(), None, &conversation, event_type, data);
        self.bus.publish(message).await
    }

    pub async fn send_event(
        &self,
        to_agent: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let message = A2aMessage::new_event(
            self.agent.agent_id(),
            Some(to_agent.to_string()),
            &self.conversation_or_random(),
            event_type,
            data,
        );
        self.bus.publish(message).await
    }

    pub async fn discover(
        &self,
        capability: Option<&str>,
        agent_type: Option<&str>,
    ) -> Result<Vec<AgentRecord>> {
        self.bus.discover_agents(capability, agent_type).await
    }

    pub fn set_conversation_context(&self, conversation_id: &str) {
        *self
            .conversation_id
            .lock()
            .expect("conversation context poisoned") = Some(conversation_id.to_string());
    }

    pub async fn shutdown(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.bus.unregister_agent(self.agent.agent_id()).await?;
        tracing::info!("agent shutdown: {}", self.agent.agent_id());
        Ok(())
    }
}

// ============================================================
// Session Relay Agent
// ============================================================

/// Bridges agent output onto live client sessions.
///
/// Domain agents address this agent with `deliver_chunk` requests; the
/// relay assigns the per-session sequence number and hands the frame to the
/// session router, which tracks it until the client acks.
pub struct SessionRelayAgent {
    router: Arc<dyn crate::ws::SessionRouter>,
}

impl SessionRelayAgent {
    pub fn new(router: Arc<dyn crate::ws::SessionRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Agent for SessionRelayAgent {
    fn agent_id(&self) -> &str {
        "session-relay"
    }

    fn agent_type(&self) -> &str {
        "SessionRelayAgent"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["session_delivery".to_string()]
    }

    async fn handle_request(&self, message: &A2aMessage) -> Result<serde_json::Value> {
        let action = message.payload["action"].as_str().unwrap_or_default();
        let params = &message.payload["parameters"];
        let session_id = params["session_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing session_id"))?;

        match action {
            "deliver_chunk" => {
                let frame_type = params["frame_type"].as_str().unwrap_or("message");
                let content = params["content"].as_str().unwrap_or_default();
                let sequence = self.router.next_sequence(session_id);
                let chunk = serde_json::json!({
                    "type": frame_type,
                    "content": content,
                    "sequence": sequence,
                });
                self.router.send_chunk(session_id, chunk).await?;
                Ok(serde_json::json!({ "delivered": true, "sequence": sequence }))
            }
            "deliver_json" => {
                self.router
                    .send_json(session_id, params["data"].clone())
                    .await?;
                Ok(serde_json::json!({ "delivered": true }))
            }
            other => anyhow::bail!("unknown action: {}", other),
        }
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::MemoryA2aTransport;

    struct CoachAgent;

    #[async_trait]
    impl Agent for CoachAgent {
        fn agent_id(&self) -> &str {
            "coach"
        }

        fn agent_type(&self) -> &str {
            "CoachAgent"
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["coaching".to_string()]
        }

        async fn handle_request(&self, message: &A2aMessage) -> Result<serde_json::Value> {
            let action = message.payload["action"].as_str().unwrap_or_default();
            match action {
                "get_suggestion" => {
                    let stage = message.payload["parameters"]["stage"]
                        .as_str()
                        .unwrap_or("opening");
                    Ok(serde_json::json!({
                        "recommended_approach": format!("acknowledge hesitation, then reframe for {}", stage),
                        "key_points": ["mirror the concern", "offer a low-commitment next step"],
                        "confidence": 0.82,
                    }))
                }
                other => anyhow::bail!("unknown action: {}", other),
            }
        }
    }

    struct SdrAgent;

    #[async_trait]
    impl Agent for SdrAgent {
        fn agent_id(&self) -> &str {
            "sdr"
        }

        fn agent_type(&self) -> &str {
            "SdrAgent"
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["sales".to_string()]
        }
    }

    async fn wired_pair() -> (Arc<AgentRuntime>, Arc<AgentRuntime>) {
        let bus = Arc::new(A2aMessageBus::new(Arc::new(MemoryA2aTransport::new()), "a2a"));
        let coach = AgentRuntime::new(Arc::new(CoachAgent), bus.clone());
        let sdr = AgentRuntime::new(Arc::new(SdrAgent), bus.clone());
        coach.initialize().await.unwrap();
        sdr.initialize().await.unwrap();
        (coach, sdr)
    }

    #[tokio::test]
    async fn request_response_between_agents() {
        let (_coach, sdr) = wired_pair().await;

        let response = sdr
            .send_request(
                "coach",
                "get_suggestion",
                serde_json::json!({ "customer_message": "I'm not sure", "stage": "discovery" }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response.payload["success"], serde_json::json!(true));
        let result = &response.payload["result"];
        assert!(result["recommended_approach"]
            .as_str()
            .map(|s| !s.is_empty())
            .unwrap_or(false));
        assert!(result["key_points"].as_array().map(|a| !a.is_empty()).unwrap_or(false));
        let confidence = result["confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&confidence));
    }

    #[tokio::test]
    async fn unknown_action_yields_error_response() {
        let (_coach, sdr) = wired_pair().await;

        let response = sdr
            .send_request(
                "coach",
                "definitely_not_an_action",
                serde_json::json!({}),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert_eq!(response.payload["success"], serde_json::json!(false));
        assert!(response.payload["error"]
            .as_str()
            .unwrap_or_default()
            .contains("unknown action"));
    }

    #[tokio::test]
    async fn agent_without_request_handler_fails_gracefully() {
        let (coach, _sdr) = wired_pair().await;

        // SdrAgent has no handle_request override
        let response = coach
            .send_request("sdr", "anything", serde_json::json!({}), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(response.payload["success"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn discovery_sees_registered_capabilities() {
        let (_coach, sdr) = wired_pair().await;

        let coaches = sdr.discover(Some("coaching"), None).await.unwrap();
        assert_eq!(coaches.len(), 1);
        assert_eq!(coaches[0].agent_id, "coach");
    }

    #[tokio::test]
    async fn relay_agent_delivers_sequenced_chunks() {
        use crate::ws::{MemorySessionRouter, SessionRouter};
        use tokio::sync::mpsc;

        let bus = Arc::new(A2aMessageBus::new(Arc::new(MemoryA2aTransport::new()), "a2a"));
        let router: Arc<dyn SessionRouter> = Arc::new(MemorySessionRouter::new(300));
        let relay = AgentRuntime::new(Arc::new(SessionRelayAgent::new(router.clone())), bus.clone());
        let sdr = AgentRuntime::new(Arc::new(SdrAgent), bus.clone());
        relay.initialize().await.unwrap();
        sdr.initialize().await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        router.connect("s1", "u1", tx).await.unwrap();

        let response = sdr
            .send_request(
                "session-relay",
                "deliver_chunk",
                serde_json::json!({
                    "session_id": "s1",
                    "frame_type": "coach_advice",
                    "content": "ask an open question",
                }),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert_eq!(response.payload["success"], serde_json::json!(true));
        assert_eq!(response.payload["result"]["sequence"], serde_json::json!(1));

        let delivered = rx.recv().await.unwrap();
        assert!(delivered.contains("\"type\":\"coach_advice\""));
        assert!(delivered.contains("\"sequence\":1"));
    }

    #[tokio::test]
    async fn conversation_context_is_used_for_requests() {
        let (_coach, sdr) = wired_pair().await;
        sdr.set_conversation_context("conv-set");

        let response = sdr
            .send_request(
                "coach",
                "get_suggestion",
                serde_json::json!({ "stage": "closing" }),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert_eq!(response.conversation_id, "conv-set");
    }
}
