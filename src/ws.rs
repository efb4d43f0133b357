use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::RedisGateway;

// ============================================================
// WebSocket Session Router
// ============================================================
//
// Distributed connection management for horizontally scaled servers.
//
// State layout in Redis:
//   ws:session:{session_id}    -> hash {server, user, connected_at}, TTL
//   ws:unacked:{session_id}    -> hash {sequence: {data, sent_at, retries}}
//   ws:turn_guard:{session_id} -> hash {turn_id: epoch_seconds}, TTL
//
// Routing channels:
//   ws:broadcast:{session_id}  -> messages for one session
//   ws:broadcast:all           -> best-effort global broadcast
//
// A chunk is only considered delivered once the client acks its sequence;
// the retransmission pass resends with exponential backoff and gives up
// past MAX_RETRIES.
// ============================================================

const MAX_RETRIES: u32 = 5;
const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(2);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Exponential backoff before a chunk becomes due again: 2, 4, 8, 16 ... seconds
fn backoff_secs(retries: u32) -> f64 {
    2.0 * 2f64.powi(retries as i32)
}

fn chunk_is_due(now: f64, sent_at: f64, retries: u32) -> bool {
    now - sent_at > backoff_secs(retries)
}

/// Stored form of an unacknowledged chunk
#[derive(Debug, Serialize, Deserialize, Clone)]
struct UnackedChunk {
    data: String,
    sent_at: f64,
    retries: u32,
}

/// Envelope used on the routing channels
#[derive(Debug, Serialize, Deserialize)]
struct RoutedMessage {
    #[serde(rename = "type")]
    kind: String,
    session_id: String,
    data: serde_json::Value,
    server_id: String,
    timestamp: String,
}

pub type FrameSender = mpsc::Sender<String>;

#[async_trait]
pub trait SessionRouter: Send + Sync {
    fn server_id(&self) -> &str;

    /// Register a live socket; the sender receives serialized frames
    async fn connect(&self, session_id: &str, user_id: &str, sender: FrameSender) -> Result<()>;

    async fn disconnect(&self, session_id: &str) -> Result<()>;

    /// Deliver locally when possible, otherwise route across servers
    async fn send_json(&self, session_id: &str, data: serde_json::Value) -> Result<()>;

    /// Sequenced send tracked for ack/retransmit; `chunk` carries `sequence`
    async fn send_chunk(&self, session_id: &str, chunk: serde_json::Value) -> Result<()>;

    async fn ack_chunk(&self, session_id: &str, sequence: u64) -> Result<()>;

    async fn is_duplicate_turn(&self, session_id: &str, turn_id: &str) -> Result<bool>;

    async fn mark_turn_seen(&self, session_id: &str, turn_id: &str) -> Result<()>;

    async fn clear_turn_seen(&self, session_id: &str, turn_id: &str) -> Result<()>;

    /// Monotonically increasing per-session sequence
    fn next_sequence(&self, session_id: &str) -> u64;

    async fn active_session_count(&self) -> Result<usize>;

    async fn shutdown(&self);
}

// ============================================================
// In-memory router (single node, tests)
// ============================================================

#[derive(Default)]
pub struct MemorySessionRouter {
    server_id: String,
    connections: Mutex<HashMap<String, FrameSender>>,
    unacked: Mutex<HashMap<String, HashMap<u64, UnackedChunk>>>,
    turn_guard: Mutex<HashMap<String, HashMap<String, f64>>>,
    sequences: Mutex<HashMap<String, u64>>,
    turn_guard_ttl_secs: u64,
}

impl MemorySessionRouter {
    pub fn new(turn_guard_ttl_secs: u64) -> Self {
        Self {
            server_id: format!("ws-server-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            turn_guard_ttl_secs,
            ..Default::default()
        }
    }

    /// One retransmission sweep; due chunks are resent, exhausted ones dropped
    pub async fn run_retransmission_pass(&self) {
        let now = epoch_seconds();
        let mut to_send: Vec<(String, String)> = Vec::new();
        {
            let mut unacked = self.unacked.lock().expect("unacked poisoned");
            for (session_id, chunks) in unacked.iter_mut() {
                let mut dropped = Vec::new();
                for (sequence, chunk) in chunks.iter_mut() {
                    if !chunk_is_due(now, chunk.sent_at, chunk.retries) {
                        continue;
                    }
                    if chunk.retries >= MAX_RETRIES {
                        tracing::warn!(
                            "max retries reached for session={} seq={}",
                            session_id,
                            sequence
                        );
                        dropped.push(*sequence);
                        continue;
                    }
                    chunk.retries += 1;
                    chunk.sent_at = now;
                    to_send.push((session_id.clone(), chunk.data.clone()));
                }
                for sequence in dropped {
                    chunks.remove(&sequence);
                }
            }
        }
        for (session_id, data) in to_send {
            let sender = self
                .connections
                .lock()
                .expect("connections poisoned")
                .get(&session_id)
                .cloned();
            if let Some(sender) = sender {
                let _ = sender.send(data).await;
            }
        }
    }

    /// Evict turn guards older than the TTL
    pub fn run_turn_guard_cleanup(&self) {
        let now = epoch_seconds();
        let ttl = self.turn_guard_ttl_secs as f64;
        let mut guard = self.turn_guard.lock().expect("turn guard poisoned");
        for guards in guard.values_mut() {
            guards.retain(|_, seen_at| now - *seen_at <= ttl);
        }
        guard.retain(|_, guards| !guards.is_empty());
    }

    #[cfg(test)]
    fn unacked_len(&self, session_id: &str) -> usize {
        self.unacked
            .lock()
            .expect("unacked poisoned")
            .get(session_id)
            .map(|chunks| chunks.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SessionRouter for MemorySessionRouter {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn connect(&self, session_id: &str, _user_id: &str, sender: FrameSender) -> Result<()> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .insert(session_id.to_string(), sender);
        Ok(())
    }

    async fn disconnect(&self, session_id: &str) -> Result<()> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .remove(session_id);
        self.unacked
            .lock()
            .expect("unacked poisoned")
            .remove(session_id);
        self.turn_guard
            .lock()
            .expect("turn guard poisoned")
            .remove(session_id);
        self.sequences
            .lock()
            .expect("sequences poisoned")
            .remove(session_id);
        Ok(())
    }

    async fn send_json(&self, session_id: &str, data: serde_json::Value) -> Result<()> {
        let sender = self
            .connections
            .lock()
            .expect("connections poisoned")
            .get(session_id)
            .cloned();
        match sender {
            Some(sender) => {
                sender.send(data.to_string()).await?;
                Ok(())
            }
            None => anyhow::bail!("session {} not connected", session_id),
        }
    }

    async fn send_chunk(&self, session_id: &str, chunk: serde_json::Value) -> Result<()> {
        if let Some(sequence) = chunk["sequence"].as_u64() {
            self.unacked
                .lock()
                .expect("unacked poisoned")
                .entry(session_id.to_string())
                .or_default()
                .insert(
                    sequence,
                    UnackedChunk {
                        data: chunk.to_string(),
                        sent_at: epoch_seconds(),
                        retries: 0,
                    },
                );
        }
        self.send_json(session_id, chunk).await
    }

    async fn ack_chunk(&self, session_id: &str, sequence: u64) -> Result<()> {
        if let Some(chunks) = self
            .unacked
            .lock()
            .expect("unacked poisoned")
            .get_mut(session_id)
        {
            chunks.remove(&sequence);
        }
        Ok(())
    }

    async fn is_duplicate_turn(&self, session_id: &str, turn_id: &str) -> Result<bool> {
        let guard = self.turn_guard.lock().expect("turn guard poisoned");
        Ok(guard
            .get(session_id)
            .map(|guards| guards.contains_key(turn_id))
            .unwrap_or(false))
    }

    async fn mark_turn_seen(&self, session_id: &str, turn_id: &str) -> Result<()> {
        self.turn_guard
            .lock()
            .expect("turn guard poisoned")
            .entry(session_id.to_string())
            .or_default()
            .insert(turn_id.to_string(), epoch_seconds());
        Ok(())
    }

    async fn clear_turn_seen(&self, session_id: &str, turn_id: &str) -> Result<()> {
        if let Some(guards) = self
            .turn_guard
            .lock()
            .expect("turn guard poisoned")
            .get_mut(session_id)
        {
            guards.remove(turn_id);
        }
        Ok(())
    }

    fn next_sequence(&self, session_id: &str) -> u64 {
        let mut sequences = self.sequences.lock().expect("sequences poisoned");
        let counter = sequences.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn active_session_count(&self) -> Result<usize> {
        Ok(self.connections.lock().expect("connections poisoned").len())
    }

    async fn shutdown(&self) {
        self.connections
            .lock()
            .expect("connections poisoned")
            .clear();
    }
}

// ============================================================
// Redis-backed router (horizontal scaling)
// ============================================================

pub struct RedisSessionRouter {
    server_id: String,
    gateway: RedisGateway,
    connections: Arc<Mutex<HashMap<String, FrameSender>>>,
    sequences: Mutex<HashMap<String, u64>>,
    message_ttl_secs: u64,
    turn_guard_ttl_secs: u64,
    cancel: CancellationToken,
}

impl RedisSessionRouter {
    pub fn new(gateway: RedisGateway, message_ttl_secs: u64, turn_guard_ttl_secs: u64) -> Arc<Self> {
        let router = Arc::new(Self {
            server_id: format!("ws-server-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            gateway,
            connections: Arc::new(Mutex::new(HashMap::new())),
            sequences: Mutex::new(HashMap::new()),
            message_ttl_secs,
            turn_guard_ttl_secs,
            cancel: CancellationToken::new(),
        });
        tracing::info!("session router initialized: server_id={}", router.server_id);
        router
    }

    fn session_key(session_id: &str) -> String {
        format!("ws:session:{}", session_id)
    }

    fn unacked_key(session_id: &str) -> String {
        format!("ws:unacked:{}", session_id)
    }

    fn turn_guard_key(session_id: &str) -> String {
        format!("ws:turn_guard:{}", session_id)
    }

    fn channel(session_id: &str) -> String {
        format!("ws:broadcast:{}", session_id)
    }

    fn local_sender(&self, session_id: &str) -> Option<FrameSender> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .get(session_id)
            .cloned()
    }

    /// Spawn the pub/sub listener and the periodic maintenance loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Pattern subscription covers every session channel; frames for
        // sessions not connected here are simply dropped, which is what
        // makes ownership handoff between servers work
        let mut pubsub = self.gateway.pubsub().await?;
        pubsub.psubscribe("ws:broadcast:*").await?;

        let connections = self.connections.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else { break };
                        let Ok(raw) = msg.get_payload::<String>() else { continue };
                        let Ok(routed) = serde_json::from_str::<RoutedMessage>(&raw) else {
                            tracing::warn!("undecodable routed message");
                            continue;
                        };
                        let sender = connections
                            .lock()
                            .expect("connections poisoned")
                            .get(&routed.session_id)
                            .cloned();
                        if let Some(sender) = sender {
                            let _ = sender.send(routed.data.to_string()).await;
                        }
                    }
                }
            }
            tracing::info!("pub/sub listener stopped");
        });

        let retransmit = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = retransmit.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRANSMIT_INTERVAL) => {
                        retransmit.run_retransmission_pass().await;
                    }
                }
            }
        });

        let cleanup = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cleanup.cancel.cancelled() => break,
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                        cleanup.run_turn_guard_cleanup().await;
                    }
                }
            }
        });

        Ok(())
    }

    /// Walk unacked chunks for sessions owned by this server and resend the
    /// ones past their backoff window
    pub async fn run_retransmission_pass(&self) {
        let keys = match self.gateway.scan_keys("ws:unacked:*").await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!("retransmission scan failed: {}", e);
                return;
            }
        };

        let now = epoch_seconds();
        for key in keys {
            let session_id = match key.rsplit(':').next() {
                Some(session_id) => session_id.to_string(),
                None => continue,
            };
            if self.local_sender(&session_id).is_none() {
                continue;
            }

            let chunks = match self.gateway.hgetall(&key).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::error!("retransmission read failed for {}: {}", key, e);
                    continue;
                }
            };

            for (sequence, raw) in chunks {
                let Ok(mut chunk) = serde_json::from_str::<UnackedChunk>(&raw) else {
                    continue;
                };
                if !chunk_is_due(now, chunk.sent_at, chunk.retries) {
                    continue;
                }

                if chunk.retries >= MAX_RETRIES {
                    tracing::warn!(
                        "max retries reached for session={} seq={}",
                        session_id,
                        sequence
                    );
                    let _ = self.gateway.hdel(&key, &[sequence]).await;
                    continue;
                }

                tracing::info!(
                    "retransmitting chunk session={} seq={} retry={}",
                    session_id,
                    sequence,
                    chunk.retries + 1
                );
                let data: serde_json::Value =
                    serde_json::from_str(&chunk.data).unwrap_or(serde_json::Value::Null);
                if let Err(e) = self.send_json(&session_id, data).await {
                    tracing::error!("retransmit send failed: {}", e);
                }

                chunk.retries += 1;
                chunk.sent_at = now;
                if let Ok(updated) = serde_json::to_string(&chunk) {
                    let _ = self.gateway.hset(&key, &sequence, &updated).await;
                }
            }
        }
    }

    /// Evict turn-guard entries older than the TTL
    pub async fn run_turn_guard_cleanup(&self) {
        let keys = match self.gateway.scan_keys("ws:turn_guard:*").await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!("turn guard scan failed: {}", e);
                return;
            }
        };

        let now = epoch_seconds();
        let ttl = self.turn_guard_ttl_secs as f64;
        for key in keys {
            let guards = match self.gateway.hgetall(&key).await {
                Ok(guards) => guards,
                Err(_) => continue,
            };
            let expired: Vec<String> = guards
                .into_iter()
                .filter(|(_, seen_at)| {
                    seen_at
                        .parse::<f64>()
                        .map(|seen_at| now - seen_at > ttl)
                        .unwrap_or(true)
                })
                .map(|(turn_id, _)| turn_id)
                .collect();
            if !expired.is_empty() {
                tracing::debug!("evicting {} expired turn guards from {}", expired.len(), key);
                let _ = self.gateway.hdel(&key, &expired).await;
            }
        }
    }
}

#[async_trait]
impl SessionRouter for RedisSessionRouter {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn connect(&self, session_id: &str, user_id: &str, sender: FrameSender) -> Result<()> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .insert(session_id.to_string(), sender);

        let key = Self::session_key(session_id);
        self.gateway
            .hset_map(
                &key,
                &[
                    ("server", self.server_id.clone()),
                    ("user", user_id.to_string()),
                    ("connected_at", Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        self.gateway.expire(&key, self.message_ttl_secs).await?;

        tracing::info!("connected session={} user={}", session_id, user_id);
        Ok(())
    }

    async fn disconnect(&self, session_id: &str) -> Result<()> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .remove(session_id);
        self.sequences
            .lock()
            .expect("sequences poisoned")
            .remove(session_id);

        self.gateway.del(&Self::session_key(session_id)).await?;
        self.gateway.del(&Self::unacked_key(session_id)).await?;
        self.gateway.del(&Self::turn_guard_key(session_id)).await?;

        tracing::info!("disconnected session={}", session_id);
        Ok(())
    }

    async fn send_json(&self, session_id: &str, data: serde_json::Value) -> Result<()> {
        if let Some(sender) = self.local_sender(session_id) {
            if sender.send(data.to_string()).await.is_ok() {
                return Ok(());
            }
            // Local socket went away; fall through to cross-server routing
        }

        let routed = RoutedMessage {
            kind: "message".to_string(),
            session_id: session_id.to_string(),
            data,
            server_id: self.server_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
        };
        self.gateway
            .publish(&Self::channel(session_id), &serde_json::to_string(&routed)?)
            .await?;
        Ok(())
    }

    async fn send_chunk(&self, session_id: &str, chunk: serde_json::Value) -> Result<()> {
        if let Some(sequence) = chunk["sequence"].as_u64() {
            let stored = UnackedChunk {
                data: chunk.to_string(),
                sent_at: epoch_seconds(),
                retries: 0,
            };
            let key = Self::unacked_key(session_id);
            self.gateway
                .hset(&key, &sequence.to_string(), &serde_json::to_string(&stored)?)
                .await?;
            self.gateway.expire(&key, self.message_ttl_secs).await?;
        }
        self.send_json(session_id, chunk).await
    }

    async fn ack_chunk(&self, session_id: &str, sequence: u64) -> Result<()> {
        self.gateway
            .hdel(&Self::unacked_key(session_id), &[sequence.to_string()])
            .await
    }

    async fn is_duplicate_turn(&self, session_id: &str, turn_id: &str) -> Result<bool> {
        self.gateway
            .hexists(&Self::turn_guard_key(session_id), turn_id)
            .await
    }

    async fn mark_turn_seen(&self, session_id: &str, turn_id: &str) -> Result<()> {
        let key = Self::turn_guard_key(session_id);
        self.gateway
            .hset(&key, turn_id, &epoch_seconds().to_string())
            .await?;
        self.gateway.expire(&key, self.turn_guard_ttl_secs).await?;
        Ok(())
    }

    async fn clear_turn_seen(&self, session_id: &str, turn_id: &str) -> Result<()> {
        self.gateway
            .hdel(&Self::turn_guard_key(session_id), &[turn_id.to_string()])
            .await
    }

    fn next_sequence(&self, session_id: &str) -> u64 {
        let mut sequences = self.sequences.lock().expect("sequences poisoned");
        let counter = sequences.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn active_session_count(&self) -> Result<usize> {
        Ok(self.gateway.scan_keys("ws:session:*").await?.len())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.connections
            .lock()
            .expect("connections poisoned")
            .clear();
        tracing::info!("session router shut down: {}", self.server_id);
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(backoff_secs(0), 2.0);
        assert_eq!(backoff_secs(1), 4.0);
        assert_eq!(backoff_secs(2), 8.0);
        assert_eq!(backoff_secs(4), 32.0);
    }

    #[test]
    fn chunk_due_only_after_backoff_window() {
        let now = 100.0;
        assert!(!chunk_is_due(now, 99.0, 0));
        assert!(chunk_is_due(now, 97.0, 0));
        assert!(!chunk_is_due(now, 97.0, 1));
        assert!(chunk_is_due(now, 90.0, 1));
    }

    #[tokio::test]
    async fn chunk_tracked_until_acked() {
        let router = MemorySessionRouter::new(300);
        let (tx, mut rx) = mpsc::channel(16);
        router.connect("s1", "u1", tx).await.unwrap();

        let sequence = router.next_sequence("s1");
        assert_eq!(sequence, 1);
        router
            .send_chunk("s1", serde_json::json!({ "type": "npc_response", "content": "hi", "sequence": sequence }))
            .await
            .unwrap();

        assert_eq!(router.unacked_len("s1"), 1);
        let delivered = rx.recv().await.unwrap();
        assert!(delivered.contains("\"sequence\":1"));

        router.ack_chunk("s1", sequence).await.unwrap();
        assert_eq!(router.unacked_len("s1"), 0);
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing_per_session() {
        let router = MemorySessionRouter::new(300);
        let first = router.next_sequence("s1");
        let second = router.next_sequence("s1");
        let other = router.next_sequence("s2");
        assert!(second > first);
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn marked_turn_is_reported_duplicate() {
        let router = MemorySessionRouter::new(300);
        assert!(!router.is_duplicate_turn("s1", "t1").await.unwrap());

        router.mark_turn_seen("s1", "t1").await.unwrap();
        assert!(router.is_duplicate_turn("s1", "t1").await.unwrap());

        router.clear_turn_seen("s1", "t1").await.unwrap();
        assert!(!router.is_duplicate_turn("s1", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn turn_guard_cleanup_evicts_expired_entries() {
        let router = MemorySessionRouter::new(0);
        router.mark_turn_seen("s1", "t1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.run_turn_guard_cleanup();
        assert!(!router.is_duplicate_turn("s1", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn disconnect_clears_session_state() {
        let router = MemorySessionRouter::new(300);
        let (tx, _rx) = mpsc::channel(16);
        router.connect("s1", "u1", tx).await.unwrap();
        router.mark_turn_seen("s1", "t1").await.unwrap();
        let sequence = router.next_sequence("s1");
        router
            .send_chunk("s1", serde_json::json!({ "sequence": sequence }))
            .await
            .unwrap();

        router.disconnect("s1").await.unwrap();
        assert_eq!(router.active_session_count().await.unwrap(), 0);
        assert_eq!(router.unacked_len("s1"), 0);
        assert!(!router.is_duplicate_turn("s1", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn send_to_unknown_session_fails() {
        let router = MemorySessionRouter::new(300);
        let result = router.send_json("ghost", serde_json::json!({})).await;
        assert!(result.is_err());
    }
}
