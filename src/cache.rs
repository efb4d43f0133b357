use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

// ============================================================
// Redis Gateway
// ============================================================
//
// Single typed entry point for every Redis concern in the system:
//   - Streams          -> event bus delivery (consumer groups, PEL)
//   - Pub/Sub          -> agent channels and session routing
//   - Hashes           -> agent registry, session state, unacked chunks
//   - Sorted sets      -> sliding-window rate limiting
//   - Strings (NX EX)  -> idempotency / dedupe claims
//   - Lists            -> conversation history, request/response relays
//
// Command traffic goes through a cloned ConnectionManager. Pub/Sub and
// blocking reads need their own connections, minted from the retained
// client.
// ============================================================

#[derive(Clone)]
pub struct RedisGateway {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisGateway {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager, client })
    }

    /// Raw command connection for callers that pipeline their own commands
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Dedicated pub/sub connection; the caller owns its subscription set
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        let conn = self.client.get_async_connection().await?;
        Ok(conn.into_pubsub())
    }

    pub async fn ping(&self) -> Result<()> {
        let mut con = self.conn();
        redis::cmd("PING").query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    // ── Strings ───────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut con = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    /// Atomic claim: returns true when this caller won the key
    pub async fn claim_nx_ex(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut con = self.conn();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut con)
            .await?;
        Ok(result.is_some())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut con = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut con = self.conn();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    // ── Hashes ────────────────────────────────────────────────

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut con = self.conn();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    pub async fn hset_map(&self, key: &str, entries: &[(&str, String)]) -> Result<()> {
        let mut con = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in entries {
            cmd.arg(*field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut con = self.conn();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut con)
            .await?;
        Ok(value)
    }

    pub async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let mut con = self.conn();
        let exists: bool = redis::cmd("HEXISTS")
            .arg(key)
            .arg(field)
            .query_async(&mut con)
            .await?;
        Ok(exists)
    }

    pub async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut con = self.conn();
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }
        cmd.query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut con = self.conn();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut con).await?;
        Ok(map)
    }

    // ── Lists ─────────────────────────────────────────────────

    pub async fn lpush_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut con = self.conn();
        redis::pipe()
            .cmd("LPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut con = self.conn();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut con = self.conn();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut con)
            .await?;
        Ok(items)
    }

    /// Blocking pop on a dedicated connection so the shared manager never stalls
    pub async fn blpop(&self, key: &str, timeout_secs: f64) -> Result<Option<String>> {
        let mut con = self.client.get_async_connection().await?;
        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut con)
            .await?;
        Ok(result.map(|(_, value)| value))
    }

    // ── Pub/Sub publish ───────────────────────────────────────

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut con = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    // ── Key scanning ──────────────────────────────────────────

    /// Cursor-based key walk; bounded memory even on large keyspaces
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.conn();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = con.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    // ── Streams ───────────────────────────────────────────────

    /// Append a field map to a stream; values are pre-serialized JSON strings
    pub async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut con = self.conn();
        let id: String = con.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    /// Create the consumer group if missing; BUSYGROUP is not an error
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut con = self.conn();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut con)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Read fresh entries for a consumer; returns (entry_id, decoded fields)
    pub async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        let mut con = self.conn();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let reply: StreamReadReply = con.xread_options(&[stream], &[">"], &opts).await?;
        Ok(flatten_stream_reply(reply))
    }

    pub async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut con = self.conn();
        let _: u64 = con.xack(stream, group, &[entry_id]).await?;
        Ok(())
    }

    /// Pending entries with idle time and delivery count, oldest first
    pub async fn xpending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut con = self.conn();
        let reply: StreamPendingCountReply =
            con.xpending_count(stream, group, "-", "+", count).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle_ms: entry.last_delivered_ms as u64,
                times_delivered: entry.times_delivered as u64,
            })
            .collect())
    }

    /// Take ownership of idle entries and return their payloads
    pub async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: usize,
        ids: &[String],
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.conn();
        let reply: StreamClaimReply = con
            .xclaim(stream, group, consumer, min_idle_ms, ids)
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|entry| (entry.id, decode_stream_fields(entry.map)))
            .collect())
    }

    // ── Embedding cache ───────────────────────────────────────

    fn embedding_key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hex::encode(hasher.finalize());
        format!("emb:{}", &hash[..16])
    }

    /// Cache an embedding vector as compact little-endian f32 bytes
    pub async fn cache_embedding(&self, text: &str, embedding: &[f32]) -> Result<()> {
        use base64::Engine;
        let key = Self::embedding_key(text);
        let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        // Embeddings cache for 7 days
        self.set_ex(&key, &encoded, 604800).await
    }

    pub async fn get_cached_embedding(&self, text: &str) -> Result<Option<Vec<f32>>> {
        use base64::Engine;
        let key = Self::embedding_key(text);
        if let Some(encoded) = self.get(&key).await? {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&encoded) {
                let embedding: Vec<f32> = bytes
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
                return Ok(Some(embedding));
            }
        }
        Ok(None)
    }
}

/// One entry from the pending-entries list of a consumer group
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub times_delivered: u64,
}

fn flatten_stream_reply(reply: StreamReadReply) -> Vec<(String, HashMap<String, String>)> {
    let mut entries = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            entries.push((id.id, decode_stream_fields(id.map)));
        }
    }
    entries
}

fn decode_stream_fields(map: HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(field, value)| {
            redis::from_redis_value::<String>(&value)
                .ok()
                .map(|v| (field, v))
        })
        .collect()
}
