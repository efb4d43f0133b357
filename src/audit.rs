use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Postgres};

use crate::config::Settings;
use crate::db;
use crate::models::MemoryAudit;

/// `sha256:`-prefixed hex digest of a text
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Compact single-line JSON used for output digests
pub fn compact_json(data: &impl serde::Serialize) -> String {
    serde_json::to_string(data).unwrap_or_else(|_| "null".to_string())
}

/// Append one audit row.
///
/// Best effort by default: a failed write is logged and swallowed so the
/// primary operation still succeeds. In production with audit logging
/// enabled the failure propagates instead.
pub async fn write_audit(
    pool: &Pool<Postgres>,
    settings: &Settings,
    audit: &MemoryAudit,
) -> Result<()> {
    match db::insert_audit(pool, audit).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if settings.is_production() && settings.audit_log_enabled {
                Err(e)
            } else {
                tracing::error!("audit write failed for {}: {}", audit.request_id, e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_are_prefixed_and_stable() {
        let digest = hash_text("年费减免");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest, hash_text("年费减免"));
        assert_ne!(digest, hash_text("别的问题"));
    }

    #[test]
    fn empty_input_still_digests() {
        let digest = hash_text("");
        assert_eq!(digest.len(), "sha256:".len() + 64);
    }

    #[test]
    fn compact_json_has_no_padding() {
        let value = serde_json::json!({ "hits": [{ "id": "k1", "score": 1.0 }] });
        let compact = compact_json(&value);
        assert!(!compact.contains(": "));
        assert!(!compact.contains(", "));
    }
}
