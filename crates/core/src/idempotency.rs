//! 入口去重支持
//!
//! 对规范化后的触发载荷计算 SHA-256 哈希，在保留窗口内相同哈希的
//! 重复触发会被拒绝。哈希对键顺序不敏感：载荷先做递归键排序再序列化。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 去重记录：按哈希唯一，insert-once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub hash: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(hash: String, job_id: String) -> Self {
        Self {
            hash,
            job_id,
            created_at: Utc::now(),
        }
    }

    /// 记录是否仍在保留窗口内
    pub fn is_within_window(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) < window
    }
}

/// 计算触发载荷的稳定哈希
///
/// 命令类型参与哈希，相同载荷发给不同命令属于不同触发。
pub fn trigger_hash(command_type: &str, payload: &serde_json::Value) -> String {
    let canonical = canonicalize(payload);
    let mut hasher = Sha256::new();
    hasher.update(command_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.to_string().as_bytes());
    hex_encode(&hasher.finalize())
}

/// 递归按键排序，得到与键顺序无关的规范形式
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (key, val) in entries {
                sorted.insert(key.clone(), canonicalize(val));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_stable() {
        let payload = json!({"sku": "A-1", "title": "Widget"});
        let h1 = trigger_hash("PublishListing", &payload);
        let h2 = trigger_hash("PublishListing", &payload);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"a": 1, "b": {"x": true, "y": [1, 2]}});
        let b = json!({"b": {"y": [1, 2], "x": true}, "a": 1});
        assert_eq!(trigger_hash("T", &a), trigger_hash("T", &b));
    }

    #[test]
    fn test_hash_differs_per_command_type() {
        let payload = json!({"sku": "A-1"});
        assert_ne!(
            trigger_hash("PublishListing", &payload),
            trigger_hash("RemoveListing", &payload)
        );
    }

    #[test]
    fn test_hash_differs_per_payload() {
        assert_ne!(
            trigger_hash("T", &json!({"sku": "A-1"})),
            trigger_hash("T", &json!({"sku": "A-2"}))
        );
    }

    #[test]
    fn test_array_order_matters() {
        assert_ne!(
            trigger_hash("T", &json!({"ids": [1, 2]})),
            trigger_hash("T", &json!({"ids": [2, 1]}))
        );
    }

    #[test]
    fn test_window_check() {
        let mut record = IdempotencyRecord::new("h".to_string(), "j".to_string());
        let now = Utc::now();
        assert!(record.is_within_window(Duration::hours(24), now));
        record.created_at = now - Duration::hours(25);
        assert!(!record.is_within_window(Duration::hours(24), now));
    }
}
