//! Hash-chain primitives: canonical hashing, HMAC signatures, chain
//! verification and Merkle roots.
//!
//! Every event's hash commits to a canonical JSON payload whose object keys
//! are sorted lexicographically at every nesting level, so the digest does
//! not depend on map insertion order. The hash input is:
//!
//!   SHA-256(canonical_json({details, error_message, event_type, id,
//!            previous_hash, resource_id, resource_type, sequence_number,
//!            success, timestamp_ms, user_id}))
//!
//! The signature is HMAC-SHA-256(signing_key, hash) over the lowercase hex
//! digest. Event 0 links to [`GENESIS_HASH`], a fixed all-zero sentinel of
//! digest length.

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::models::audit::{AuditEvent, VerificationResult};

type HmacSha256 = Hmac<Sha256>;

/// 创世哈希：64 个 '0'，与 SHA-256 十六进制摘要等长
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// 参与哈希计算的事件内容
/// 字段列表即哈希承诺范围：改动任何一项都会改变摘要
#[derive(Debug, Clone)]
pub struct EventContent<'a> {
    pub id: &'a str,
    pub timestamp_ms: i64,
    pub user_id: Option<Uuid>,
    pub event_type: &'a str,
    pub resource_type: Option<&'a str>,
    pub resource_id: Option<&'a str>,
    pub success: bool,
    pub error_message: Option<&'a str>,
    pub details: Option<&'a Value>,
    pub previous_hash: &'a str,
    pub sequence_number: i64,
}

/// Serialize a JSON value with object keys sorted lexicographically at every
/// level. Scalars and arrays serialize exactly as `serde_json` would.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // String serialization cannot fail
                out.push_str(
                    &serde_json::to_string(key).expect("JSON string keys always serialize"),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Compute the SHA-256 hash for one event's content.
/// Returns a lowercase 64-character hex string.
pub fn content_hash(content: &EventContent<'_>) -> String {
    let payload = json!({
        "details": content.details.cloned().unwrap_or(Value::Null),
        "error_message": content.error_message,
        "event_type": content.event_type,
        "id": content.id,
        "previous_hash": content.previous_hash,
        "resource_id": content.resource_id,
        "resource_type": content.resource_type,
        "sequence_number": content.sequence_number,
        "success": content.success,
        "timestamp_ms": content.timestamp_ms,
        "user_id": content.user_id,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the content hash of a persisted event.
pub fn event_hash(event: &AuditEvent) -> String {
    content_hash(&EventContent {
        id: &event.id,
        timestamp_ms: event.occurred_at.timestamp_millis(),
        user_id: event.user_id,
        event_type: &event.event_type,
        resource_type: event.resource_type.as_deref(),
        resource_id: event.resource_id.as_deref(),
        success: event.success,
        error_message: event.error_message.as_deref(),
        details: event.details(),
        previous_hash: &event.previous_hash,
        sequence_number: event.sequence_number,
    })
}

/// HMAC-SHA-256 签名（输入为十六进制摘要字符串）
pub fn sign_hash(signing_key: &[u8], hash: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key)
        .expect("HMAC-SHA-256 accepts keys of any length");
    mac.update(hash.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// 导出证明签名：HMAC(key, merkle_root + start_ms + end_ms)
pub fn sign_export(signing_key: &[u8], merkle_root: &str, start_ms: i64, end_ms: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key)
        .expect("HMAC-SHA-256 accepts keys of any length");
    mac.update(merkle_root.as_bytes());
    mac.update(start_ms.to_string().as_bytes());
    mac.update(end_ms.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// 常数时间摘要比较，避免计时侧信道
pub fn digests_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Verify a contiguous run of events fetched in ascending order.
///
/// Two failure classes are distinguished:
///
/// 1. **Broken chain** — a sequence gap or a `previous_hash` that does not
///    match the running hash. Nothing after the break can be trusted, so the
///    scan aborts and `broken_chain_at` carries the expected sequence number.
/// 2. **Tampered event** — the event links correctly but its recomputed hash
///    or HMAC signature does not match the stored value. The scan continues
///    so a single pass enumerates every tampered event.
///
/// When the run starts at sequence 0 the walk anchors at [`GENESIS_HASH`];
/// a run starting mid-chain anchors at the first event's stored
/// `previous_hash` (its link into the unfetched prefix is not checked).
pub fn verify_events(events: &[AuditEvent], signing_key: &[u8]) -> VerificationResult {
    let mut result = VerificationResult::ok();

    let Some(first) = events.first() else {
        return result;
    };

    let mut expected_seq = first.sequence_number;
    let mut expected_prev = if first.sequence_number == 0 {
        GENESIS_HASH.to_string()
    } else {
        first.previous_hash.clone()
    };

    for event in events {
        // 断链检查先行：序号与前向链接
        if event.sequence_number != expected_seq {
            result.valid = false;
            result.errors.push(format!(
                "broken chain: expected sequence {}, found {} (event {})",
                expected_seq, event.sequence_number, event.id
            ));
            result.broken_chain_at = Some(expected_seq);
            return result;
        }

        if event.previous_hash != expected_prev {
            result.valid = false;
            result.errors.push(format!(
                "broken chain at sequence {}: previous_hash mismatch (event {})",
                expected_seq, event.id
            ));
            result.broken_chain_at = Some(expected_seq);
            return result;
        }

        let stored_hash = event.hash();
        let mut tampered = false;

        // 内容哈希复算
        let recomputed = event_hash(event);
        if !digests_match(stored_hash, &recomputed) {
            result.errors.push(format!(
                "tampered event {}: content hash mismatch at sequence {}",
                event.id, event.sequence_number
            ));
            tampered = true;
        }

        // 签名复核（对存储哈希做 HMAC）
        let expected_signature = sign_hash(signing_key, stored_hash);
        if !digests_match(&event.signature, &expected_signature) {
            result.errors.push(format!(
                "tampered event {}: signature mismatch at sequence {}",
                event.id, event.sequence_number
            ));
            tampered = true;
        }

        if tampered {
            result.tampered_events.push(event.id.clone());
        }

        // 链接推进使用存储哈希：被篡改事件之后的链接关系仍可继续校验
        expected_prev = stored_hash.to_string();
        expected_seq += 1;
    }

    result.valid = result.errors.is_empty();
    result
}

/// Build a binary Merkle tree bottom-up over ordered event hashes.
///
/// An odd node at any level is paired with itself. Returns the root as a
/// lowercase hex digest, or an empty string for zero hashes.
pub fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return String::new();
    }

    let mut level: Vec<String> = hashes.to_vec();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));

        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);

            let mut hasher = Sha256::new();
            hasher.update(left.as_bytes());
            hasher.update(right.as_bytes());
            next.push(hex::encode(hasher.finalize()));
        }

        level = next;
    }

    level.swap_remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = json!({
            "zeta": 1,
            "alpha": {"nested_z": true, "nested_a": [1, 2, {"b": 1, "a": 2}]},
        });

        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"nested_a":[1,2,{"a":2,"b":1}],"nested_z":true},"zeta":1}"#
        );
    }

    #[test]
    fn test_canonical_json_is_insertion_order_independent() {
        let mut a = serde_json::Map::new();
        a.insert("x".to_string(), json!(1));
        a.insert("y".to_string(), json!(2));

        let mut b = serde_json::Map::new();
        b.insert("y".to_string(), json!(2));
        b.insert("x".to_string(), json!(1));

        assert_eq!(
            canonical_json(&Value::Object(a)),
            canonical_json(&Value::Object(b))
        );
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let details = json!({"instrument": "hplc-07", "run": 42});
        let content = EventContent {
            id: "evt_1700000000000_a1b2c3d4",
            timestamp_ms: 1_700_000_000_000,
            user_id: None,
            event_type: "report.generate",
            resource_type: Some("report"),
            resource_id: Some("rpt-9"),
            success: true,
            error_message: None,
            details: Some(&details),
            previous_hash: GENESIS_HASH,
            sequence_number: 0,
        };

        let first = content_hash(&content);
        let second = content_hash(&content);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_content_hash_commits_to_every_field() {
        let base = EventContent {
            id: "evt_1700000000000_a1b2c3d4",
            timestamp_ms: 1_700_000_000_000,
            user_id: None,
            event_type: "report.generate",
            resource_type: None,
            resource_id: None,
            success: true,
            error_message: None,
            details: None,
            previous_hash: GENESIS_HASH,
            sequence_number: 0,
        };
        let base_hash = content_hash(&base);

        let mut flipped = base.clone();
        flipped.success = false;
        assert_ne!(content_hash(&flipped), base_hash);

        let mut renumbered = base.clone();
        renumbered.sequence_number = 1;
        assert_ne!(content_hash(&renumbered), base_hash);

        let mut relinked = base;
        relinked.previous_hash = "ab".into();
        assert_ne!(content_hash(&relinked), base_hash);
    }

    #[test]
    fn test_signature_roundtrip() {
        let key = b"test-signing-key-with-enough-length";
        let hash = "a".repeat(64);

        let signature = sign_hash(key, &hash);
        assert_eq!(signature.len(), 64);
        assert!(digests_match(&signature, &sign_hash(key, &hash)));
        assert!(!digests_match(&signature, &sign_hash(b"another-key-entirely-different!!", &hash)));
    }

    #[test]
    fn test_digests_match_rejects_different_lengths() {
        assert!(!digests_match("abcd", "abc"));
        assert!(digests_match("abcd", "abcd"));
    }

    #[test]
    fn test_merkle_root_empty_and_single() {
        assert_eq!(merkle_root(&[]), "");

        // 单叶子树的根就是叶子本身
        let single = vec!["ff".repeat(32)];
        assert_eq!(merkle_root(&single), single[0]);
    }

    #[test]
    fn test_merkle_root_deterministic_and_order_sensitive() {
        let hashes: Vec<String> = (0u8..5)
            .map(|i| {
                let mut hasher = Sha256::new();
                hasher.update([i]);
                hex::encode(hasher.finalize())
            })
            .collect();

        let root = merkle_root(&hashes);
        assert_eq!(root, merkle_root(&hashes));
        assert_eq!(root.len(), 64);

        let mut reversed = hashes.clone();
        reversed.reverse();
        assert_ne!(merkle_root(&reversed), root);
    }

    #[test]
    fn test_merkle_root_duplicates_odd_node() {
        // 三个叶子：第三个与自身配对
        let h: Vec<String> = ["00", "11", "22"].iter().map(|s| s.repeat(32)).collect();

        let pair = |l: &str, r: &str| {
            let mut hasher = Sha256::new();
            hasher.update(l.as_bytes());
            hasher.update(r.as_bytes());
            hex::encode(hasher.finalize())
        };

        let level1 = [pair(&h[0], &h[1]), pair(&h[2], &h[2])];
        let expected = pair(&level1[0], &level1[1]);
        assert_eq!(merkle_root(&h), expected);
    }
}
