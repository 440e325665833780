//! Hex-blob truncation for pretty-printed JSON log output.
//!
//! Engine API payloads embed multi-kilobyte hex strings (transactions,
//! blobs). Logging them verbatim drowns the output, so the log renderer
//! replaces oversized hex strings with a `0x<head>...<tail> <N bytes>`
//! placeholder. Hashes, addresses and KZG commitments stay below the
//! threshold and pass through unchanged. Module dispatch always sees the
//! original values; only the rendered tree is truncated.

use serde_json::Value;

/// Minimum length before truncation kicks in. Preserves hashes
/// (66 chars), addresses (42 chars) and KZG commitments/proofs (98 chars).
const TRUNCATE_THRESHOLD: usize = 256;

/// Hex characters shown at each end of a truncated value.
const PREVIEW_LEN: usize = 8;

/// Truncate a single hex string if it exceeds the threshold. Non-hex
/// strings and short values are returned unchanged.
pub fn truncate_hex_value(s: &str) -> Option<String> {
    if s.len() <= TRUNCATE_THRESHOLD {
        return None;
    }

    let rest = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;

    // Spot-check the first 16 chars after the prefix to confirm this
    // looks like hex data, avoiding false positives on long strings.
    if !rest
        .chars()
        .take(16)
        .all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }

    // Each pair of hex chars is one byte.
    let byte_count = (s.len() - 2) / 2;
    let head = &rest[..PREVIEW_LEN];
    let tail = &s[s.len() - PREVIEW_LEN..];

    Some(format!("0x{head}...{tail} <{byte_count} bytes>"))
}

/// Recursively walk a parsed JSON tree, replacing oversized hex strings
/// with truncated placeholders. The input is not modified; a new tree is
/// returned.
pub fn truncate_hex_in_tree(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_hex_in_tree(v)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(truncate_hex_in_tree).collect())
        }
        Value::String(s) => match truncate_hex_value(s) {
            Some(truncated) => Value::String(truncated),
            None => value.clone(),
        },
        other => other.clone(),
    }
}
