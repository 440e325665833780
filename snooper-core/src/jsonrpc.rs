//! JSON-RPC 2.0 envelope helpers.
//!
//! The proxy parses bodies once (for logging) and hands the parsed
//! `serde_json::Value` to observers. These helpers extract the envelope
//! fields without re-parsing or taking ownership.

use serde_json::Value;

/// A JSON-RPC error object extracted from a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Extract the `method` field from a parsed request body.
pub fn method(body: &Value) -> Option<&str> {
    body.as_object()?.get("method")?.as_str()
}

/// Extract the `params` array from a parsed request body.
pub fn params(body: &Value) -> Option<&Vec<Value>> {
    body.as_object()?.get("params")?.as_array()
}

/// Extract the `result` field from a parsed response body.
///
/// Returns `None` both when the field is absent and when the body is not
/// an object; callers treat either as a null result.
pub fn result(body: &Value) -> Option<&Value> {
    body.as_object()?.get("result")
}

/// Extract the `error` object from a parsed response body.
pub fn rpc_error(body: &Value) -> Option<RpcError> {
    let obj = body.as_object()?.get("error")?.as_object()?;

    Some(RpcError {
        code: obj.get("code").and_then(Value::as_i64).unwrap_or(0),
        message: obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Parse a hex quantity (with or without `0x` prefix) as u64.
///
/// Unparseable values yield zero; the engine API carries quantities far
/// below u64::MAX, so saturation is not a concern in practice.
pub fn hex_to_u64(s: &str) -> u64 {
    let trimmed = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    if trimmed.is_empty() {
        return 0;
    }

    u64::from_str_radix(trimmed, 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_method_and_params() {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "eth_blockNumber",
            "params": [],
            "id": 1
        });

        assert_eq!(method(&body), Some("eth_blockNumber"));
        assert_eq!(params(&body).map(Vec::len), Some(0));
    }

    #[test]
    fn method_absent_on_non_object() {
        assert_eq!(method(&json!([1, 2, 3])), None);
        assert_eq!(method(&json!("eth_blockNumber")), None);
    }

    #[test]
    fn extracts_result() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": "0x1234"});
        assert_eq!(result(&body), Some(&json!("0x1234")));

        let no_result = json!({"jsonrpc": "2.0", "id": 1});
        assert_eq!(result(&no_result), None);
    }

    #[test]
    fn extracts_rpc_error() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "method not found"}
        });

        let err = rpc_error(&body).unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "method not found");

        assert_eq!(rpc_error(&json!({"jsonrpc": "2.0", "result": null})), None);
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(hex_to_u64("0x1234"), 0x1234);
        assert_eq!(hex_to_u64("1234"), 0x1234);
        assert_eq!(hex_to_u64("0X10"), 16);
        assert_eq!(hex_to_u64("0x"), 0);
        assert_eq!(hex_to_u64(""), 0);
        assert_eq!(hex_to_u64("not-hex"), 0);
        assert_eq!(hex_to_u64("0xffffffffffffffff"), u64::MAX);
    }
}
