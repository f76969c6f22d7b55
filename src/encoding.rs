//! Hex rendering for JSON-RPC payloads and block-number parsing for indexer responses.

use serde_json::Value;

/// `0x`-prefixed lowercase hex of an address, hash or byte string.
pub fn to_hex(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Block numbers show up as JSON numbers, decimal strings or hex quantities depending
/// on the indexer.
pub fn parse_block_number(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(digits) => u64::from_str_radix(digits, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}
