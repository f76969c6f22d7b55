use crate::codec::{decode_batch_call, handle_ops_selector};
use crate::encoding::to_hex;
use crate::error::{CodecError, TraceError};
use crate::types::{CallFrame, ExecutionTrace, UserOperation};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, Transaction, H256};
use serde::Deserialize;
use serde_json::Value;

/// Which trace RPC the trace endpoint speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TraceMethod {
    /// `tenderly_traceTransaction`: flat `result.trace[]` with `traceAddress`.
    #[default]
    Tenderly,
    /// `debug_traceTransaction` with geth's `callTracer`: nested `calls`.
    CallTracer,
}

#[async_trait]
pub trait TraceSource: Send + Sync {
    async fn fetch_trace(&self, tx: H256) -> Result<ExecutionTrace, TraceError>;
}

#[derive(Debug, Clone)]
pub struct TraceClient {
    url: String,
    method: TraceMethod,
    http: reqwest::Client,
}

impl TraceClient {
    pub fn new(http: reqwest::Client, url: String, method: TraceMethod) -> Self {
        Self { url, method, http }
    }

    async fn rpc(&self, tx: H256, method: &str, params: Value) -> Result<Value, TraceError> {
        let unavailable = |reason: String| TraceError::Unavailable { tx, reason };

        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| unavailable(format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {status}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| unavailable(format!("failed to decode JSON: {e}")))?;

        if let Some(err) = body.get("error") {
            return Err(unavailable(format!("RPC error: {err}")));
        }

        match body.get("result") {
            Some(Value::Null) | None => Err(unavailable("empty trace result".to_string())),
            Some(result) => Ok(result.clone()),
        }
    }
}

#[async_trait]
impl TraceSource for TraceClient {
    async fn fetch_trace(&self, tx: H256) -> Result<ExecutionTrace, TraceError> {
        let trace = match self.method {
            TraceMethod::Tenderly => {
                let result = self
                    .rpc(tx, "tenderly_traceTransaction", serde_json::json!([to_hex(tx)]))
                    .await?;
                parse_tenderly_trace(tx, result)?
            }
            TraceMethod::CallTracer => {
                let result = self
                    .rpc(
                        tx,
                        "debug_traceTransaction",
                        serde_json::json!([to_hex(tx), { "tracer": "callTracer" }]),
                    )
                    .await?;
                parse_call_tracer(tx, result)?
            }
        };

        tracing::debug!(tx = ?tx, frames = trace.frames.len(), "fetched execution trace");
        Ok(trace)
    }
}

/// Frame shape shared by both trace formats; fields either format lacks default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    trace_address: Vec<Value>,
    #[serde(default)]
    calls: Vec<RawFrame>,
}

impl RawFrame {
    fn into_frame(self, tx: H256, depth: usize) -> Result<CallFrame, TraceError> {
        let malformed = |reason: String| TraceError::Malformed { tx, reason };

        let to = match self.to.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(
                s.parse::<Address>()
                    .map_err(|e| malformed(format!("bad frame target '{s}': {e}")))?,
            ),
        };

        let input = match self.input.as_deref() {
            None => Bytes::default(),
            Some(s) => Bytes::from(
                hex::decode(s.trim_start_matches("0x"))
                    .map_err(|e| malformed(format!("bad frame input: {e}")))?,
            ),
        };

        Ok(CallFrame {
            kind: self.kind,
            to,
            input,
            depth,
        })
    }
}

/// `{"trace": [...]}` with one entry per frame, already in execution order.
pub fn parse_tenderly_trace(tx: H256, result: Value) -> Result<ExecutionTrace, TraceError> {
    #[derive(Deserialize)]
    struct TenderlyResult {
        trace: Vec<RawFrame>,
    }

    let result: TenderlyResult = serde_json::from_value(result).map_err(|e| {
        TraceError::Malformed {
            tx,
            reason: e.to_string(),
        }
    })?;

    let frames = result
        .trace
        .into_iter()
        .map(|f| {
            let depth = f.trace_address.len();
            f.into_frame(tx, depth)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ExecutionTrace { tx_hash: tx, frames })
}

/// Flattens a callTracer tree into pre-order frames.
pub fn parse_call_tracer(tx: H256, result: Value) -> Result<ExecutionTrace, TraceError> {
    let root: RawFrame = serde_json::from_value(result).map_err(|e| TraceError::Malformed {
        tx,
        reason: e.to_string(),
    })?;

    let mut frames = Vec::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((mut raw, depth)) = stack.pop() {
        let children = std::mem::take(&mut raw.calls);
        // Reverse so the first child is popped next.
        stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
        frames.push(raw.into_frame(tx, depth)?);
    }

    Ok(ExecutionTrace { tx_hash: tx, frames })
}

/// UserOperations carried by `handleOps` calls into `entry_point`, in trace order.
/// Every frame is considered regardless of depth, so bundles relayed through another
/// contract are found too.
pub fn extract_user_operations(
    trace: &ExecutionTrace,
    entry_point: Address,
    sender: Option<Address>,
) -> Result<Vec<UserOperation>, CodecError> {
    let selector = handle_ops_selector();
    let mut ops = Vec::new();

    for frame in &trace.frames {
        if !frame.is_call() || frame.to != Some(entry_point) || !frame.input.starts_with(&selector)
        {
            continue;
        }
        let decoded = decode_batch_call(&frame.input)?;
        ops.extend(
            decoded
                .into_iter()
                .filter(|op| sender.map_or(true, |s| op.sender == s)),
        );
    }

    Ok(ops)
}

/// Operations of a transaction that called `handleOps` directly. Used when no trace is
/// available; misses bundles submitted through an intermediate contract.
pub fn extract_from_transaction_input(
    tx: &Transaction,
    entry_point: Address,
) -> Result<Vec<UserOperation>, CodecError> {
    if tx.to != Some(entry_point) || !tx.input.starts_with(&handle_ops_selector()) {
        return Ok(Vec::new());
    }
    decode_batch_call(&tx.input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_handle_ops;
    use ethers::types::U256;
    use serde_json::json;

    const ENTRY_POINT: Address = Address::repeat_byte(0xe4);
    const WALLET: Address = Address::repeat_byte(0xaa);

    fn op(sender: Address, nonce: u64) -> UserOperation {
        UserOperation {
            sender,
            nonce: U256::from(nonce),
            ..Default::default()
        }
    }

    fn tenderly_frame(kind: &str, to: Address, input: &Bytes, trace_address: Value) -> Value {
        json!({
            "type": kind,
            "to": to_hex(to),
            "input": to_hex(input),
            "traceAddress": trace_address,
        })
    }

    #[test]
    fn tenderly_depth_is_trace_address_length() {
        let input = Bytes::from(vec![0x01, 0x02]);
        let result = json!({
            "trace": [
                tenderly_frame("CALL", ENTRY_POINT, &input, json!([])),
                tenderly_frame("DELEGATECALL", WALLET, &input, json!([0, 1])),
                { "type": "CREATE", "input": "0x" }
            ]
        });
        let trace = parse_tenderly_trace(H256::zero(), result).unwrap();
        assert_eq!(trace.frames.len(), 3);
        assert_eq!(trace.frames[0].depth, 0);
        assert_eq!(trace.frames[1].depth, 2);
        assert_eq!(trace.frames[1].kind, "DELEGATECALL");
        assert_eq!(trace.frames[2].to, None);
    }

    #[test]
    fn tenderly_without_trace_is_malformed() {
        assert!(matches!(
            parse_tenderly_trace(H256::zero(), json!({ "calls": [] })),
            Err(TraceError::Malformed { .. })
        ));
    }

    #[test]
    fn call_tracer_flattens_in_pre_order() {
        let addr = |b: u8| to_hex(Address::repeat_byte(b));
        let result = json!({
            "type": "CALL", "to": addr(1), "input": "0x01",
            "calls": [
                {
                    "type": "CALL", "to": addr(2), "input": "0x02",
                    "calls": [ { "type": "STATICCALL", "to": addr(3), "input": "0x03" } ]
                },
                { "type": "CALL", "to": addr(4), "input": "0x04" }
            ]
        });

        let trace = parse_call_tracer(H256::zero(), result).unwrap();
        let order: Vec<(u8, usize)> = trace
            .frames
            .iter()
            .map(|f| (f.input[0], f.depth))
            .collect();
        assert_eq!(order, vec![(1, 0), (2, 1), (3, 2), (4, 1)]);
    }

    #[test]
    fn extracts_only_entry_point_handle_ops_calls() {
        let other = Address::repeat_byte(0x77);
        let batch = encode_handle_ops(&[op(WALLET, 1), op(other, 2)], Address::zero());
        let nested = encode_handle_ops(&[op(WALLET, 3)], Address::zero());

        let trace = ExecutionTrace {
            tx_hash: H256::zero(),
            frames: vec![
                CallFrame {
                    kind: "CALL".into(),
                    to: Some(ENTRY_POINT),
                    input: batch.clone(),
                    depth: 0,
                },
                // Same payload to another contract: ignored.
                CallFrame {
                    kind: "CALL".into(),
                    to: Some(other),
                    input: batch.clone(),
                    depth: 1,
                },
                // Not a CALL: ignored.
                CallFrame {
                    kind: "DELEGATECALL".into(),
                    to: Some(ENTRY_POINT),
                    input: batch,
                    depth: 1,
                },
                CallFrame {
                    kind: "call".into(),
                    to: Some(ENTRY_POINT),
                    input: nested,
                    depth: 3,
                },
            ],
        };

        let all = extract_user_operations(&trace, ENTRY_POINT, None).unwrap();
        let nonces: Vec<u64> = all.iter().map(|o| o.nonce.as_u64()).collect();
        assert_eq!(nonces, vec![1, 2, 3]);

        let mine = extract_user_operations(&trace, ENTRY_POINT, Some(WALLET)).unwrap();
        let nonces: Vec<u64> = mine.iter().map(|o| o.nonce.as_u64()).collect();
        assert_eq!(nonces, vec![1, 3]);
    }

    #[test]
    fn no_matching_frames_is_empty_and_bad_payload_is_an_error() {
        let empty = ExecutionTrace::default();
        assert!(extract_user_operations(&empty, ENTRY_POINT, None)
            .unwrap()
            .is_empty());

        let mut truncated = handle_ops_selector().to_vec();
        truncated.extend_from_slice(&[0u8; 8]);
        let bad = ExecutionTrace {
            tx_hash: H256::zero(),
            frames: vec![CallFrame {
                kind: "CALL".into(),
                to: Some(ENTRY_POINT),
                input: Bytes::from(truncated),
                depth: 0,
            }],
        };
        assert!(matches!(
            extract_user_operations(&bad, ENTRY_POINT, None),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn transaction_input_fallback_decodes_direct_calls() {
        let tx = Transaction {
            to: Some(ENTRY_POINT),
            input: encode_handle_ops(&[op(WALLET, 5)], Address::zero()),
            ..Default::default()
        };
        let ops = extract_from_transaction_input(&tx, ENTRY_POINT).unwrap();
        assert_eq!(ops, vec![op(WALLET, 5)]);

        let elsewhere = Transaction {
            to: Some(Address::repeat_byte(0x01)),
            ..tx
        };
        assert!(extract_from_transaction_input(&elsewhere, ENTRY_POINT)
            .unwrap()
            .is_empty());
    }
}
