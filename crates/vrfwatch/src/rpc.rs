//! [LedgerClient] over EVM JSON-RPC (HTTP).
//!
//! eth_blockNumber / eth_call / eth_getLogs / eth_sendTransaction. Provider responses are
//! mapped onto [LedgerError]: transport failures, HTTP 429/5xx and provider-internal errors
//! are transient; "range too large" style refusals become `RangeTooLarge`; reverts of the
//! state view become `NotFound`.

use crate::abi::{
    decode_log, decode_state_return, encode_subject_call, parse_hex_bytes, parse_hex_u64,
    Address, EventRecord, EventTopics, SubjectId, SubjectState,
};
use crate::config::MonitorConfig;
use crate::gateway::{LedgerClient, LedgerError, LogFilter};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// JSON-RPC ledger client. Cheap to share behind an `Arc`; `reqwest::Client` pools connections.
pub struct RpcLedger {
    client: reqwest::Client,
    http_url: String,
    topics: EventTopics,
    state_selector: [u8; 4],
    trigger: Option<([u8; 4], Address)>,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(config: &MonitorConfig) -> Result<Self, LedgerError> {
        if config.http_url.is_empty() {
            return Err(LedgerError::Invalid("http_url required".into()));
        }
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| LedgerError::Invalid(e.to_string()))?;
        let ep = &config.entry_points;
        let trigger = match (ep.trigger_selector(), ep.trigger_from) {
            (Some(sel), Some(from)) => Some((sel, from)),
            (Some(_), None) => {
                tracing::warn!("manual_trigger configured without trigger_from; trigger disabled");
                None
            }
            _ => None,
        };
        Ok(Self {
            client,
            http_url: config.http_url.clone(),
            topics: ep.topics(),
            state_selector: ep.state_selector(),
            trigger,
            next_id: AtomicU64::new(1),
        })
    }

    async fn http_json_rpc(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params
        });
        let resp = self
            .client
            .post(&self.http_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transient(format!("{}: {}", method, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_failure(method, status, &body));
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| LedgerError::Transient(format!("{}: parse response: {}", method, e)))?;
        if let Some(err) = v.get("error") {
            return Err(classify_rpc_error(err));
        }
        v.get("result")
            .cloned()
            .ok_or_else(|| LedgerError::Invalid(format!("{}: missing result", method)))
    }

    async fn eth_call(&self, to: &Address, calldata: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let params = json!([{
            "to": to.to_string(),
            "data": format!("0x{}", hex::encode(calldata)),
        }, "latest"]);
        let result = self.http_json_rpc("eth_call", params).await?;
        let s = result
            .as_str()
            .ok_or_else(|| LedgerError::Invalid("eth_call result not string".into()))?;
        parse_hex_bytes(s).map_err(|e| LedgerError::Invalid(e.to_string()))
    }
}

/// Build an eth_getLogs filter. Topic list is trimmed to what is set
/// (some nodes reject trailing nulls).
pub fn build_logs_filter(filter: &LogFilter, from: u64, to: u64) -> Value {
    let mut topics = vec![Value::String(format!("0x{}", hex::encode(filter.topic0)))];
    if let Some(t1) = filter.topic1 {
        topics.push(Value::String(format!("0x{}", hex::encode(t1))));
    }
    json!({
        "address": filter.address.to_string(),
        "topics": topics,
        "fromBlock": format!("0x{:x}", from),
        "toBlock": format!("0x{:x}", to),
    })
}

/// Map a non-2xx HTTP response onto the ledger error taxonomy. 429 and 5xx are retried;
/// other statuses are refusals unless the body carries a JSON-RPC error object.
pub fn classify_http_failure(method: &str, status: reqwest::StatusCode, body: &str) -> LedgerError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return LedgerError::Transient(format!("{}: HTTP {}", method, status));
    }
    let rpc_error = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").cloned());
    match rpc_error {
        Some(err) => classify_rpc_error(&err),
        None => LedgerError::Invalid(format!("{}: HTTP {}", method, status)),
    }
}

/// Map a JSON-RPC error object onto the ledger error taxonomy.
pub fn classify_rpc_error(err: &Value) -> LedgerError {
    let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();
    let lower = message.to_ascii_lowercase();
    const RANGE_HINTS: [&str; 6] = [
        "block range",
        "range is too large",
        "query returned more than",
        "too many blocks",
        "exceed maximum block range",
        "response size exceeded",
    ];
    if RANGE_HINTS.iter().any(|h| lower.contains(h)) {
        // Bounds are filled in by the caller, which knows the requested window.
        return LedgerError::RangeTooLarge { from: 0, to: 0 };
    }
    if lower.contains("execution reverted") || code == 3 {
        return LedgerError::NotFound(message);
    }
    // -32005 limit exceeded / -32603 internal / rate limiting and header races are worth retrying.
    if code == -32005
        || code == -32603
        || lower.contains("rate limit")
        || lower.contains("header not found")
        || lower.contains("timeout")
    {
        return LedgerError::Transient(message);
    }
    LedgerError::Invalid(format!("RPC error {}: {}", code, message))
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn current_height(&self) -> Result<u64, LedgerError> {
        let result = self.http_json_rpc("eth_blockNumber", json!([])).await?;
        let s = result
            .as_str()
            .ok_or_else(|| LedgerError::Invalid("blockNumber not string".into()))?;
        parse_hex_u64(s).map_err(|e| LedgerError::Invalid(e.to_string()))
    }

    async fn read_state(
        &self,
        contract: &Address,
        subject: &SubjectId,
    ) -> Result<SubjectState, LedgerError> {
        let calldata = encode_subject_call(self.state_selector, subject);
        let bytes = self.eth_call(contract, &calldata).await?;
        if bytes.is_empty() {
            return Err(LedgerError::NotFound(format!("no code or empty return at {}", contract)));
        }
        decode_state_return(&bytes).map_err(|e| LedgerError::Invalid(e.to_string()))
    }

    async fn search_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        let params = json!([build_logs_filter(filter, from, to)]);
        let result = match self.http_json_rpc("eth_getLogs", params).await {
            Ok(r) => r,
            Err(LedgerError::RangeTooLarge { .. }) => {
                return Err(LedgerError::RangeTooLarge { from, to })
            }
            Err(e) => return Err(e),
        };
        let logs = result
            .as_array()
            .ok_or_else(|| LedgerError::Invalid("getLogs not array".into()))?;
        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            if log.get("removed").and_then(|r| r.as_bool()) == Some(true) {
                continue;
            }
            match decode_log(log, &self.topics) {
                Ok(ev) if ev.kind() == filter.kind => out.push(ev),
                Ok(_) => {}
                Err(e) => tracing::debug!(reason = %e, from, to, "decode log skipped"),
            }
        }
        if !logs.is_empty() && out.is_empty() {
            tracing::warn!(raw_count = logs.len(), from, to, "search_logs: logs received but none decoded");
        }
        Ok(out)
    }

    async fn manual_trigger(&self, contract: &Address, subject: &SubjectId) -> Result<(), LedgerError> {
        let (selector, from) = self
            .trigger
            .ok_or_else(|| LedgerError::NotFound("manual trigger not configured".into()))?;
        let params = json!([{
            "from": from.to_string(),
            "to": contract.to_string(),
            "data": format!("0x{}", hex::encode(encode_subject_call(selector, subject))),
        }]);
        let tx = self.http_json_rpc("eth_sendTransaction", params).await?;
        tracing::info!(%subject, tx = %tx, "manual trigger sent");
        Ok(())
    }
}
