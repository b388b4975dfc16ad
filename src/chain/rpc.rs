use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::chain::abi::{self, AbiError};
use crate::chain::provider::{
    InclusionOutcome, Query, ReadProvider, TxHandle, WriteCall, WriteProvider,
};
use crate::config::{ChainConfig, TransactionsConfig};
use crate::error::{ReadError, WriteError};

const USER_AGENT: &str = concat!("vaultsync/", env!("CARGO_PKG_VERSION"));

/// EIP-1193 "user rejected the request".
const USER_REJECTED_CODE: i64 = 4001;
const LIMIT_EXCEEDED_CODE: i64 = -32005;
const INTERNAL_ERROR_CODE: i64 = -32603;
const SERVER_ERROR_CODE: i64 = -32000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Why a JSON-RPC round trip failed, before it is mapped onto the read or
/// write taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFailure {
    Transport(String),
    Http(StatusCode),
    Rpc(JsonRpcError),
    Malformed(String),
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcFailure::Transport(e) => write!(f, "transport: {e}"),
            RpcFailure::Http(status) => write!(f, "HTTP {status}"),
            RpcFailure::Rpc(e) => write!(f, "rpc error {}: {}", e.code, e.message),
            RpcFailure::Malformed(e) => write!(f, "malformed response: {e}"),
        }
    }
}

impl JsonRpcError {
    /// Node-side conditions that clear on their own: rate limits, internal
    /// errors and a node that has not caught up with the requested block.
    /// Execution reverts never qualify.
    pub fn is_transient(&self) -> bool {
        let message = self.message.to_ascii_lowercase();
        if message.contains("revert") {
            return false;
        }
        match self.code {
            LIMIT_EXCEEDED_CODE | INTERNAL_ERROR_CODE => true,
            SERVER_ERROR_CODE => {
                message.contains("header not found") || message.contains("limit")
            }
            _ => false,
        }
    }
}

impl From<RpcFailure> for ReadError {
    fn from(failure: RpcFailure) -> Self {
        let transient = match &failure {
            RpcFailure::Transport(_) => true,
            RpcFailure::Http(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            RpcFailure::Rpc(e) => e.is_transient(),
            RpcFailure::Malformed(_) => false,
        };
        if transient {
            ReadError::Transient(failure.to_string())
        } else {
            ReadError::Permanent(failure.to_string())
        }
    }
}

impl From<RpcFailure> for WriteError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Rpc(e) if e.code == USER_REJECTED_CODE => WriteError::UserDeclined,
            RpcFailure::Rpc(e) if e.is_transient() => {
                WriteError::Unavailable(RpcFailure::Rpc(e).to_string())
            }
            RpcFailure::Rpc(e) => WriteError::Rejected(e.message),
            other => WriteError::Unavailable(other.to_string()),
        }
    }
}

/// Inclusion outcome from a receipt, `None` while the transaction is pending.
pub fn receipt_outcome(receipt: &Value) -> Option<InclusionOutcome> {
    if receipt.is_null() {
        return None;
    }
    match receipt.get("status").and_then(Value::as_str) {
        Some("0x1") => Some(InclusionOutcome::Included),
        Some("0x0") => Some(InclusionOutcome::Reverted),
        // Pre-Byzantium receipts carry no status; inclusion is all we know.
        _ => Some(InclusionOutcome::Included),
    }
}

/// `eth_sendTransaction` parameters for a write.
pub fn transaction_params(from: &str, call: &WriteCall) -> Result<Value, AbiError> {
    let data = abi::encode_call(&call.function, &call.args)?;
    let mut tx = json!({
        "from": from,
        "to": call.target,
        "data": data,
    });
    if let Some(value) = &call.value {
        let wei = U256::from_str(value).map_err(|_| AbiError::Encode {
            ty: abi::AbiType::Uint256,
            value: value.clone(),
        })?;
        tx["value"] = Value::String(format!("0x{wei:x}"));
    }
    Ok(json!([tx]))
}

/// JSON-RPC over HTTP. Serves both reads (`eth_call`) and writes
/// (`eth_sendTransaction` from the configured account).
pub struct RpcClient {
    url: String,
    chain_name: String,
    account: Option<String>,
    receipt_poll_interval: Duration,
    client: Client,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(chain: &ChainConfig, transactions: &TransactionsConfig) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(chain.request_timeout)
            .build()?;

        Ok(Self {
            url: chain.rpc_url.clone(),
            chain_name: chain.name.clone(),
            account: chain.account.clone(),
            receipt_poll_interval: transactions.receipt_poll_interval,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    /// Send one JSON-RPC call and return its `result`.
    pub async fn call_method(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Value::Number(self.next_id.fetch_add(1, Ordering::Relaxed).into()),
        };

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(e.to_string()))?;

        let elapsed = start.elapsed();
        debug!(chain = %self.chain_name, method, elapsed_ms = %elapsed.as_millis(), "rpc response");
        metrics::histogram!("vaultsync_rpc_request_duration_seconds", "method" => method.to_string())
            .record(elapsed.as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            metrics::counter!("vaultsync_rpc_errors_total", "method" => method.to_string())
                .increment(1);
            return Err(RpcFailure::Http(status));
        }

        let resp: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcFailure::Malformed(e.to_string()))?;
        if let Some(error) = resp.error {
            metrics::counter!("vaultsync_rpc_errors_total", "method" => method.to_string())
                .increment(1);
            return Err(RpcFailure::Rpc(error));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ReadProvider for RpcClient {
    async fn call(&self, target: &str, query: &Query, args: &[String]) -> Result<Value, ReadError> {
        let data = abi::encode_call(&query.function, args)
            .map_err(|e| ReadError::Permanent(e.to_string()))?;
        let result = self
            .call_method("eth_call", json!([{"to": target, "data": data}, "latest"]))
            .await?;
        let hex_data = result
            .as_str()
            .ok_or_else(|| ReadError::Permanent(format!("eth_call returned {result}")))?;
        abi::decode_output(&query.outputs, hex_data)
            .map_err(|e| ReadError::Permanent(format!("{}: {e}", query.function)))
    }

    async fn block_number(&self) -> Result<u64, ReadError> {
        let result = self.call_method("eth_blockNumber", json!([])).await?;
        result
            .as_str()
            .and_then(abi::parse_quantity)
            .ok_or_else(|| ReadError::Permanent(format!("eth_blockNumber returned {result}")))
    }
}

#[async_trait]
impl WriteProvider for RpcClient {
    async fn submit(&self, call: &WriteCall) -> Result<TxHandle, WriteError> {
        let from = self
            .account
            .as_deref()
            .ok_or_else(|| WriteError::Rejected("no account configured".to_string()))?;
        let params =
            transaction_params(from, call).map_err(|e| WriteError::Rejected(e.to_string()))?;
        let result = self.call_method("eth_sendTransaction", params).await?;
        match result.as_str() {
            Some(hash) if !hash.is_empty() => Ok(TxHandle(hash.to_string())),
            _ => Err(WriteError::Unavailable(format!(
                "eth_sendTransaction returned {result}"
            ))),
        }
    }

    async fn await_inclusion(&self, handle: &TxHandle) -> InclusionOutcome {
        let mut tick = tokio::time::interval(self.receipt_poll_interval);
        loop {
            tick.tick().await;
            match self
                .call_method("eth_getTransactionReceipt", json!([handle.0]))
                .await
            {
                Ok(receipt) => {
                    if let Some(outcome) = receipt_outcome(&receipt) {
                        return outcome;
                    }
                }
                Err(e) => {
                    warn!(chain = %self.chain_name, tx = %handle, error = %e, "receipt poll failed");
                }
            }
        }
    }
}
