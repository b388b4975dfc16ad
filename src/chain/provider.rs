use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde_json::{Value, json};

use crate::chain::abi::{AbiType, Signature};
use crate::error::{ReadError, WriteError};

/// A read-only contract call: what to call and how to decode the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub function: Signature,
    pub outputs: Vec<AbiType>,
}

/// Identifies a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TxHandle(pub String);

impl std::fmt::Display for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionOutcome {
    Included,
    Reverted,
    Timeout,
}

/// A write as the state machine hands it to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub target: String,
    pub function: Signature,
    pub args: Vec<String>,
    /// Native value in wei.
    pub value: Option<String>,
}

#[async_trait]
pub trait ReadProvider: Send + Sync + 'static {
    async fn call(&self, target: &str, query: &Query, args: &[String]) -> Result<Value, ReadError>;

    async fn block_number(&self) -> Result<u64, ReadError>;
}

#[async_trait]
pub trait WriteProvider: Send + Sync + 'static {
    async fn submit(&self, call: &WriteCall) -> Result<TxHandle, WriteError>;

    async fn await_inclusion(&self, handle: &TxHandle) -> InclusionOutcome;
}

/// Push transport for contract logs. The returned stream ends when the
/// transport drops; delivery is best-effort and logs may be lost.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync + 'static {
    async fn subscribe(&self, filter: &LogFilter) -> Result<BoxStream<'static, LogEvent>, ReadError>;
}

/// One `(contract, event)` pair to watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogFilter {
    pub address: String,
    pub event: Signature,
}

impl LogFilter {
    pub fn topic0(&self) -> String {
        self.event.topic()
    }

    /// Filter object as `eth_subscribe("logs", ...)` expects it.
    pub fn to_value(&self) -> Value {
        json!({
            "address": self.address,
            "topics": [self.topic0()],
        })
    }

    pub fn matches(&self, log: &LogEvent) -> bool {
        log.address.eq_ignore_ascii_case(&self.address)
            && log
                .topics
                .first()
                .is_some_and(|t| t.eq_ignore_ascii_case(&self.topic0()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    /// Set on logs retracted by a reorg.
    pub removed: bool,
}

impl LogEvent {
    /// Parse a log object as delivered by `eth_subscription` / `eth_getLogs`.
    pub fn from_value(v: &Value) -> Option<Self> {
        let address = v.get("address")?.as_str()?.to_ascii_lowercase();
        let topics = v
            .get("topics")?
            .as_array()?
            .iter()
            .map(|t| t.as_str().map(str::to_ascii_lowercase))
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            address,
            topics,
            data: v
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or("0x")
                .to_string(),
            block_number: v
                .get("blockNumber")
                .and_then(Value::as_str)
                .and_then(crate::chain::abi::parse_quantity),
            transaction_hash: v
                .get("transactionHash")
                .and_then(Value::as_str)
                .map(str::to_string),
            removed: v.get("removed").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> LogFilter {
        LogFilter {
            address: "0x1111111111111111111111111111111111111111".into(),
            event: "Deposit(address,uint256)".parse().unwrap(),
        }
    }

    #[test]
    fn test_log_from_value() {
        let raw = json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": [filter().topic0().to_uppercase().replace("0X", "0x")],
            "data": "0x01",
            "blockNumber": "0x1b4",
            "transactionHash": "0xabc",
        });
        let log = LogEvent::from_value(&raw).unwrap();
        assert_eq!(log.block_number, Some(436));
        assert!(!log.removed);
        assert!(filter().matches(&log));
    }

    #[test]
    fn test_log_from_value_rejects_garbage() {
        assert!(LogEvent::from_value(&json!({"topics": []})).is_none());
        assert!(LogEvent::from_value(&json!({"address": "0x1", "topics": [1]})).is_none());
    }

    #[test]
    fn test_filter_value() {
        let v = filter().to_value();
        assert_eq!(v["address"], "0x1111111111111111111111111111111111111111");
        assert_eq!(v["topics"][0], filter().topic0());
    }

    #[test]
    fn test_filter_rejects_other_contract() {
        let log = LogEvent {
            address: "0x2222222222222222222222222222222222222222".into(),
            topics: vec![filter().topic0()],
            data: "0x".into(),
            block_number: None,
            transaction_hash: None,
            removed: false,
        };
        assert!(!filter().matches(&log));
    }
}
