use serde::Serialize;
use thiserror::Error;

/// Failure of a read against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// Network failure, timeout or overloaded node. Retried with backoff.
    #[error("transient read error: {0}")]
    Transient(String),
    /// Malformed response or decoding failure. Never retried automatically.
    #[error("permanent read error: {0}")]
    Permanent(String),
    /// The fetch was aborted because its entry was evicted or abandoned.
    #[error("read cancelled")]
    Cancelled,
}

impl ReadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReadError::Transient(_))
    }
}

/// Failure of a write before it reached the pending pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("user declined the request")]
    UserDeclined,
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("write provider unavailable: {0}")]
    Unavailable(String),
}

/// Why a transaction record ended in `failed`. Only used for messaging;
/// every cause leads to the same terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "kebab-case")]
pub enum FailureCause {
    UserDeclined,
    PreconditionNotMet(Vec<String>),
    Reverted,
    Timeout,
    ProviderUnavailable(String),
}

impl FailureCause {
    pub fn label(&self) -> &'static str {
        match self {
            FailureCause::UserDeclined => "user_declined",
            FailureCause::PreconditionNotMet(_) => "precondition_not_met",
            FailureCause::Reverted => "reverted",
            FailureCause::Timeout => "timeout",
            FailureCause::ProviderUnavailable(_) => "provider_unavailable",
        }
    }
}

impl From<WriteError> for FailureCause {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::UserDeclined => FailureCause::UserDeclined,
            WriteError::Rejected(reason) => FailureCause::PreconditionNotMet(vec![reason]),
            WriteError::Unavailable(reason) => FailureCause::ProviderUnavailable(reason),
        }
    }
}

/// Errors returned synchronously by the action API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("action '{0}' already has a transaction in flight")]
    Busy(String),
    #[error("unknown action '{0}'")]
    UnknownSlot(String),
    #[error("invalid payload for action '{slot}': {reason}")]
    InvalidPayload { slot: String, reason: String },
    #[error("action '{0}' cannot be reset while in flight")]
    NotResettable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_classification() {
        assert_eq!(
            FailureCause::from(WriteError::UserDeclined),
            FailureCause::UserDeclined
        );
        assert_eq!(
            FailureCause::from(WriteError::Rejected("insufficient funds".into())),
            FailureCause::PreconditionNotMet(vec!["insufficient funds".into()])
        );
        assert_eq!(FailureCause::Timeout.label(), "timeout");
    }

    #[test]
    fn test_failure_cause_serializes_tagged() {
        let json = serde_json::to_value(FailureCause::PreconditionNotMet(vec![
            "pool is paused".into(),
        ]))
        .unwrap();
        assert_eq!(json["cause"], "precondition-not-met");
        assert_eq!(json["detail"][0], "pool is paused");
    }
}
