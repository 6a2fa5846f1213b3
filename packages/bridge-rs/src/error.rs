//! Error taxonomy for relay operations
//!
//! Every failure produced by the library falls into one of the classes below.
//! Callers decide what to do from [`RelayError::class`] alone:
//!
//! - `StaleState` - the remote side is already at or past what we tried to
//!   apply. Treated as a successful no-op.
//! - `MissingDependency` - committee/authority data is not available yet.
//!   Retried with backoff.
//! - `InconsistentRead` - two reads that must agree (same block) do not.
//!   The cycle is failed; nothing is submitted.
//! - `ProofRejected` - the destination contract rejected a proof. Surfaced to
//!   the operator, never retried automatically.
//! - `TransportFailure` - RPC/network trouble. Retried with bounded backoff.

use std::fmt;

use thiserror::Error;

/// Errors produced while building or submitting relay payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("stale state: {0}")]
    StaleState(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("inconsistent read: {0}")]
    InconsistentRead(String),

    #[error("proof rejected: {0}")]
    ProofRejected(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result alias used throughout the library
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// What a caller should do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing to do, count it as success
    NoOp,
    /// Retry after a backoff (bounded)
    Retryable,
    /// Abort the cycle and report
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::NoOp => "noop",
            ErrorClass::Retryable => "retryable",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::StaleState(_) => ErrorClass::NoOp,
            RelayError::MissingDependency(_) | RelayError::TransportFailure(_) => {
                ErrorClass::Retryable
            }
            RelayError::InconsistentRead(_)
            | RelayError::ProofRejected(_)
            | RelayError::InvalidInput(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.class() == ErrorClass::NoOp
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::StaleState(_) => "stale_state",
            RelayError::MissingDependency(_) => "missing_dependency",
            RelayError::InconsistentRead(_) => "inconsistent_read",
            RelayError::ProofRejected(_) => "proof_rejected",
            RelayError::TransportFailure(_) => "transport_failure",
            RelayError::InvalidInput(_) => "invalid_input",
        }
    }

    pub fn transport(err: impl fmt::Display) -> Self {
        RelayError::TransportFailure(err.to_string())
    }

    /// Classify an RPC or revert message returned by a node.
    ///
    /// The JSON-RPC error code, when the message carries one, is parsed out
    /// and handed to [`RelayError::from_rpc_error`].
    pub fn from_rpc_message(message: &str) -> Self {
        Self::from_rpc_error(rpc_error_code(message), message)
    }

    /// Classify a node error from its JSON-RPC code and message.
    ///
    /// Reverts (code 3, or an "execution reverted" message) are decided on
    /// the revert reason alone: "already ..." and "!new" mean someone else
    /// applied the payload first, anything else is a rejection. Revert data
    /// is never matched, so hex payloads cannot look like transport errors.
    /// Account-nonce races ("nonce too low") are retried, not skipped.
    pub fn from_rpc_error(code: Option<i64>, message: &str) -> Self {
        let lower = message.to_lowercase();

        if code == Some(REVERT_ERROR_CODE) || lower.contains("reverted") {
            let reason = revert_reason(&lower);
            if is_stale_reason(reason) {
                return RelayError::StaleState(message.to_string());
            }
            return RelayError::ProofRejected(message.to_string());
        }

        if lower.contains("nonce too low")
            || lower.contains("replacement transaction underpriced")
            || lower.contains("already known")
        {
            return RelayError::TransportFailure(message.to_string());
        }

        if is_stale_reason(&lower) {
            return RelayError::StaleState(message.to_string());
        }

        if lower.contains("invalid proof")
            || lower.contains("!proof")
            || lower.contains("invalid signature")
            || lower.contains("out of gas")
        {
            return RelayError::ProofRejected(message.to_string());
        }

        RelayError::TransportFailure(message.to_string())
    }
}

/// JSON-RPC code nodes return for a reverted call or gas estimate
pub const REVERT_ERROR_CODE: i64 = 3;

fn is_stale_reason(reason: &str) -> bool {
    reason.contains("already") || reason.contains("!new") || reason.contains("stale")
}

/// Text after "reverted", cut before any `data:` field
fn revert_reason(lower: &str) -> &str {
    let reason = lower
        .find("reverted")
        .map(|at| &lower[at + "reverted".len()..])
        .unwrap_or(lower);
    match reason.find("data:") {
        Some(at) => &reason[..at],
        None => reason,
    }
}

/// First `error <code>:` or `error code <code>:` in a node message
fn rpc_error_code(message: &str) -> Option<i64> {
    let lower = message.to_lowercase();
    lower.match_indices("error ").find_map(|(at, pat)| {
        let rest = &lower[at + pat.len()..];
        let rest = rest.strip_prefix("code ").unwrap_or(rest);
        let (number, _) = rest.split_once(':')?;
        number.trim().parse().ok()
    })
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::TransportFailure(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::InvalidInput(format!("json: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(RelayError::StaleState("x".into()).class(), ErrorClass::NoOp);
        assert_eq!(
            RelayError::MissingDependency("x".into()).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            RelayError::TransportFailure("x".into()).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            RelayError::InconsistentRead("x".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(RelayError::ProofRejected("x".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_rpc_message_classification() {
        assert!(matches!(
            RelayError::from_rpc_message("execution reverted: !new"),
            RelayError::StaleState(_)
        ));
        assert!(matches!(
            RelayError::from_rpc_message("Lane: message already delivered"),
            RelayError::StaleState(_)
        ));
        assert!(matches!(
            RelayError::from_rpc_message("connection refused"),
            RelayError::TransportFailure(_)
        ));
        assert!(matches!(
            RelayError::from_rpc_message("execution reverted: !proof"),
            RelayError::ProofRejected(_)
        ));
        assert!(matches!(
            RelayError::from_rpc_message("something odd"),
            RelayError::TransportFailure(_)
        ));
    }

    #[test]
    fn test_revert_data_does_not_look_like_transport() {
        let message = "server returned an error response: error code 3: execution reverted: \
                       !proof, data: \"0x08c379a0000000000000000000000000000000000000000000000000\
                       0000000000000020000000000000000000000000000000000000000000000000000000000\
                       000000006502170726f6f66\"";
        let err = RelayError::from_rpc_message(message);
        assert!(matches!(err, RelayError::ProofRejected(_)));
        assert_eq!(err.class(), ErrorClass::Fatal);

        // Reason text mentioning network words is still a revert
        let err = RelayError::from_rpc_message("execution reverted: network mismatch");
        assert!(matches!(err, RelayError::ProofRejected(_)));
    }

    #[test]
    fn test_revert_code_without_reverted_text() {
        let err = RelayError::from_rpc_error(Some(REVERT_ERROR_CODE), "Lane: connection id 502");
        assert!(matches!(err, RelayError::ProofRejected(_)));

        let err = RelayError::from_rpc_message("eth_call error 3: !new");
        assert!(matches!(err, RelayError::StaleState(_)));
    }

    #[test]
    fn test_account_nonce_race_is_retried() {
        let err = RelayError::from_rpc_message("eth_sendRawTransaction error -32000: nonce too low");
        assert!(matches!(err, RelayError::TransportFailure(_)));
        assert_eq!(err.class(), ErrorClass::Retryable);

        let err = RelayError::from_rpc_message("error code -32000: already known");
        assert_eq!(err.class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_rpc_error_code_parsing() {
        assert_eq!(rpc_error_code("error code 3: execution reverted"), Some(3));
        assert_eq!(rpc_error_code("eth_getProof error -32000: missing trie node"), Some(-32000));
        assert_eq!(rpc_error_code("connection refused"), None);
        assert_eq!(rpc_error_code("decode error at byte 3"), None);
    }
}
