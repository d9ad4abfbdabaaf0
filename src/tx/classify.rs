//! Attempt results and the error classification table
//!
//! Node error strings are matched in one place. Anything not matched is an
//! `UnknownError`, which is retried with backoff and never terminal.

use crate::chain::{Receipt, RpcFailure};

use lazy_static::lazy_static;
use regex::Regex;

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Confirmed(Receipt),
    RevertedOnChain(Receipt),
    NonceGap,
    Underpriced,
    InsufficientFunds,
    MempoolFull,
    EndpointDown,
    TimeoutPending,
    UnknownError(String),
}

impl AttemptResult {
    /// Stable label for logs, metrics and persisted counters
    pub fn class(&self) -> &'static str {
        match self {
            AttemptResult::Confirmed(_) => "confirmed",
            AttemptResult::RevertedOnChain(_) => "reverted_on_chain",
            AttemptResult::NonceGap => "nonce_gap",
            AttemptResult::Underpriced => "underpriced",
            AttemptResult::InsufficientFunds => "insufficient_funds",
            AttemptResult::MempoolFull => "mempool_full",
            AttemptResult::EndpointDown => "endpoint_down",
            AttemptResult::TimeoutPending => "timeout_pending",
            AttemptResult::UnknownError(_) => "unknown_error",
        }
    }

    /// Transport band: recovered by rotation, does not consume an attempt
    pub fn is_transport(&self) -> bool {
        matches!(self, AttemptResult::EndpointDown)
    }
}

lazy_static! {
    static ref CLASSIFIERS: Vec<(Regex, AttemptResult)> = vec![
        (
            Regex::new(r"(?i)insufficient funds").unwrap(),
            AttemptResult::InsufficientFunds,
        ),
        (
            Regex::new(r"(?i)nonce too (low|high)|invalid nonce|nonce mismatch").unwrap(),
            AttemptResult::NonceGap,
        ),
        (
            Regex::new(r"(?i)nonce has already been used").unwrap(),
            AttemptResult::NonceGap,
        ),
        (
            Regex::new(r"(?i)underpriced|replacement transaction|fee too low").unwrap(),
            AttemptResult::Underpriced,
        ),
        (
            Regex::new(r"(?i)max fee per gas less than block base fee").unwrap(),
            AttemptResult::Underpriced,
        ),
        (
            Regex::new(r"(?i)mempool is full|txpool is full|transaction pool is full").unwrap(),
            AttemptResult::MempoolFull,
        ),
        (
            Regex::new(r"(?i)rate limit|too many requests|\b429\b").unwrap(),
            AttemptResult::EndpointDown,
        ),
    ];

    static ref ALREADY_KNOWN: Regex =
        Regex::new(r"(?i)already known|known transaction|already imported").unwrap();
}

/// Map a failed RPC call to an attempt result
pub fn classify(failure: &RpcFailure) -> AttemptResult {
    match failure {
        RpcFailure::Transport(_) => AttemptResult::EndpointDown,
        RpcFailure::Rejected { message, .. } => classify_message(message),
    }
}

/// Map a node error message to an attempt result
pub fn classify_message(message: &str) -> AttemptResult {
    CLASSIFIERS
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, result)| result.clone())
        .unwrap_or_else(|| AttemptResult::UnknownError(message.to_string()))
}

/// The node already holds this exact transaction
pub fn is_already_known(failure: &RpcFailure) -> bool {
    match failure {
        RpcFailure::Rejected { message, .. } => ALREADY_KNOWN.is_match(message),
        RpcFailure::Transport(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(message: &str) -> RpcFailure {
        RpcFailure::Rejected {
            code: -32000,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_table() {
        let cases = [
            ("insufficient funds for gas * price + value", "insufficient_funds"),
            ("nonce too low: next nonce 12, tx nonce 11", "nonce_gap"),
            ("invalid nonce; got 3, expected 5", "nonce_gap"),
            ("replacement transaction underpriced", "underpriced"),
            ("transaction underpriced", "underpriced"),
            ("max fee per gas less than block base fee", "underpriced"),
            ("mempool is full", "mempool_full"),
            ("txpool is full", "mempool_full"),
            ("Too Many Requests", "endpoint_down"),
            ("daily rate limit exceeded", "endpoint_down"),
            ("execution reverted: not owner", "unknown_error"),
        ];
        for (message, class) in cases {
            assert_eq!(classify(&rejected(message)).class(), class, "{}", message);
        }
    }

    #[test]
    fn test_transport_is_endpoint_down() {
        let result = classify(&RpcFailure::Transport("error sending request".into()));
        assert_eq!(result, AttemptResult::EndpointDown);
        assert!(result.is_transport());
    }

    #[test]
    fn test_unknown_keeps_message() {
        match classify_message("something odd") {
            AttemptResult::UnknownError(message) => assert_eq!(message, "something odd"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_already_known() {
        assert!(is_already_known(&rejected("already known")));
        assert!(is_already_known(&rejected("ALREADY_EXISTS: known transaction: 0xab")));
        assert!(!is_already_known(&rejected("nonce too low")));
        assert!(!is_already_known(&RpcFailure::Transport("already known".into())));
    }
}
