//! Error types for the transaction driver

use thiserror::Error;

/// Main error type for the driver
///
/// Per-attempt RPC failures never surface here: they are classified into
/// attempt results and handled inside the driver.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("No wallets loaded: set the private key environment variable or provide a keys file")]
    NoWallets,

    #[error("No usable RPC endpoint for chain {chain_id}: {message}")]
    NoUsableEndpoints { chain_id: u64, message: String },

    #[error("Endpoint {url} reports chain id {actual}, expected {expected}")]
    ChainIdMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid intent: {0}")]
    Intent(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("State file error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Shutdown requested")]
    Cancelled,
}

impl DriverError {
    /// Errors that must halt the process with a non-zero exit
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::NoWallets
                | DriverError::NoUsableEndpoints { .. }
                | DriverError::Config(_)
        )
    }
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DriverError::NoWallets.is_fatal());
        assert!(DriverError::NoUsableEndpoints {
            chain_id: 1,
            message: "all mismatched".to_string()
        }
        .is_fatal());
        assert!(!DriverError::Cancelled.is_fatal());
    }

    #[test]
    fn test_no_wallets_message_is_human_readable() {
        let msg = DriverError::NoWallets.to_string();
        assert!(msg.starts_with("No wallets loaded"));
    }
}
