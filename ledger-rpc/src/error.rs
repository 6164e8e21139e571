//! Error types for ledger access

use thiserror::Error;

/// Result type for ledger access
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger access errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger model error (decode failure, program rejection)
    #[error(transparent)]
    Ledger(#[from] vault_ledger::Error),

    /// JSON-RPC error object returned by the node
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
    },

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Subscription could not be established or was dropped
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Submission refused before execution (bad signature, unknown blockhash)
    #[error("Transaction rejected: {0}")]
    TransactionRejected(String),

    /// Node did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Failures worth retrying later; the rest are permanent for the request
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::Subscription(_) | Error::Timeout(_) => true,
            // Server-side and rate-limit errors
            Error::Rpc { code, .. } => *code <= -32000 || *code == 429,
            _ => false,
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_ledger::RejectionCode;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("getTransaction".into()).is_transient());
        assert!(Error::Rpc {
            code: -32005,
            message: "Node is behind".into()
        }
        .is_transient());
        assert!(!Error::Rpc {
            code: -32602,
            message: "Invalid params".into()
        }
        .is_transient());
        assert!(!Error::from(vault_ledger::Error::from(RejectionCode::VaultPaused)).is_transient());
    }
}
