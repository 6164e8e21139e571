//! Error types for settlement

use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger model error (validation, rejection, decode)
    #[error(transparent)]
    Ledger(#[from] vault_ledger::Error),

    /// Ledger query or submission failed
    #[error("Ledger client error: {0}")]
    Rpc(#[from] ledger_rpc::Error),

    /// Signer could not produce a signature
    #[error("Signer error: {0}")]
    Signer(String),

    /// Remote signature did not verify against the service's public key
    #[error("Remote signature failed local verification")]
    RemoteSignatureInvalid,

    /// Signing service transport failure
    #[error("Signing service error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
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
