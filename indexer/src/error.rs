//! Error types for the indexer

use thiserror::Error;

/// Result type for indexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Indexer errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger model error
    #[error(transparent)]
    Ledger(#[from] vault_ledger::Error),

    /// Ledger query failed
    #[error("Ledger query failed: {0}")]
    Rpc(#[from] ledger_rpc::Error),

    /// Snapshot blob store failure
    #[error("Blob store error: {0}")]
    BlobStore(String),

    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Actor mailbox or response channel closed
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Failures that leave state intact and resolve on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Rpc(e) => e.is_transient(),
            Error::BlobStore(_) | Error::Storage(_) | Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::BlobStore("disk full".into()).is_transient());
        assert!(Error::Rpc(ledger_rpc::Error::Timeout("slow".into())).is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
        assert!(!Error::from("other").is_transient());
    }
}
