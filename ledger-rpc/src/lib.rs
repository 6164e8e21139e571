//! Ledger query interface
//!
//! Point reads of vault and registry state, paginated signature history,
//! per-transaction logs, live log subscription and transaction submission.
//!
//! # Implementations
//!
//! - [`RpcLedgerClient`]: JSON-RPC over HTTP; live logs by polling history
//! - [`SimulatedLedger`]: in-process ledger applying the vault and registry
//!   rules, used by integration tests and local runs

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod client;
pub mod error;
pub mod rpc;
pub mod simulator;

// Re-exports
pub use client::{
    LedgerClient, LogNotification, LogStream, RecentBlockhash, SignatureInfo, SignatureQuery,
    TransactionLogs, TxStatus,
};
pub use error::{Error, Result};
pub use rpc::{RpcClientConfig, RpcLedgerClient};
pub use simulator::{SimulatedLedger, VaultSetup};
