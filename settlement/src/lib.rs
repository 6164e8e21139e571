//! Settlement Dispatcher
//!
//! Turns a completed unit of paid work into two ledger writes, submitted
//! concurrently and reported independently:
//!
//! 1. **Route revenue**: the payment flows through the agent's vault, which
//!    keeps its share and forwards the protocol fee to the treasury
//! 2. **Record job**: an `Active` receipt is created in the vault's registry
//!    at the current job counter
//!
//! Writes are signed by a [`TransactionSigner`]: a local ed25519 key or a
//! remote signing service whose signatures are verified locally before
//! submission.
//!
//! # Example
//!
//! ```no_run
//! use settlement::{resolve_signer, Config, SettlementDispatcher, SettlementRequest};
//! use ledger_rpc::{RpcClientConfig, RpcLedgerClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let config = Config::from_env()?;
//!     let signer = resolve_signer(&config.signer).await?;
//!     let client = Arc::new(RpcLedgerClient::new(RpcClientConfig::default())?);
//!     let dispatcher = SettlementDispatcher::new(config, client, signer);
//!
//!     let report = dispatcher
//!         .route_revenue_and_record_job(&SettlementRequest {
//!             amount: 1_000_000,
//!             job_id: "job-1".to_string(),
//!             artifact_hash: vec![0u8; 32],
//!             payment_reference: "payment-1".to_string(),
//!             client: None,
//!         })
//!         .await;
//!     println!("revenue: {:?}, receipt: {:?}", report.revenue, report.receipt);
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod signer;

// Re-exports
pub use config::{Config, SignerConfig};
pub use dispatcher::{
    payment_reference_bytes, Outcome, SettlementDispatcher, SettlementReport, SettlementRequest,
};
pub use error::{Error, Result};
pub use signer::{
    resolve_signer, sign_transaction, HttpSigningService, LocalSigner, RemoteSigner, SigningService,
    TransactionSigner,
};
