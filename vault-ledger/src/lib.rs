//! Agent Vault Ledger Model
//!
//! Mirrors the accounting of the on-chain vault and receipt-registry
//! programs so that off-chain components compute exactly what the ledger
//! computes.
//!
//! # Architecture
//!
//! - **Pure functions**: every operation takes account state by reference and
//!   returns an outcome; nothing here performs I/O
//! - **Exact arithmetic**: `u128` intermediates with floor division, matching
//!   the programs bit-for-bit
//! - **Closed event set**: ledger logs decode once into [`LedgerEvent`]
//! - **Wire codecs**: account layouts, event logs and transactions
//!
//! # Invariants
//!
//! - NAV conservation: deposits and withdrawals never move NAV beyond rounding
//! - First loss: a slash drains the operator bond before depositor capital
//! - Split exactness: `client + arbitrator + protocol == 2 × job payment`
//! - Fees: `agent_fee_bps + protocol_fee_bps <= 10_000`

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod codec;
pub mod error;
pub mod events;
pub mod pda;
pub mod receipt;
pub mod tx;
pub mod types;
pub mod vault;

// Re-exports
pub use error::{Error, RejectionCode, Result};
pub use events::LedgerEvent;
pub use types::{
    DepositRecord, Hash, JobReceipt, JobStatus, Pubkey, RegistryAccount, Signature, VaultAccount,
};
pub use vault::PoolState;
