//! Error types for the ledger model

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for ledger model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger model errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The ledger programs refuse the operation with this reason code
    #[error("Ledger rejected operation: {0}")]
    Rejected(RejectionCode),

    /// Malformed identifier, account or log payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Signer is not authorized for the requested instruction
    #[error("Unauthorized signer: {0}")]
    UnauthorizedSigner(String),
}

impl Error {
    /// Reason code, when the error is a ledger rejection
    pub fn rejection(&self) -> Option<RejectionCode> {
        match self {
            Error::Rejected(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<RejectionCode> for Error {
    fn from(code: RejectionCode) -> Self {
        Error::Rejected(code)
    }
}

/// Reason codes raised by the vault and registry programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionCode {
    /// Fee bps exceed the denominator or undercut the platform minimum
    InvalidFees,
    /// Intermediate value does not fit the account field
    ArithmeticOverflow,
    /// Amount must be greater than zero
    ZeroAmount,
    /// Deposit would mint zero shares
    ZeroShares,
    /// Vault is paused
    VaultPaused,
    /// Operator bond is below the required minimum
    InsufficientBond,
    /// Deposit would push assets past the effective TVL cap
    TvlCapExceeded,
    /// Depositor lockup has not elapsed
    LockupNotExpired,
    /// Result is below the caller's minimum
    SlippageExceeded,
    /// Depositor pool cannot cover the request
    InsufficientVaultBalance,
    /// Payer token account cannot cover the transfer
    InsufficientFunds,
    /// Signer lacks the role the instruction requires
    Unauthorized,
    /// Challenge submitted after the window closed
    ChallengeWindowExpired,
    /// Finalization attempted while the window is open
    ChallengeWindowActive,
    /// Receipt is not in the Active state
    JobNotActive,
    /// Receipt is not in the Challenged state
    JobNotChallenged,
    /// Client already acknowledged the receipt
    AlreadyVerified,
}

impl RejectionCode {
    /// Bad caller input, rejected before any state mutation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RejectionCode::ZeroAmount | RejectionCode::InvalidFees | RejectionCode::ArithmeticOverflow
        )
    }

    /// Stable code name, as the programs report it
    pub fn name(&self) -> &'static str {
        match self {
            RejectionCode::InvalidFees => "InvalidFees",
            RejectionCode::ArithmeticOverflow => "ArithmeticOverflow",
            RejectionCode::ZeroAmount => "ZeroAmount",
            RejectionCode::ZeroShares => "ZeroShares",
            RejectionCode::VaultPaused => "VaultPaused",
            RejectionCode::InsufficientBond => "InsufficientBond",
            RejectionCode::TvlCapExceeded => "TVLCapExceeded",
            RejectionCode::LockupNotExpired => "LockupNotExpired",
            RejectionCode::SlippageExceeded => "SlippageExceeded",
            RejectionCode::InsufficientVaultBalance => "InsufficientVaultBalance",
            RejectionCode::InsufficientFunds => "InsufficientFunds",
            RejectionCode::Unauthorized => "Unauthorized",
            RejectionCode::ChallengeWindowExpired => "ChallengeWindowExpired",
            RejectionCode::ChallengeWindowActive => "ChallengeWindowActive",
            RejectionCode::JobNotActive => "JobNotActive",
            RejectionCode::JobNotChallenged => "JobNotChallenged",
            RejectionCode::AlreadyVerified => "AlreadyVerified",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
