//! Core types for the ledger model
//!
//! All types are designed for:
//! - Bit-exact layouts matching the on-chain programs
//! - Base58 rendering of keys and signatures, as the ledger reports them
//! - Integer micro-unit amounts (no floating point)

use crate::codec::{discriminator, Reader, Writer};
use crate::{Error, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

macro_rules! base58_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// Ledger account address (ed25519 public key or program-derived address)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
    /// Wrap raw bytes
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Build from a slice; fails unless exactly 32 bytes
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Decode(format!("pubkey must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        let full = self.to_string();
        full.chars().take(8).collect()
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self)
    }
}

impl FromStr for Pubkey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::Decode(format!("invalid base58 pubkey '{}': {}", s, e)))?;
        Self::try_from_slice(&bytes)
    }
}

base58_serde!(Pubkey);

/// Transaction signature (ed25519, 64 bytes); doubles as the transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create from bytes
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Build from a slice; fails unless exactly 64 bytes
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| {
            Error::Decode(format!("signature must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Verify against a message and signer key
    pub fn verify(&self, message: &[u8], signer: &Pubkey) -> bool {
        use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

        let signature = DalekSignature::from_bytes(&self.0);
        let verifying_key = match VerifyingKey::from_bytes(signer.as_bytes()) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key.verify(message, &signature).is_ok()
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        self.to_string().chars().take(8).collect()
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.short())
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::Decode(format!("invalid base58 signature: {}", e)))?;
        Self::try_from_slice(&bytes)
    }
}

base58_serde!(Signature);

/// 32-byte hash (blockhashes, artifact digests)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Wrap raw bytes
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of arbitrary data
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Take the first 32 bytes of `data`, zero-padding short input
    pub fn from_prefix(data: &[u8]) -> Self {
        let mut out = [0u8; 32];
        let n = data.len().min(32);
        out[..n].copy_from_slice(&data[..n]);
        Self(out)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::Decode(format!("invalid base58 hash: {}", e)))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Decode(format!("hash must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }
}

base58_serde!(Hash);

/// Vault program state, one per agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultAccount {
    /// Operator (agent wallet); signs revenue, bond and pause instructions
    pub operator: Pubkey,
    /// Dispute arbitrator; the only key allowed to slash
    pub arbitrator: Pubkey,
    /// Token account receiving the protocol cut
    pub protocol_treasury: Pubkey,
    /// Deposit asset mint
    pub usdc_mint: Pubkey,
    /// Share mint (supply == total shares)
    pub share_mint: Pubkey,
    /// Vault token account (bond + depositor pool)
    pub vault_token_account: Pubkey,
    /// Operator's cut of revenue
    pub agent_fee_bps: u16,
    /// Protocol's cut of revenue
    pub protocol_fee_bps: u16,
    /// Gross revenue routed through the vault
    pub total_revenue: u64,
    /// Revenue-bearing jobs
    pub total_jobs: u64,
    /// First-loss capital posted by the operator
    pub operator_bond: u64,
    /// Sum of all slash totals
    pub total_slashed: u64,
    /// Number of slashes
    pub slash_event_count: u32,
    /// Hard deposit cap
    pub max_tvl_fixed: u64,
    /// Target depositor APY
    pub target_apy_bps: u16,
    /// Lending floor the target is measured against
    pub lending_floor_bps: u16,
    /// Epochs a deposit stays locked
    pub lockup_epochs: u8,
    /// Epoch length in seconds
    pub epoch_length_seconds: i64,
    /// Deposits and revenue disabled
    pub paused: bool,
    /// Highest NAV observed after revenue, scaled by `NAV_SCALE`
    pub nav_high_water_mark: u64,
    /// Unix timestamp of initialization
    pub created_at: i64,
    /// PDA bump
    pub bump: u8,
}

impl VaultAccount {
    /// Account name used for the layout discriminator
    pub const ACCOUNT_NAME: &'static str = "VaultState";

    /// Depositors' share of revenue: `10000 − agent − protocol`
    pub fn vault_fee_bps(&self) -> Result<u16> {
        crate::vault::vault_fee_bps(self.agent_fee_bps, self.protocol_fee_bps)
    }

    /// Serialize to the on-chain layout
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_discriminator(discriminator("account", Self::ACCOUNT_NAME));
        w.pubkey(&self.operator)
            .pubkey(&self.arbitrator)
            .pubkey(&self.protocol_treasury)
            .pubkey(&self.usdc_mint)
            .pubkey(&self.share_mint)
            .pubkey(&self.vault_token_account)
            .u16(self.agent_fee_bps)
            .u16(self.protocol_fee_bps)
            .u64(self.total_revenue)
            .u64(self.total_jobs)
            .u64(self.operator_bond)
            .u64(self.total_slashed)
            .u32(self.slash_event_count)
            .u64(self.max_tvl_fixed)
            .u16(self.target_apy_bps)
            .u16(self.lending_floor_bps)
            .u8(self.lockup_epochs)
            .i64(self.epoch_length_seconds)
            .bool(self.paused)
            .u64(self.nav_high_water_mark)
            .i64(self.created_at)
            .u8(self.bump);
        w.into_bytes()
    }

    /// Parse the on-chain layout
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.expect_discriminator(discriminator("account", Self::ACCOUNT_NAME))?;
        Ok(Self {
            operator: r.pubkey()?,
            arbitrator: r.pubkey()?,
            protocol_treasury: r.pubkey()?,
            usdc_mint: r.pubkey()?,
            share_mint: r.pubkey()?,
            vault_token_account: r.pubkey()?,
            agent_fee_bps: r.u16()?,
            protocol_fee_bps: r.u16()?,
            total_revenue: r.u64()?,
            total_jobs: r.u64()?,
            operator_bond: r.u64()?,
            total_slashed: r.u64()?,
            slash_event_count: r.u32()?,
            max_tvl_fixed: r.u64()?,
            target_apy_bps: r.u16()?,
            lending_floor_bps: r.u16()?,
            lockup_epochs: r.u8()?,
            epoch_length_seconds: r.i64()?,
            paused: r.bool()?,
            nav_high_water_mark: r.u64()?,
            created_at: r.i64()?,
            bump: r.u8()?,
        })
    }
}

/// Per-depositor bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRecord {
    /// Vault the record belongs to
    pub vault: Pubkey,
    /// Depositor wallet
    pub depositor: Pubkey,
    /// Timestamp of the most recent deposit; lockup runs from here
    pub last_deposit_epoch: i64,
    /// Cumulative principal deposited
    pub total_deposited: u64,
}

impl DepositRecord {
    /// Fresh record with no deposits
    pub fn new(vault: Pubkey, depositor: Pubkey) -> Self {
        Self {
            vault,
            depositor,
            last_deposit_epoch: 0,
            total_deposited: 0,
        }
    }

    /// Register a deposit. Any deposit re-arms the lockup for the whole balance.
    pub fn record_deposit(&mut self, amount: u64, now: i64) -> Result<()> {
        self.total_deposited = self
            .total_deposited
            .checked_add(amount)
            .ok_or(crate::RejectionCode::ArithmeticOverflow)?;
        self.last_deposit_epoch = now;
        Ok(())
    }

    /// First timestamp at which withdrawal is allowed
    pub fn unlocks_at(&self, vault: &VaultAccount) -> i64 {
        let lockup = (vault.lockup_epochs as i64).saturating_mul(vault.epoch_length_seconds);
        self.last_deposit_epoch.saturating_add(lockup)
    }
}

/// Receipt registry state, one per vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAccount {
    /// Vault this registry records jobs for
    pub vault: Pubkey,
    /// Vault operator
    pub operator: Pubkey,
    /// Delegated key allowed to record jobs besides the operator
    pub job_signer: Option<Pubkey>,
    /// Authority resolving challenges
    pub protocol_authority: Pubkey,
    /// Next job id
    pub job_counter: u64,
    /// Seconds after creation during which a job can be challenged
    pub challenge_window: i64,
    /// Challenges filed
    pub total_challenged: u64,
    /// Challenges resolved against the agent
    pub total_resolved_against: u64,
    /// PDA bump
    pub bump: u8,
}

impl RegistryAccount {
    /// Account name used for the layout discriminator
    pub const ACCOUNT_NAME: &'static str = "RegistryState";

    /// Whether `signer` may record jobs
    pub fn can_record(&self, signer: &Pubkey) -> bool {
        *signer == self.operator || self.job_signer.as_ref() == Some(signer)
    }

    /// Serialize to the on-chain layout
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_discriminator(discriminator("account", Self::ACCOUNT_NAME));
        w.pubkey(&self.vault)
            .pubkey(&self.operator)
            .option_pubkey(self.job_signer.as_ref())
            .pubkey(&self.protocol_authority)
            .u64(self.job_counter)
            .i64(self.challenge_window)
            .u64(self.total_challenged)
            .u64(self.total_resolved_against)
            .u8(self.bump);
        w.into_bytes()
    }

    /// Parse the on-chain layout
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.expect_discriminator(discriminator("account", Self::ACCOUNT_NAME))?;
        Ok(Self {
            vault: r.pubkey()?,
            operator: r.pubkey()?,
            job_signer: r.option_pubkey()?,
            protocol_authority: r.pubkey()?,
            job_counter: r.u64()?,
            challenge_window: r.i64()?,
            total_challenged: r.u64()?,
            total_resolved_against: r.u64()?,
            bump: r.u8()?,
        })
    }
}

/// Job receipt lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum JobStatus {
    /// Recorded, challengeable
    Active = 0,
    /// Window elapsed unchallenged (terminal)
    Finalized = 1,
    /// Under dispute
    Challenged = 2,
    /// Dispute resolved for the agent (terminal)
    Resolved = 3,
    /// Dispute resolved against the agent (terminal)
    Rejected = 4,
}

impl JobStatus {
    /// Lowercase label used in stats
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Finalized => "finalized",
            JobStatus::Challenged => "challenged",
            JobStatus::Resolved => "resolved",
            JobStatus::Rejected => "rejected",
        }
    }

    /// No further transitions possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finalized | JobStatus::Resolved | JobStatus::Rejected
        )
    }

    /// Decode the borsh enum index
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(JobStatus::Active),
            1 => Ok(JobStatus::Finalized),
            2 => Ok(JobStatus::Challenged),
            3 => Ok(JobStatus::Resolved),
            4 => Ok(JobStatus::Rejected),
            other => Err(Error::Decode(format!("invalid job status {}", other))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a settled job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReceipt {
    /// Owning registry
    pub registry: Pubkey,
    /// Monotonic id within the registry
    pub job_id: u64,
    /// Paying client
    pub client: Pubkey,
    /// SHA-256 of the delivered artifact
    pub artifact_hash: Hash,
    /// Amount paid for the job
    pub payment_amount: u64,
    /// Reference of the payment transaction
    #[serde(with = "payment_ref_serde")]
    pub payment_tx_ref: [u8; 64],
    /// Lifecycle state
    pub status: JobStatus,
    /// Unix timestamp of recording
    pub created_at: i64,
    /// Unix timestamp of challenge, 0 if none
    pub challenged_at: i64,
    /// Unix timestamp of resolution, 0 if none
    pub resolved_at: i64,
    /// Who challenged (default key if none)
    pub challenger: Pubkey,
    /// Client acknowledged the receipt
    pub client_verified: bool,
}

mod payment_ref_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom("payment reference must be 64 bytes"))
    }
}
