//! The `LedgerClient` trait and the records it returns

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use vault_ledger::tx::Transaction;
use vault_ledger::{Hash, Pubkey, RegistryAccount, Signature, VaultAccount};

/// Offset of the `amount` field in an SPL token account
const TOKEN_AMOUNT_OFFSET: usize = 64;

/// Pagination of `get_signatures`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureQuery {
    /// Start strictly before this signature (newest-first order)
    pub before: Option<Signature>,
    /// Stop at this signature, exclusive
    pub until: Option<Signature>,
    /// Page size
    pub limit: usize,
}

/// One entry of a program's signature history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    /// Transaction signature
    pub signature: Signature,
    /// Slot the transaction landed in
    pub slot: u64,
    /// Execution error, if the transaction failed
    pub err: Option<String>,
    /// Unix timestamp of the block, when known
    pub block_time: Option<i64>,
}

/// Logs of one executed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLogs {
    /// Transaction signature
    pub signature: Signature,
    /// Slot the transaction landed in
    pub slot: u64,
    /// Unix timestamp of the block, when known
    pub block_time: Option<i64>,
    /// Execution error, if the transaction failed
    pub err: Option<String>,
    /// Program log lines
    pub logs: Vec<String>,
}

/// Item of a live log subscription
pub type LogNotification = TransactionLogs;

/// Live log subscription
pub type LogStream = BoxStream<'static, LogNotification>;

/// Blockhash to sign against and the height after which it expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentBlockhash {
    /// Blockhash
    pub blockhash: Hash,
    /// Last block height at which a transaction using it can land
    pub last_valid_block_height: u64,
}

/// Status of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TxStatus {
    /// Not seen by the ledger (yet)
    Pending,
    /// Executed successfully
    Confirmed {
        /// Slot of execution
        slot: u64,
    },
    /// Executed and failed
    Failed {
        /// Slot of execution
        slot: u64,
        /// Execution error
        reason: String,
    },
}

/// Read token amount from raw SPL token account data
pub fn token_amount(data: &[u8]) -> Option<u64> {
    let bytes = data.get(TOKEN_AMOUNT_OFFSET..TOKEN_AMOUNT_OFFSET + 8)?;
    let mut amount = [0u8; 8];
    amount.copy_from_slice(bytes);
    Some(u64::from_le_bytes(amount))
}

/// Ledger query and submission interface
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Raw account data; `None` if the account does not exist
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>>;

    /// Paginated signature history of a program, newest first
    async fn get_signatures(&self, program: &Pubkey, query: SignatureQuery) -> Result<Vec<SignatureInfo>>;

    /// Logs of one transaction; `None` if unknown
    async fn get_transaction_logs(&self, signature: &Signature) -> Result<Option<TransactionLogs>>;

    /// Live logs of transactions invoking `program`
    async fn subscribe_logs(&self, program: &Pubkey) -> Result<LogStream>;

    /// Blockhash to sign against
    async fn latest_blockhash(&self) -> Result<RecentBlockhash>;

    /// Current block height
    async fn block_height(&self) -> Result<u64>;

    /// Submit a signed transaction; returns its signature
    async fn send_transaction(&self, tx: &Transaction) -> Result<Signature>;

    /// Status of a submitted transaction
    async fn signature_status(&self, signature: &Signature) -> Result<TxStatus>;

    /// Vault state; `None` until the vault is provisioned
    async fn get_vault(&self, address: &Pubkey) -> Result<Option<VaultAccount>> {
        match self.get_account_data(address).await? {
            Some(data) => Ok(Some(VaultAccount::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Registry state; `None` until the registry is provisioned
    async fn get_registry(&self, address: &Pubkey) -> Result<Option<RegistryAccount>> {
        match self.get_account_data(address).await? {
            Some(data) => Ok(Some(RegistryAccount::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Token account balance; `None` if the account does not exist
    async fn get_token_balance(&self, token_account: &Pubkey) -> Result<Option<u64>> {
        match self.get_account_data(token_account).await? {
            Some(data) => Ok(token_amount(&data)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_amount_offset() {
        let mut data = vec![0u8; 165];
        data[64..72].copy_from_slice(&42_000_000u64.to_le_bytes());
        assert_eq!(token_amount(&data), Some(42_000_000));
        assert_eq!(token_amount(&data[..70]), None);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(TxStatus::Confirmed { slot: 7 }).unwrap();
        assert_eq!(json["status"], "confirmed");
        assert_eq!(json["slot"], 7);
    }
}
