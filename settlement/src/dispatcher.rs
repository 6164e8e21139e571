//! Settlement dispatcher
//!
//! After a unit of paid work completes, two independent ledger writes run
//! concurrently: routing the payment through the agent's vault and
//! recording a job receipt in its registry. Each write resolves to an
//! [`Outcome`]; one failing never cancels or masks the other.

use crate::config::Config;
use crate::metrics::{SETTLEMENT_DURATION, SETTLEMENT_OPERATIONS_TOTAL};
use crate::signer::{sign_transaction, TransactionSigner};
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ledger_rpc::{LedgerClient, TxStatus};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;
use vault_ledger::pda;
use vault_ledger::tx::{self, Instruction, Message, ReceiveRevenueAccounts, RecordJobAccounts};
use vault_ledger::vault;
use vault_ledger::{Hash, Pubkey, RejectionCode, Signature};

/// Bytes of the payment reference stored in a receipt
pub const PAYMENT_REF_LEN: usize = 64;

/// One completed unit of paid work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRequest {
    /// Amount paid (token base units)
    pub amount: u64,
    /// Caller's job id, for correlation in logs
    pub job_id: String,
    /// Digest of the delivered artifact (first 32 bytes are kept)
    pub artifact_hash: Vec<u8>,
    /// Reference of the payment transaction
    pub payment_reference: String,
    /// Paying client; the signer when absent
    pub client: Option<Pubkey>,
}

/// Receipt bytes of a payment reference: base64-decoded when it decodes,
/// its UTF-8 bytes otherwise, then truncated or zero-padded to 64 bytes
pub fn payment_reference_bytes(reference: &str) -> [u8; PAYMENT_REF_LEN] {
    let bytes = BASE64
        .decode(reference)
        .unwrap_or_else(|_| reference.as_bytes().to_vec());
    let mut out = [0u8; PAYMENT_REF_LEN];
    let n = bytes.len().min(PAYMENT_REF_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Result of one settlement write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    /// Transaction executed
    Confirmed {
        /// Transaction reference
        signature: Signature,
    },
    /// Vault or registry does not exist yet; nothing was submitted
    NotProvisioned {
        /// What is missing
        reason: String,
    },
    /// Signer may not perform this write; nothing was submitted
    Unauthorized {
        /// Who was refused
        reason: String,
    },
    /// Rejected, failed on the ledger, expired or timed out
    Failed {
        /// Error text, with the ledger reason code when there is one
        reason: String,
    },
}

impl Outcome {
    /// Transaction reference of a confirmed write
    pub fn tx_reference(&self) -> Option<Signature> {
        match self {
            Outcome::Confirmed { signature } => Some(*signature),
            _ => None,
        }
    }

    /// Write was executed
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Outcome::Confirmed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Confirmed { .. } => "confirmed",
            Outcome::NotProvisioned { .. } => "not_provisioned",
            Outcome::Unauthorized { .. } => "unauthorized",
            Outcome::Failed { .. } => "failed",
        }
    }
}

/// Outcomes of both writes for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    /// Correlation id carried in the logs of both writes
    pub correlation_id: Uuid,
    /// Revenue routing
    pub revenue: Outcome,
    /// Job receipt
    pub receipt: Outcome,
}

/// Submits settlement writes signed by one operator (or job signer)
pub struct SettlementDispatcher {
    config: Config,
    client: Arc<dyn LedgerClient>,
    signer: Arc<dyn TransactionSigner>,
}

impl std::fmt::Debug for SettlementDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementDispatcher")
            .field("signer", &self.signer)
            .field("vault", &self.config.vault)
            .finish()
    }
}

impl SettlementDispatcher {
    /// Create dispatcher
    pub fn new(config: Config, client: Arc<dyn LedgerClient>, signer: Arc<dyn TransactionSigner>) -> Self {
        Self { config, client, signer }
    }

    /// Signing key
    pub fn signer(&self) -> Pubkey {
        self.signer.pubkey()
    }

    /// Vault this dispatcher settles against
    pub fn vault_address(&self) -> Result<Pubkey> {
        match self.config.vault {
            Some(vault) => Ok(vault),
            None => Ok(pda::vault_address(&self.config.vault_program, &self.signer.pubkey())?),
        }
    }

    /// Route revenue and record the job concurrently. Never fails: every
    /// error ends up in the corresponding outcome.
    pub async fn route_revenue_and_record_job(&self, request: &SettlementRequest) -> SettlementReport {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("settlement", %correlation_id, job_id = %request.job_id);

        let (revenue, receipt) = async {
            let outcomes = tokio::join!(
                self.bounded("route_revenue", self.route_revenue(request)),
                self.bounded("record_job", self.record_job(request)),
            );
            tracing::info!(
                revenue = outcomes.0.label(),
                receipt = outcomes.1.label(),
                "Settlement finished"
            );
            outcomes
        }
        .instrument(span)
        .await;

        SettlementReport {
            correlation_id,
            revenue,
            receipt,
        }
    }

    async fn bounded<F>(&self, operation: &'static str, write: F) -> Outcome
    where
        F: Future<Output = Result<Outcome>>,
    {
        let timer = SETTLEMENT_DURATION.with_label_values(&[operation]).start_timer();
        let limit = self.config.operation_timeout();

        let outcome = match tokio::time::timeout(limit, write).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Outcome::Failed { reason: e.to_string() },
            Err(_) => Outcome::Failed {
                reason: format!("{} timed out after {:?}", operation, limit),
            },
        };
        timer.observe_duration();
        SETTLEMENT_OPERATIONS_TOTAL
            .with_label_values(&[operation, outcome.label()])
            .inc();

        match &outcome {
            Outcome::Failed { reason } => tracing::warn!(operation, reason = %reason, "Settlement write failed"),
            Outcome::Confirmed { signature } => tracing::info!(operation, signature = %signature, "Settlement write confirmed"),
            other => tracing::info!(operation, outcome = ?other, "Settlement write skipped"),
        }
        outcome
    }

    /// Pay `request.amount` into the vault: the vault cut and the protocol
    /// cut leave the signer's token account, the rest stays with it
    pub async fn route_revenue(&self, request: &SettlementRequest) -> Result<Outcome> {
        if request.amount == 0 {
            return Err(vault_ledger::Error::from(RejectionCode::ZeroAmount).into());
        }
        let operator = self.signer.pubkey();
        let vault_address = self.vault_address()?;

        let vault = match self.client.get_vault(&vault_address).await? {
            Some(vault) => vault,
            None => {
                return Ok(Outcome::NotProvisioned {
                    reason: format!("vault {} is not initialized", vault_address),
                })
            }
        };
        if vault.operator != operator {
            return Ok(Outcome::Unauthorized {
                reason: format!("{} is not the operator of vault {}", operator, vault_address),
            });
        }

        vault::validate_fees(vault.agent_fee_bps, vault.protocol_fee_bps, self.config.min_protocol_fee_bps)?;
        let split = vault::revenue_split(request.amount, vault.agent_fee_bps, vault.protocol_fee_bps)?;
        let operator_token_account = pda::associated_token_address(&operator, &self.config.usdc_mint)?;

        tracing::debug!(
            vault = %vault_address,
            amount = request.amount,
            vault_cut = split.vault_cut,
            protocol_cut = split.protocol_cut,
            "Routing revenue"
        );

        let instruction = tx::receive_revenue(
            self.config.vault_program,
            &ReceiveRevenueAccounts {
                vault: vault_address,
                operator,
                vault_token_account: vault.vault_token_account,
                operator_token_account,
                protocol_treasury: vault.protocol_treasury,
            },
            request.amount,
        );
        self.submit(instruction).await
    }

    /// Create the `Active` receipt for this job at the registry's current
    /// job counter
    pub async fn record_job(&self, request: &SettlementRequest) -> Result<Outcome> {
        if request.amount == 0 {
            return Err(vault_ledger::Error::from(RejectionCode::ZeroAmount).into());
        }
        let signer = self.signer.pubkey();
        let vault_address = self.vault_address()?;
        let registry_address = pda::registry_address(&self.config.registry_program, &vault_address)?;

        let registry = match self.client.get_registry(&registry_address).await? {
            Some(registry) => registry,
            None => {
                return Ok(Outcome::NotProvisioned {
                    reason: format!("registry {} is not initialized", registry_address),
                })
            }
        };
        if !registry.can_record(&signer) {
            return Ok(Outcome::Unauthorized {
                reason: format!(
                    "{} is neither operator nor job signer of registry {}",
                    signer, registry_address
                ),
            });
        }

        let job_receipt =
            pda::job_receipt_address(&self.config.registry_program, &registry_address, registry.job_counter)?;
        tracing::debug!(
            registry = %registry_address,
            job_counter = registry.job_counter,
            receipt = %job_receipt,
            "Recording job"
        );

        let instruction = tx::record_job(
            self.config.registry_program,
            &RecordJobAccounts {
                registry: registry_address,
                job_receipt,
                signer,
                client: request.client.unwrap_or(signer),
            },
            Hash::from_prefix(&request.artifact_hash),
            request.amount,
            payment_reference_bytes(&request.payment_reference),
        );
        self.submit(instruction).await
    }

    async fn submit(&self, instruction: Instruction) -> Result<Outcome> {
        let recent = self.client.latest_blockhash().await?;
        let message = Message::new(&[instruction], &self.signer.pubkey(), recent.blockhash)?;
        let transaction = sign_transaction(self.signer.as_ref(), message).await?;
        let signature = self.client.send_transaction(&transaction).await?;
        tracing::debug!(signature = %signature, "Transaction submitted");

        self.await_confirmation(signature, recent.last_valid_block_height).await
    }

    /// Poll until the ledger executes the transaction or its blockhash
    /// expires. An expired transaction is reported, never resubmitted.
    async fn await_confirmation(&self, signature: Signature, last_valid_block_height: u64) -> Result<Outcome> {
        loop {
            match self.client.signature_status(&signature).await {
                Ok(TxStatus::Confirmed { slot }) => {
                    tracing::debug!(signature = %signature, slot, "Transaction confirmed");
                    return Ok(Outcome::Confirmed { signature });
                }
                Ok(TxStatus::Failed { reason, .. }) => return Ok(Outcome::Failed { reason }),
                Ok(TxStatus::Pending) => {
                    let height = self.client.block_height().await?;
                    if height > last_valid_block_height {
                        return Ok(Outcome::Failed {
                            reason: format!(
                                "transaction {} expired unconfirmed at block height {}",
                                signature, last_valid_block_height
                            ),
                        });
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(signature = %signature, error = %e, "Status poll failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.config.confirmation_poll()).await;
        }
    }
}
