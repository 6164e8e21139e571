//! Job receipt lifecycle
//!
//! ```text
//! Active --challenge--> Challenged --resolve_for_agent-----> Resolved
//!    |                       \------resolve_against_agent--> Rejected
//!    \--finalize--> Finalized
//! ```
//!
//! `verify` is an orthogonal client acknowledgment, independent of status.

use crate::types::{Hash, JobReceipt, JobStatus, Pubkey, RegistryAccount};
use crate::{RejectionCode, Result};

fn window_end(registry: &RegistryAccount, receipt: &JobReceipt) -> Result<i64> {
    receipt
        .created_at
        .checked_add(registry.challenge_window)
        .ok_or_else(|| RejectionCode::ArithmeticOverflow.into())
}

/// Arguments of `record_job`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Paying client
    pub client: Pubkey,
    /// Artifact digest
    pub artifact_hash: Hash,
    /// Amount paid
    pub payment_amount: u64,
    /// Payment transaction reference
    pub payment_tx_ref: [u8; 64],
}

/// Create the next receipt and advance the registry counter
pub fn record_job(
    registry: &mut RegistryAccount,
    registry_address: Pubkey,
    signer: &Pubkey,
    job: NewJob,
    now: i64,
) -> Result<JobReceipt> {
    if !registry.can_record(signer) {
        return Err(RejectionCode::Unauthorized.into());
    }
    let next = registry
        .job_counter
        .checked_add(1)
        .ok_or(RejectionCode::ArithmeticOverflow)?;

    let receipt = JobReceipt {
        registry: registry_address,
        job_id: registry.job_counter,
        client: job.client,
        artifact_hash: job.artifact_hash,
        payment_amount: job.payment_amount,
        payment_tx_ref: job.payment_tx_ref,
        status: JobStatus::Active,
        created_at: now,
        challenged_at: 0,
        resolved_at: 0,
        challenger: Pubkey::default(),
        client_verified: false,
    };
    registry.job_counter = next;
    Ok(receipt)
}

/// The paying client disputes an active receipt within the window
pub fn challenge(
    registry: &mut RegistryAccount,
    receipt: &mut JobReceipt,
    challenger: &Pubkey,
    now: i64,
) -> Result<()> {
    if receipt.client != *challenger {
        return Err(RejectionCode::Unauthorized.into());
    }
    if receipt.status != JobStatus::Active {
        return Err(RejectionCode::JobNotActive.into());
    }
    if now > window_end(registry, receipt)? {
        return Err(RejectionCode::ChallengeWindowExpired.into());
    }
    let total_challenged = registry
        .total_challenged
        .checked_add(1)
        .ok_or(RejectionCode::ArithmeticOverflow)?;

    receipt.status = JobStatus::Challenged;
    receipt.challenged_at = now;
    receipt.challenger = *challenger;
    registry.total_challenged = total_challenged;
    Ok(())
}

/// Close an unchallenged receipt once its window has elapsed
pub fn finalize(registry: &RegistryAccount, receipt: &mut JobReceipt, now: i64) -> Result<()> {
    if receipt.status != JobStatus::Active {
        return Err(RejectionCode::JobNotActive.into());
    }
    if now <= window_end(registry, receipt)? {
        return Err(RejectionCode::ChallengeWindowActive.into());
    }
    receipt.status = JobStatus::Finalized;
    Ok(())
}

fn require_authority(registry: &RegistryAccount, authority: &Pubkey) -> Result<()> {
    if registry.protocol_authority != *authority {
        return Err(RejectionCode::Unauthorized.into());
    }
    Ok(())
}

/// Dispute closed in the agent's favour
pub fn resolve_for_agent(
    registry: &RegistryAccount,
    receipt: &mut JobReceipt,
    authority: &Pubkey,
    now: i64,
) -> Result<()> {
    require_authority(registry, authority)?;
    if receipt.status != JobStatus::Challenged {
        return Err(RejectionCode::JobNotChallenged.into());
    }
    receipt.status = JobStatus::Resolved;
    receipt.resolved_at = now;
    Ok(())
}

/// Dispute closed against the agent; slashing is a separate instruction
pub fn resolve_against_agent(
    registry: &mut RegistryAccount,
    receipt: &mut JobReceipt,
    authority: &Pubkey,
    now: i64,
) -> Result<()> {
    require_authority(registry, authority)?;
    if receipt.status != JobStatus::Challenged {
        return Err(RejectionCode::JobNotChallenged.into());
    }
    let resolved_against = registry
        .total_resolved_against
        .checked_add(1)
        .ok_or(RejectionCode::ArithmeticOverflow)?;

    receipt.status = JobStatus::Rejected;
    receipt.resolved_at = now;
    registry.total_resolved_against = resolved_against;
    Ok(())
}

/// Client acknowledges the receipt; settable once
pub fn verify(receipt: &mut JobReceipt, client: &Pubkey) -> Result<()> {
    if receipt.client != *client {
        return Err(RejectionCode::Unauthorized.into());
    }
    if receipt.client_verified {
        return Err(RejectionCode::AlreadyVerified.into());
    }
    receipt.client_verified = true;
    Ok(())
}
