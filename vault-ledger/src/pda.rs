//! Program-derived addresses
//!
//! An address is `sha256(seeds ‖ bump ‖ program_id ‖ "ProgramDerivedAddress")`
//! for the highest bump whose digest is not a valid ed25519 point, so no
//! private key can exist for it.

use crate::types::Pubkey;
use crate::{Error, Result};
use curve25519_dalek::edwards::CompressedEdwardsY;
use lazy_static::lazy_static;
use sha2::{Digest, Sha256};

const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";
const MAX_SEED_LEN: usize = 32;

fn parse_program_id(id: &str) -> Pubkey {
    // Only called on the literals below
    id.parse().unwrap_or_default()
}

lazy_static! {
    /// SPL token program
    pub static ref TOKEN_PROGRAM_ID: Pubkey =
        parse_program_id("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
    /// Associated token account program
    pub static ref ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
        parse_program_id("ATokenGPvbdGVxr1b2hvZbsiqW95jmzN4yzZNzZ3vMoK");
    /// Default vault program deployment
    pub static ref DEFAULT_VAULT_PROGRAM_ID: Pubkey =
        parse_program_id("HY1b7thWZtAxj7thFw5zA3sHq2D8NXhDkYsNjck2r4HS");
    /// Default receipt registry deployment
    pub static ref DEFAULT_REGISTRY_PROGRAM_ID: Pubkey =
        parse_program_id("jks1tXZFTTnoBdVuFzvF5XA8i4S39RKcCRpL9puiuz9");
}

/// System program (all-zero key)
pub const SYSTEM_PROGRAM_ID: Pubkey = Pubkey::new([0u8; 32]);

fn is_on_curve(bytes: &[u8; 32]) -> bool {
    CompressedEdwardsY(*bytes).decompress().is_some()
}

/// Address for an explicit bump; `None` if the digest lands on the curve
pub fn create_program_address(seeds: &[&[u8]], program_id: &Pubkey) -> Result<Option<Pubkey>> {
    if let Some(seed) = seeds.iter().find(|s| s.len() > MAX_SEED_LEN) {
        return Err(Error::Decode(format!(
            "seed of {} bytes exceeds {}",
            seed.len(),
            MAX_SEED_LEN
        )));
    }

    let mut hasher = Sha256::new();
    for seed in seeds {
        hasher.update(seed);
    }
    hasher.update(program_id.as_bytes());
    hasher.update(PDA_MARKER);
    let digest: [u8; 32] = hasher.finalize().into();

    if is_on_curve(&digest) {
        return Ok(None);
    }
    Ok(Some(Pubkey::new(digest)))
}

/// Canonical address and bump for `seeds`
pub fn find_program_address(seeds: &[&[u8]], program_id: &Pubkey) -> Result<(Pubkey, u8)> {
    for bump in (0..=u8::MAX).rev() {
        let bump_seed = [bump];
        let mut with_bump: Vec<&[u8]> = seeds.to_vec();
        with_bump.push(&bump_seed);

        if let Some(address) = create_program_address(&with_bump, program_id)? {
            return Ok((address, bump));
        }
    }
    Err(Error::Decode("no off-curve bump found".to_string()))
}

/// Vault state: `["vault", operator]`
pub fn vault_address(program_id: &Pubkey, operator: &Pubkey) -> Result<Pubkey> {
    Ok(find_program_address(&[b"vault", operator.as_bytes()], program_id)?.0)
}

/// Share mint: `["shares", vault]`
pub fn share_mint_address(program_id: &Pubkey, vault: &Pubkey) -> Result<Pubkey> {
    Ok(find_program_address(&[b"shares", vault.as_bytes()], program_id)?.0)
}

/// Deposit record: `["deposit", vault, depositor]`
pub fn deposit_address(program_id: &Pubkey, vault: &Pubkey, depositor: &Pubkey) -> Result<Pubkey> {
    Ok(find_program_address(
        &[b"deposit", vault.as_bytes(), depositor.as_bytes()],
        program_id,
    )?
    .0)
}

/// Receipt registry: `["registry", vault]` under the registry program
pub fn registry_address(program_id: &Pubkey, vault: &Pubkey) -> Result<Pubkey> {
    Ok(find_program_address(&[b"registry", vault.as_bytes()], program_id)?.0)
}

/// Job receipt: `["job", registry, counter as u64 LE]`
pub fn job_receipt_address(program_id: &Pubkey, registry: &Pubkey, job_counter: u64) -> Result<Pubkey> {
    let counter = job_counter.to_le_bytes();
    Ok(find_program_address(&[b"job", registry.as_bytes(), &counter], program_id)?.0)
}

/// Associated token account of `wallet` for `mint`
pub fn associated_token_address(wallet: &Pubkey, mint: &Pubkey) -> Result<Pubkey> {
    Ok(find_program_address(
        &[wallet.as_bytes(), TOKEN_PROGRAM_ID.as_bytes(), mint.as_bytes()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )?
    .0)
}
