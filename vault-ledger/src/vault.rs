//! Vault accounting: share math, TVL cap, revenue routing and slashing
//!
//! Every function here computes what the vault program computes, with `u128`
//! intermediates and floor division. Mutating operations validate first and
//! only touch the account once every check has passed.

use crate::types::{DepositRecord, Pubkey, VaultAccount};
use crate::{RejectionCode, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Virtual share offset (inflation-attack protection)
pub const VIRTUAL_SHARES: u64 = 1_000_000;
/// Virtual asset offset
pub const VIRTUAL_ASSETS: u64 = 1_000_000;
/// Bond required before deposits are accepted (100 USDC)
pub const MIN_OPERATOR_BOND: u64 = 100_000_000;
/// A slash costs this multiple of the job payment
pub const SLASH_MULTIPLIER: u64 = 2;
/// Basis-point denominator
pub const BPS_DENOMINATOR: u64 = 10_000;
/// Client's share of a slash
pub const CLIENT_SHARE_BPS: u64 = 7_500;
/// Arbitrator's share of a slash
pub const ARBITRATOR_SHARE_BPS: u64 = 1_000;
/// Seconds in a 365-day year
pub const SECONDS_PER_YEAR: u64 = 31_536_000;
/// Platform-wide floor on `protocol_fee_bps`
pub const DEFAULT_MIN_PROTOCOL_FEE_BPS: u16 = 50;
/// Fixed-point scale of `nav_high_water_mark`
pub const NAV_SCALE: u64 = 1_000_000;

/// Platform parameters that are configuration rather than program constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerParams {
    /// Minimum protocol fee a vault may be configured with
    pub min_protocol_fee_bps: u16,
    /// Shares the operator must keep to unpause or withdraw
    pub min_operator_shares: u64,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            min_protocol_fee_bps: DEFAULT_MIN_PROTOCOL_FEE_BPS,
            min_operator_shares: 0,
        }
    }
}

/// Depositor pool as seen by share math
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    /// Depositor assets (token balance minus bond)
    pub total_assets: u64,
    /// Share supply
    pub total_shares: u64,
}

impl PoolState {
    /// Create a pool
    pub fn new(total_assets: u64, total_shares: u64) -> Self {
        Self {
            total_assets,
            total_shares,
        }
    }

    /// Derive the pool from the vault token balance; the bond is not pool capital
    pub fn from_balances(token_balance: u64, operator_bond: u64, share_supply: u64) -> Self {
        Self::new(token_balance.saturating_sub(operator_bond), share_supply)
    }
}

fn mul_div(a: u64, b: u64, c: u64) -> Result<u64> {
    let value = (a as u128) * (b as u128) / (c as u128);
    u64::try_from(value).map_err(|_| RejectionCode::ArithmeticOverflow.into())
}

fn checked_add(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| RejectionCode::ArithmeticOverflow.into())
}

/// Depositors' cut of revenue: `10000 − agent − protocol`
pub fn vault_fee_bps(agent_fee_bps: u16, protocol_fee_bps: u16) -> Result<u16> {
    let taken = agent_fee_bps as u64 + protocol_fee_bps as u64;
    if taken > BPS_DENOMINATOR {
        return Err(RejectionCode::InvalidFees.into());
    }
    Ok((BPS_DENOMINATOR - taken) as u16)
}

/// Check a fee configuration against the denominator and the platform floor
pub fn validate_fees(agent_fee_bps: u16, protocol_fee_bps: u16, min_protocol_fee_bps: u16) -> Result<()> {
    vault_fee_bps(agent_fee_bps, protocol_fee_bps)?;
    if protocol_fee_bps < min_protocol_fee_bps {
        return Err(RejectionCode::InvalidFees.into());
    }
    Ok(())
}

/// `floor(amount × (shares + VS) / (assets + VA))`
pub fn shares_for_deposit(amount: u64, pool: PoolState) -> Result<u64> {
    let shares = pool.total_shares as u128 + VIRTUAL_SHARES as u128;
    let assets = pool.total_assets as u128 + VIRTUAL_ASSETS as u128;
    let out = amount as u128 * shares / assets;
    u64::try_from(out).map_err(|_| RejectionCode::ArithmeticOverflow.into())
}

/// `floor(shares × (assets + VA) / (shares_total + VS))`
pub fn assets_for_withdraw(shares: u64, pool: PoolState) -> Result<u64> {
    let assets = pool.total_assets as u128 + VIRTUAL_ASSETS as u128;
    let supply = pool.total_shares as u128 + VIRTUAL_SHARES as u128;
    let out = shares as u128 * assets / supply;
    u64::try_from(out).map_err(|_| RejectionCode::ArithmeticOverflow.into())
}

/// Exact NAV per share
pub fn nav(pool: PoolState) -> Decimal {
    let assets = Decimal::from(pool.total_assets) + Decimal::from(VIRTUAL_ASSETS);
    let shares = Decimal::from(pool.total_shares) + Decimal::from(VIRTUAL_SHARES);
    assets / shares
}

/// NAV scaled by `NAV_SCALE`, floored; the unit of `nav_high_water_mark`
pub fn nav_scaled(pool: PoolState) -> u64 {
    let assets = pool.total_assets as u128 + VIRTUAL_ASSETS as u128;
    let shares = pool.total_shares as u128 + VIRTUAL_SHARES as u128;
    u64::try_from(assets * NAV_SCALE as u128 / shares).unwrap_or(u64::MAX)
}

/// Deposit capacity given realized revenue
///
/// With no revenue, or a target spread that is not positive, the fixed cap
/// applies. Otherwise the cap is the principal that the annualized depositor
/// revenue could pay at the target spread over the lending floor.
pub fn effective_tvl_cap(vault: &VaultAccount, now: i64) -> u64 {
    if vault.total_revenue == 0 {
        return vault.max_tvl_fixed;
    }
    let spread_bps = vault.target_apy_bps as i64 - vault.lending_floor_bps as i64;
    if spread_bps <= 0 {
        return vault.max_tvl_fixed;
    }

    let vault_fee = (BPS_DENOMINATOR as u128)
        .saturating_sub(vault.agent_fee_bps as u128 + vault.protocol_fee_bps as u128);
    let elapsed = (now - vault.created_at).max(1) as u128;

    let annualized = vault.total_revenue as u128 * vault_fee * SECONDS_PER_YEAR as u128
        / BPS_DENOMINATOR as u128
        / elapsed;
    let dynamic_cap = annualized * BPS_DENOMINATOR as u128 / spread_bps as u128;

    u64::try_from(dynamic_cap)
        .unwrap_or(u64::MAX)
        .min(vault.max_tvl_fixed)
}

/// Shares a deposit would mint, or the reason the vault refuses it
pub fn quote_deposit(
    vault: &VaultAccount,
    pool: PoolState,
    amount: u64,
    min_shares_out: u64,
    now: i64,
) -> Result<u64> {
    if amount == 0 {
        return Err(RejectionCode::ZeroAmount.into());
    }
    if vault.paused {
        return Err(RejectionCode::VaultPaused.into());
    }
    if vault.operator_bond < MIN_OPERATOR_BOND {
        return Err(RejectionCode::InsufficientBond.into());
    }

    let after = checked_add(pool.total_assets, amount)?;
    if after > effective_tvl_cap(vault, now) {
        return Err(RejectionCode::TvlCapExceeded.into());
    }

    let shares = shares_for_deposit(amount, pool)?;
    if shares == 0 {
        return Err(RejectionCode::ZeroShares.into());
    }
    if shares < min_shares_out {
        return Err(RejectionCode::SlippageExceeded.into());
    }
    Ok(shares)
}

/// Assets a redemption would pay out, or the reason the vault refuses it
pub fn quote_withdraw(
    vault: &VaultAccount,
    pool: PoolState,
    record: &DepositRecord,
    shares: u64,
    min_assets_out: u64,
    now: i64,
) -> Result<u64> {
    if shares == 0 {
        return Err(RejectionCode::ZeroAmount.into());
    }
    if now < record.unlocks_at(vault) {
        return Err(RejectionCode::LockupNotExpired.into());
    }

    let assets = assets_for_withdraw(shares, pool)?;
    if assets < min_assets_out {
        return Err(RejectionCode::SlippageExceeded.into());
    }
    if assets > pool.total_assets {
        return Err(RejectionCode::InsufficientVaultBalance.into());
    }
    Ok(assets)
}

/// The operator may not redeem below the configured share floor
pub fn check_operator_withdraw(remaining_shares: u64, params: &LedgerParams) -> Result<()> {
    if remaining_shares < params.min_operator_shares {
        return Err(RejectionCode::InsufficientBond.into());
    }
    Ok(())
}

/// How a revenue payment is divided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSplit {
    /// Into the vault (depositors)
    pub vault_cut: u64,
    /// To the protocol treasury
    pub protocol_cut: u64,
    /// Kept by the payer (the operator's share)
    pub retained: u64,
}

/// Split `amount` by the vault's fee configuration
pub fn revenue_split(amount: u64, agent_fee_bps: u16, protocol_fee_bps: u16) -> Result<RevenueSplit> {
    let vault_fee = vault_fee_bps(agent_fee_bps, protocol_fee_bps)?;
    let vault_cut = mul_div(amount, vault_fee as u64, BPS_DENOMINATOR)?;
    let protocol_cut = mul_div(amount, protocol_fee_bps as u64, BPS_DENOMINATOR)?;
    Ok(RevenueSplit {
        vault_cut,
        protocol_cut,
        retained: amount - vault_cut - protocol_cut,
    })
}

/// Apply `receive_revenue` to the vault account
///
/// `pool` is the depositor pool before the vault cut lands; the high-water
/// mark is taken on the pool after it.
pub fn apply_revenue(vault: &mut VaultAccount, pool: PoolState, amount: u64) -> Result<RevenueSplit> {
    if amount == 0 {
        return Err(RejectionCode::ZeroAmount.into());
    }
    if vault.paused {
        return Err(RejectionCode::VaultPaused.into());
    }

    let split = revenue_split(amount, vault.agent_fee_bps, vault.protocol_fee_bps)?;
    let total_revenue = checked_add(vault.total_revenue, amount)?;
    let total_jobs = checked_add(vault.total_jobs, 1)?;
    let pool_after = PoolState::new(checked_add(pool.total_assets, split.vault_cut)?, pool.total_shares);

    vault.total_revenue = total_revenue;
    vault.total_jobs = total_jobs;
    vault.nav_high_water_mark = vault.nav_high_water_mark.max(nav_scaled(pool_after));
    Ok(split)
}

/// Distribution of a slash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlashSplit {
    /// `job_payment × SLASH_MULTIPLIER`
    pub total: u64,
    /// Refund to the client
    pub client: u64,
    /// Arbitrator's fee
    pub arbitrator: u64,
    /// Remainder to the protocol, absorbing rounding
    pub protocol: u64,
}

/// Split a slash for `job_payment`
pub fn slash_split(job_payment: u64) -> Result<SlashSplit> {
    if job_payment == 0 {
        return Err(RejectionCode::ZeroAmount.into());
    }
    let total = job_payment
        .checked_mul(SLASH_MULTIPLIER)
        .ok_or(RejectionCode::ArithmeticOverflow)?;
    let client = mul_div(total, CLIENT_SHARE_BPS, BPS_DENOMINATOR)?;
    let arbitrator = mul_div(total, ARBITRATOR_SHARE_BPS, BPS_DENOMINATOR)?;
    Ok(SlashSplit {
        total,
        client,
        arbitrator,
        protocol: total - client - arbitrator,
    })
}

/// Result of a slash: the split and where the funds came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlashOutcome {
    /// Distribution
    pub split: SlashSplit,
    /// Drawn from the operator bond
    pub from_bond: u64,
    /// Drawn from the depositor pool
    pub from_pool: u64,
}

/// Apply `slash` to the vault account
///
/// The bond is drained first; any shortfall comes out of the pool. No
/// shares are burned. The caller reduces the pool by `from_pool`.
pub fn apply_slash(vault: &mut VaultAccount, pool: PoolState, job_payment: u64) -> Result<SlashOutcome> {
    let split = slash_split(job_payment)?;
    let from_bond = split.total.min(vault.operator_bond);
    let from_pool = split.total - from_bond;
    if from_pool > pool.total_assets {
        return Err(RejectionCode::InsufficientVaultBalance.into());
    }

    let total_slashed = checked_add(vault.total_slashed, split.total)?;
    let slash_event_count = vault
        .slash_event_count
        .checked_add(1)
        .ok_or(RejectionCode::ArithmeticOverflow)?;

    vault.operator_bond -= from_bond;
    vault.total_slashed = total_slashed;
    vault.slash_event_count = slash_event_count;
    Ok(SlashOutcome {
        split,
        from_bond,
        from_pool,
    })
}

/// Add to the operator bond
pub fn stake_bond(vault: &mut VaultAccount, amount: u64) -> Result<()> {
    if amount == 0 {
        return Err(RejectionCode::ZeroAmount.into());
    }
    vault.operator_bond = checked_add(vault.operator_bond, amount)?;
    Ok(())
}

/// Stop deposits and revenue
pub fn pause(vault: &mut VaultAccount) {
    vault.paused = true;
}

/// Resume; needs the minimum bond and the operator share floor
pub fn unpause(vault: &mut VaultAccount, operator_shares: u64, params: &LedgerParams) -> Result<()> {
    if vault.operator_bond < MIN_OPERATOR_BOND {
        return Err(RejectionCode::InsufficientBond.into());
    }
    check_operator_withdraw(operator_shares, params)?;
    vault.paused = false;
    Ok(())
}

/// `signer` must be the vault operator
pub fn require_operator(vault: &VaultAccount, signer: &Pubkey) -> Result<()> {
    if *signer != vault.operator {
        return Err(RejectionCode::Unauthorized.into());
    }
    Ok(())
}

/// `signer` must be the vault arbitrator
pub fn require_arbitrator(vault: &VaultAccount, signer: &Pubkey) -> Result<()> {
    if *signer != vault.arbitrator {
        return Err(RejectionCode::Unauthorized.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::sample_vault;
    use crate::Error;

    fn rejection(result: Result<impl std::fmt::Debug>) -> RejectionCode {
        match result {
            Err(Error::Rejected(code)) => code,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_revenue_split_scenario() {
        let split = revenue_split(10_000_000, 7000, 500).unwrap();
        assert_eq!(split.vault_cut, 2_500_000);
        assert_eq!(split.protocol_cut, 500_000);
        assert_eq!(split.retained, 7_000_000);
    }

    #[test]
    fn test_apply_revenue_updates_counters_and_hwm() {
        let mut vault = sample_vault();
        let pool = PoolState::new(100_000_000, 100_000_000);

        let split = apply_revenue(&mut vault, pool, 10_000_000).unwrap();
        assert_eq!(split.vault_cut, 2_500_000);
        assert_eq!(vault.total_revenue, 10_000_000);
        assert_eq!(vault.total_jobs, 1);
        // (102.5M + 1M) / (100M + 1M) scaled
        assert_eq!(vault.nav_high_water_mark, 1_024_752);

        vault.paused = true;
        assert_eq!(
            rejection(apply_revenue(&mut vault, pool, 1)),
            RejectionCode::VaultPaused
        );
    }

    #[test]
    fn test_two_slashes_come_from_bond() {
        let mut vault = sample_vault();
        let pool = PoolState::new(50_000_000, 50_000_000);

        for _ in 0..2 {
            let outcome = apply_slash(&mut vault, pool, 5_000_000).unwrap();
            assert_eq!(outcome.split.total, 10_000_000);
            assert_eq!(outcome.from_bond, 10_000_000);
            assert_eq!(outcome.from_pool, 0);
        }

        assert_eq!(vault.operator_bond, 80_000_000);
        assert_eq!(vault.slash_event_count, 2);
        assert_eq!(vault.total_slashed, 20_000_000);
    }

    #[test]
    fn test_slash_shortfall_hits_pool() {
        let mut vault = sample_vault();
        vault.operator_bond = 3_000_000;
        let pool = PoolState::new(50_000_000, 50_000_000);

        let outcome = apply_slash(&mut vault, pool, 5_000_000).unwrap();
        assert_eq!(outcome.from_bond, 3_000_000);
        assert_eq!(outcome.from_pool, 7_000_000);
        assert_eq!(vault.operator_bond, 0);

        // Pool cannot cover: nothing changes
        let before = vault.clone();
        let empty = PoolState::new(1, 1);
        assert_eq!(
            rejection(apply_slash(&mut vault, empty, 5_000_000)),
            RejectionCode::InsufficientVaultBalance
        );
        assert_eq!(vault, before);
    }

    #[test]
    fn test_slash_split_proportions() {
        let split = slash_split(5_000_000).unwrap();
        assert_eq!(split.client, 7_500_000);
        assert_eq!(split.arbitrator, 1_000_000);
        assert_eq!(split.protocol, 1_500_000);

        // Odd totals: protocol absorbs rounding
        let split = slash_split(3).unwrap();
        assert_eq!(split.total, 6);
        assert_eq!(split.client + split.arbitrator + split.protocol, 6);
        assert_eq!(split.client, 4);
        assert_eq!(split.arbitrator, 0);
    }

    #[test]
    fn test_dust_deposit_rejected() {
        let vault = sample_vault();
        let pool = PoolState::new(200_000_000, 100_000_000);
        assert_eq!(shares_for_deposit(1, pool).unwrap(), 0);
        assert_eq!(
            rejection(quote_deposit(&vault, pool, 1, 0, 1_700_000_100)),
            RejectionCode::ZeroShares
        );
    }

    #[test]
    fn test_deposit_check_order() {
        let mut vault = sample_vault();
        let pool = PoolState::default();
        let now = vault.created_at + 10;

        assert_eq!(
            rejection(quote_deposit(&vault, pool, 0, 0, now)),
            RejectionCode::ZeroAmount
        );

        vault.operator_bond = MIN_OPERATOR_BOND - 1;
        assert_eq!(
            rejection(quote_deposit(&vault, pool, 10, 0, now)),
            RejectionCode::InsufficientBond
        );

        vault.paused = true;
        assert_eq!(
            rejection(quote_deposit(&vault, pool, 10, 0, now)),
            RejectionCode::VaultPaused
        );

        vault.paused = false;
        vault.operator_bond = MIN_OPERATOR_BOND;
        assert_eq!(
            rejection(quote_deposit(&vault, pool, 10, 11, now)),
            RejectionCode::SlippageExceeded
        );
        assert_eq!(quote_deposit(&vault, pool, 10, 10, now).unwrap(), 10);

        vault.max_tvl_fixed = 5;
        assert_eq!(
            rejection(quote_deposit(&vault, pool, 10, 0, now)),
            RejectionCode::TvlCapExceeded
        );
    }

    #[test]
    fn test_dynamic_tvl_cap() {
        let mut vault = sample_vault();
        assert_eq!(effective_tvl_cap(&vault, vault.created_at), vault.max_tvl_fixed);

        // 1 USDC of revenue over one year at 25% depositor cut, 2% spread
        vault.total_revenue = 1_000_000;
        let now = vault.created_at + SECONDS_PER_YEAR as i64;
        assert_eq!(effective_tvl_cap(&vault, now), 12_500_000);

        // No positive spread: fixed cap
        vault.target_apy_bps = vault.lending_floor_bps;
        assert_eq!(effective_tvl_cap(&vault, now), vault.max_tvl_fixed);
    }

    #[test]
    fn test_withdraw_lockup_and_balance() {
        let vault = sample_vault();
        let pool = PoolState::new(100_000_000, 100_000_000);
        let mut record = DepositRecord::new(Pubkey::new([6u8; 32]), Pubkey::new([9u8; 32]));
        record.record_deposit(100_000_000, 1_000).unwrap();

        assert_eq!(
            rejection(quote_withdraw(&vault, pool, &record, 10, 0, 1_000 + 86_399)),
            RejectionCode::LockupNotExpired
        );

        let now = 1_000 + 86_400;
        assert_eq!(quote_withdraw(&vault, pool, &record, 1_000_000, 0, now).unwrap(), 1_000_000);
        assert_eq!(
            rejection(quote_withdraw(&vault, pool, &record, 1_000_000, 1_000_001, now)),
            RejectionCode::SlippageExceeded
        );
        assert_eq!(
            rejection(quote_withdraw(&vault, pool, &record, 0, 0, now)),
            RejectionCode::ZeroAmount
        );
    }

    #[test]
    fn test_fee_validation() {
        assert!(validate_fees(7000, 500, 50).is_ok());
        assert_eq!(rejection(validate_fees(9600, 500, 50)), RejectionCode::InvalidFees);
        assert_eq!(rejection(validate_fees(7000, 10, 50)), RejectionCode::InvalidFees);
        assert_eq!(vault_fee_bps(10_000, 0).unwrap(), 0);
    }

    #[test]
    fn test_unpause_requires_bond() {
        let mut vault = sample_vault();
        let params = LedgerParams::default();
        pause(&mut vault);
        vault.operator_bond = 1;
        assert_eq!(
            rejection(unpause(&mut vault, 0, &params)),
            RejectionCode::InsufficientBond
        );
        assert!(vault.paused);

        stake_bond(&mut vault, MIN_OPERATOR_BOND).unwrap();
        unpause(&mut vault, 0, &params).unwrap();
        assert!(!vault.paused);

        let strict = LedgerParams {
            min_operator_shares: 10,
            ..LedgerParams::default()
        };
        pause(&mut vault);
        assert!(unpause(&mut vault, 9, &strict).is_err());
    }

    #[test]
    fn test_role_checks() {
        let vault = sample_vault();
        assert!(require_operator(&vault, &vault.operator).is_ok());
        assert!(require_operator(&vault, &vault.arbitrator).is_err());
        assert!(require_arbitrator(&vault, &vault.arbitrator).is_ok());
        assert_eq!(
            rejection(require_arbitrator(&vault, &vault.operator)),
            RejectionCode::Unauthorized
        );
    }

    #[test]
    fn test_nav_starts_at_one() {
        assert_eq!(nav(PoolState::default()), Decimal::ONE);
        assert_eq!(nav_scaled(PoolState::default()), NAV_SCALE);
    }
}
