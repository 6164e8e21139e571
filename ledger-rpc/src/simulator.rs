//! In-process ledger
//!
//! Applies the vault and registry rules from `vault_ledger` to every
//! operation, records each operation as a transaction with encoded event
//! logs, serves paginated history newest-first and broadcasts live logs.
//! Submitted transactions must carry valid signatures and a live blockhash.
//!
//! Failed operations land like real failed transactions: they appear in
//! history with an error and no events, and their state changes are
//! discarded.

use crate::client::{
    LedgerClient, LogStream, RecentBlockhash, SignatureInfo, SignatureQuery, TransactionLogs,
    TxStatus,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use vault_ledger::events::{encode_logs, LedgerEvent};
use vault_ledger::pda::{self, DEFAULT_REGISTRY_PROGRAM_ID, DEFAULT_VAULT_PROGRAM_ID};
use vault_ledger::receipt::{self, NewJob};
use vault_ledger::tx::{ProgramInstruction, Transaction};
use vault_ledger::vault::{self, LedgerParams, NAV_SCALE};
use vault_ledger::{
    DepositRecord, Hash, JobReceipt, PoolState, Pubkey, RegistryAccount, RejectionCode, Signature,
    VaultAccount,
};

/// Starting unix time of the simulated clock
const GENESIS_TIME: i64 = 1_700_000_000;
/// Blocks a blockhash stays valid for
const DEFAULT_BLOCKHASH_VALIDITY: u64 = 150;
/// Size of an SPL token account
const TOKEN_ACCOUNT_LEN: usize = 165;

type ProgramResult<T> = std::result::Result<T, vault_ledger::Error>;

/// Parameters of a new vault
#[derive(Debug, Clone)]
pub struct VaultSetup {
    /// Operator wallet
    pub operator: Pubkey,
    /// Slashing authority
    pub arbitrator: Pubkey,
    /// Token account receiving the protocol cut
    pub protocol_treasury: Pubkey,
    /// Operator's cut of revenue
    pub agent_fee_bps: u16,
    /// Protocol's cut of revenue
    pub protocol_fee_bps: u16,
    /// Fixed TVL cap
    pub max_tvl: u64,
    /// Target depositor APY
    pub target_apy_bps: u16,
    /// Lending floor
    pub lending_floor_bps: u16,
    /// Lockup in epochs
    pub lockup_epochs: u8,
    /// Epoch length in seconds
    pub epoch_length_seconds: i64,
}

impl VaultSetup {
    /// Typical configuration: 70% agent, 5% protocol, 1M USDC cap, one-day lockup
    pub fn new(operator: Pubkey, arbitrator: Pubkey, protocol_treasury: Pubkey) -> Self {
        Self {
            operator,
            arbitrator,
            protocol_treasury,
            agent_fee_bps: 7000,
            protocol_fee_bps: 500,
            max_tvl: 1_000_000_000_000,
            target_apy_bps: 1000,
            lending_floor_bps: 800,
            lockup_epochs: 1,
            epoch_length_seconds: 86_400,
        }
    }
}

/// Account state; cloned per operation so failures leave no trace
#[derive(Debug, Clone, Default)]
struct Accounts {
    vaults: HashMap<Pubkey, VaultAccount>,
    registries: HashMap<Pubkey, RegistryAccount>,
    receipts: HashMap<Pubkey, JobReceipt>,
    deposits: HashMap<Pubkey, DepositRecord>,
    tokens: HashMap<Pubkey, u64>,
    shares: HashMap<(Pubkey, Pubkey), u64>,
    share_supply: HashMap<Pubkey, u64>,
}

impl Accounts {
    fn vault(&self, address: &Pubkey) -> ProgramResult<VaultAccount> {
        self.vaults
            .get(address)
            .cloned()
            .ok_or_else(|| vault_ledger::Error::Decode(format!("vault {} not initialized", address)))
    }

    fn registry(&self, address: &Pubkey) -> ProgramResult<RegistryAccount> {
        self.registries
            .get(address)
            .cloned()
            .ok_or_else(|| vault_ledger::Error::Decode(format!("registry {} not initialized", address)))
    }

    fn receipt(&self, address: &Pubkey) -> ProgramResult<JobReceipt> {
        self.receipts
            .get(address)
            .cloned()
            .ok_or_else(|| vault_ledger::Error::Decode(format!("receipt {} not found", address)))
    }

    fn balance(&self, token_account: &Pubkey) -> u64 {
        self.tokens.get(token_account).copied().unwrap_or(0)
    }

    fn pool(&self, vault: &VaultAccount, vault_address: &Pubkey) -> PoolState {
        PoolState::from_balances(
            self.balance(&vault.vault_token_account),
            vault.operator_bond,
            self.share_supply.get(vault_address).copied().unwrap_or(0),
        )
    }

    fn transfer(&mut self, from: &Pubkey, to: &Pubkey, amount: u64) -> ProgramResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let available = self.balance(from);
        if available < amount {
            return Err(RejectionCode::InsufficientFunds.into());
        }
        self.tokens.insert(*from, available - amount);
        let credited = self
            .balance(to)
            .checked_add(amount)
            .ok_or(RejectionCode::ArithmeticOverflow)?;
        self.tokens.insert(*to, credited);
        Ok(())
    }
}

/// Executed transactions and chain position
#[derive(Debug, Default)]
struct Journal {
    history: HashMap<Pubkey, Vec<SignatureInfo>>,
    transactions: HashMap<Signature, TransactionLogs>,
    statuses: HashMap<Signature, TxStatus>,
    blockhashes: HashMap<Hash, u64>,
    slot: u64,
    block_height: u64,
    counter: u64,
}

#[derive(Debug)]
struct State {
    accounts: Accounts,
    journal: Journal,
    now: i64,
    drop_transactions: bool,
    unavailable: bool,
    blockhash_validity: u64,
}

/// One program invocation within a transaction
struct Invocation {
    program: Pubkey,
    events: Vec<LedgerEvent>,
}

/// In-process ledger implementing [`LedgerClient`]
#[derive(Debug, Clone)]
pub struct SimulatedLedger {
    state: Arc<Mutex<State>>,
    live: broadcast::Sender<(Vec<Pubkey>, TransactionLogs)>,
    vault_program: Pubkey,
    registry_program: Pubkey,
    usdc_mint: Pubkey,
    params: LedgerParams,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLedger {
    /// Ledger with the default program deployments
    pub fn new() -> Self {
        Self::with_programs(
            *DEFAULT_VAULT_PROGRAM_ID,
            *DEFAULT_REGISTRY_PROGRAM_ID,
            Pubkey::new([0xA5; 32]),
            LedgerParams::default(),
        )
    }

    /// Ledger with explicit program ids, mint and platform parameters
    pub fn with_programs(
        vault_program: Pubkey,
        registry_program: Pubkey,
        usdc_mint: Pubkey,
        params: LedgerParams,
    ) -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(State {
                accounts: Accounts::default(),
                journal: Journal::default(),
                now: GENESIS_TIME,
                drop_transactions: false,
                unavailable: false,
                blockhash_validity: DEFAULT_BLOCKHASH_VALIDITY,
            })),
            live,
            vault_program,
            registry_program,
            usdc_mint,
            params,
        }
    }

    /// Vault program id
    pub fn vault_program(&self) -> Pubkey {
        self.vault_program
    }

    /// Registry program id
    pub fn registry_program(&self) -> Pubkey {
        self.registry_program
    }

    /// Deposit asset mint
    pub fn usdc_mint(&self) -> Pubkey {
        self.usdc_mint
    }

    /// Current simulated unix time
    pub fn now(&self) -> i64 {
        self.state.lock().now
    }

    /// Move the clock forward
    pub fn advance_clock(&self, seconds: i64) {
        self.state.lock().now += seconds;
    }

    /// Accept submissions without ever executing them
    pub fn set_drop_transactions(&self, drop: bool) {
        self.state.lock().drop_transactions = drop;
    }

    /// Make every query fail with a timeout
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Blocks a new blockhash stays valid for
    pub fn set_blockhash_validity(&self, blocks: u64) {
        self.state.lock().blockhash_validity = blocks;
    }

    /// Vault address of an operator
    pub fn vault_address(&self, operator: &Pubkey) -> Result<Pubkey> {
        Ok(pda::vault_address(&self.vault_program, operator)?)
    }

    /// Registry address of a vault
    pub fn registry_address(&self, vault: &Pubkey) -> Result<Pubkey> {
        Ok(pda::registry_address(&self.registry_program, vault)?)
    }

    /// Token account of `owner` for the deposit mint
    pub fn token_account(&self, owner: &Pubkey) -> Result<Pubkey> {
        Ok(pda::associated_token_address(owner, &self.usdc_mint)?)
    }

    /// Vault state
    pub fn vault(&self, address: &Pubkey) -> Option<VaultAccount> {
        self.state.lock().accounts.vaults.get(address).cloned()
    }

    /// Registry state
    pub fn registry(&self, address: &Pubkey) -> Option<RegistryAccount> {
        self.state.lock().accounts.registries.get(address).cloned()
    }

    /// Job receipt by registry and id
    pub fn receipt(&self, registry: &Pubkey, job_id: u64) -> Option<JobReceipt> {
        let address = pda::job_receipt_address(&self.registry_program, registry, job_id).ok()?;
        self.state.lock().accounts.receipts.get(&address).cloned()
    }

    /// Token balance of an account
    pub fn balance(&self, token_account: &Pubkey) -> u64 {
        self.state.lock().accounts.balance(token_account)
    }

    /// Shares held by `owner` in `vault`
    pub fn share_balance(&self, vault: &Pubkey, owner: &Pubkey) -> u64 {
        self.state
            .lock()
            .accounts
            .shares
            .get(&(*vault, *owner))
            .copied()
            .unwrap_or(0)
    }

    /// Depositor pool of a vault
    pub fn pool(&self, vault_address: &Pubkey) -> Option<PoolState> {
        let state = self.state.lock();
        let vault = state.accounts.vaults.get(vault_address)?;
        Some(state.accounts.pool(vault, vault_address))
    }

    /// Transactions recorded for a program
    pub fn transaction_count(&self, program: &Pubkey) -> usize {
        self.state
            .lock()
            .journal
            .history
            .get(program)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Credit tokens to `owner`'s token account
    pub fn mint_to(&self, owner: &Pubkey, amount: u64) -> Result<()> {
        let account = self.token_account(owner)?;
        let mut state = self.state.lock();
        let balance = state.accounts.balance(&account);
        state.accounts.tokens.insert(account, balance.saturating_add(amount));
        Ok(())
    }

    fn execute<F>(&self, signers: &[Pubkey], f: F) -> Result<Signature>
    where
        F: FnOnce(&mut Accounts, i64) -> ProgramResult<Vec<Invocation>>,
    {
        let mut state = self.state.lock();
        let now = state.now;
        let mut draft = state.accounts.clone();
        let signature = next_signature(&mut state.journal, signers);

        match f(&mut draft, now) {
            Ok(invocations) => {
                state.accounts = draft;
                self.record(&mut state, signature, invocations, None);
                Ok(signature)
            }
            Err(err) => {
                debug!(signature = %signature.short(), error = %err, "Simulated transaction failed");
                let failed = vec![Invocation {
                    program: self.program_of_failure(&err),
                    events: Vec::new(),
                }];
                self.record(&mut state, signature, failed, Some(err.to_string()));
                Err(err.into())
            }
        }
    }

    fn program_of_failure(&self, err: &vault_ledger::Error) -> Pubkey {
        match err.rejection() {
            Some(RejectionCode::ChallengeWindowExpired)
            | Some(RejectionCode::ChallengeWindowActive)
            | Some(RejectionCode::JobNotActive)
            | Some(RejectionCode::JobNotChallenged)
            | Some(RejectionCode::AlreadyVerified) => self.registry_program,
            _ => self.vault_program,
        }
    }

    fn record(&self, state: &mut State, signature: Signature, invocations: Vec<Invocation>, err: Option<String>) {
        let journal = &mut state.journal;
        journal.slot += 1;
        journal.block_height += 1;
        let slot = journal.slot;

        let mut logs = Vec::new();
        let mut programs: Vec<Pubkey> = Vec::new();
        for invocation in &invocations {
            match &err {
                None => logs.extend(encode_logs(&invocation.program, &invocation.events)),
                Some(reason) => {
                    logs.push(format!("Program {} invoke [1]", invocation.program));
                    logs.push(format!("Program log: Error: {}", reason));
                    logs.push(format!("Program {} failed: custom program error", invocation.program));
                }
            }
            if !programs.contains(&invocation.program) {
                programs.push(invocation.program);
            }
        }

        let entry = TransactionLogs {
            signature,
            slot,
            block_time: Some(state.now),
            err: err.clone(),
            logs,
        };
        for program in &programs {
            journal.history.entry(*program).or_default().push(SignatureInfo {
                signature,
                slot,
                err: err.clone(),
                block_time: Some(state.now),
            });
        }
        let status = match &err {
            None => TxStatus::Confirmed { slot },
            Some(reason) => TxStatus::Failed {
                slot,
                reason: reason.clone(),
            },
        };
        journal.statuses.insert(signature, status);
        journal.transactions.insert(signature, entry.clone());

        // No subscribers is fine
        let _ = self.live.send((programs, entry));
    }

    /// Create a vault for `setup.operator`
    pub fn create_vault(&self, setup: VaultSetup) -> Result<Pubkey> {
        vault::validate_fees(setup.agent_fee_bps, setup.protocol_fee_bps, self.params.min_protocol_fee_bps)?;
        let (address, bump) = pda::find_program_address(&[b"vault", setup.operator.as_bytes()], &self.vault_program)?;
        let share_mint = pda::share_mint_address(&self.vault_program, &address)?;
        let vault_token_account = pda::associated_token_address(&address, &self.usdc_mint)?;
        let program = self.vault_program;
        let usdc_mint = self.usdc_mint;

        self.execute(&[setup.operator], |accounts, now| {
            let vault = VaultAccount {
                operator: setup.operator,
                arbitrator: setup.arbitrator,
                protocol_treasury: setup.protocol_treasury,
                usdc_mint,
                share_mint,
                vault_token_account,
                agent_fee_bps: setup.agent_fee_bps,
                protocol_fee_bps: setup.protocol_fee_bps,
                total_revenue: 0,
                total_jobs: 0,
                operator_bond: 0,
                total_slashed: 0,
                slash_event_count: 0,
                max_tvl_fixed: setup.max_tvl,
                target_apy_bps: setup.target_apy_bps,
                lending_floor_bps: setup.lending_floor_bps,
                lockup_epochs: setup.lockup_epochs,
                epoch_length_seconds: setup.epoch_length_seconds,
                paused: false,
                nav_high_water_mark: NAV_SCALE,
                created_at: now,
                bump,
            };
            accounts.vaults.insert(address, vault);
            accounts.tokens.entry(vault_token_account).or_insert(0);
            accounts.tokens.entry(setup.protocol_treasury).or_insert(0);
            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::VaultInitialized {
                    vault: address,
                    operator: setup.operator,
                    agent_fee_bps: setup.agent_fee_bps,
                    protocol_fee_bps: setup.protocol_fee_bps,
                    max_tvl: setup.max_tvl,
                    created_at: now,
                }],
            }])
        })?;
        Ok(address)
    }

    /// Create the receipt registry of a vault
    pub fn create_registry(
        &self,
        vault_address: &Pubkey,
        protocol_authority: Pubkey,
        challenge_window: i64,
        job_signer: Option<Pubkey>,
    ) -> Result<Pubkey> {
        let (address, bump) =
            pda::find_program_address(&[b"registry", vault_address.as_bytes()], &self.registry_program)?;
        let program = self.registry_program;
        let vault_address = *vault_address;
        let operator = self
            .vault(&vault_address)
            .map(|v| v.operator)
            .ok_or_else(|| Error::Other(format!("vault {} not initialized", vault_address)))?;

        self.execute(&[operator], |accounts, _now| {
            accounts.registries.insert(
                address,
                RegistryAccount {
                    vault: vault_address,
                    operator,
                    job_signer,
                    protocol_authority,
                    job_counter: 0,
                    challenge_window,
                    total_challenged: 0,
                    total_resolved_against: 0,
                    bump,
                },
            );
            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::RegistryInitialized {
                    vault: vault_address,
                    operator,
                    protocol_authority,
                    challenge_window,
                }],
            }])
        })?;
        Ok(address)
    }

    /// Operator posts bond
    pub fn stake_bond(&self, operator: &Pubkey, amount: u64) -> Result<Signature> {
        let vault_address = self.vault_address(operator)?;
        let source = self.token_account(operator)?;
        let program = self.vault_program;
        let operator = *operator;

        self.execute(&[operator], |accounts, _now| {
            let mut vault = accounts.vault(&vault_address)?;
            vault::require_operator(&vault, &operator)?;
            vault::stake_bond(&mut vault, amount)?;
            accounts.transfer(&source, &vault.vault_token_account, amount)?;
            let total_bond = vault.operator_bond;
            accounts.vaults.insert(vault_address, vault);
            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::BondStaked {
                    vault: vault_address,
                    operator,
                    amount,
                    total_bond,
                }],
            }])
        })
    }

    /// Deposit into a vault
    pub fn deposit(&self, depositor: &Pubkey, vault_address: &Pubkey, amount: u64, min_shares_out: u64) -> Result<Signature> {
        let source = self.token_account(depositor)?;
        let record_address = pda::deposit_address(&self.vault_program, vault_address, depositor)?;
        let program = self.vault_program;
        let (depositor, vault_address) = (*depositor, *vault_address);

        self.execute(&[depositor], |accounts, now| {
            let vault = accounts.vault(&vault_address)?;
            let pool = accounts.pool(&vault, &vault_address);
            let shares = vault::quote_deposit(&vault, pool, amount, min_shares_out, now)?;
            accounts.transfer(&source, &vault.vault_token_account, amount)?;

            *accounts.shares.entry((vault_address, depositor)).or_insert(0) += shares;
            *accounts.share_supply.entry(vault_address).or_insert(0) += shares;
            accounts
                .deposits
                .entry(record_address)
                .or_insert_with(|| DepositRecord::new(vault_address, depositor))
                .record_deposit(amount, now)?;

            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::Deposited {
                    vault: vault_address,
                    depositor,
                    amount,
                    shares,
                }],
            }])
        })
    }

    /// Redeem shares
    pub fn withdraw(&self, withdrawer: &Pubkey, vault_address: &Pubkey, shares: u64, min_assets_out: u64) -> Result<Signature> {
        let destination = self.token_account(withdrawer)?;
        let record_address = pda::deposit_address(&self.vault_program, vault_address, withdrawer)?;
        let program = self.vault_program;
        let params = self.params.clone();
        let (withdrawer, vault_address) = (*withdrawer, *vault_address);

        self.execute(&[withdrawer], |accounts, now| {
            let vault = accounts.vault(&vault_address)?;
            let pool = accounts.pool(&vault, &vault_address);
            let record = accounts
                .deposits
                .get(&record_address)
                .cloned()
                .unwrap_or_else(|| DepositRecord::new(vault_address, withdrawer));
            let held = accounts.shares.get(&(vault_address, withdrawer)).copied().unwrap_or(0);
            if held < shares {
                return Err(RejectionCode::InsufficientFunds.into());
            }

            let usdc_out = vault::quote_withdraw(&vault, pool, &record, shares, min_assets_out, now)?;
            if withdrawer == vault.operator {
                vault::check_operator_withdraw(held - shares, &params)?;
            }
            accounts.transfer(&vault.vault_token_account, &destination, usdc_out)?;
            accounts.shares.insert((vault_address, withdrawer), held - shares);
            *accounts.share_supply.entry(vault_address).or_insert(0) -= shares;

            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::Withdrawn {
                    vault: vault_address,
                    withdrawer,
                    shares,
                    usdc_out,
                }],
            }])
        })
    }

    /// Operator routes revenue directly (outside a signed transaction)
    pub fn receive_revenue(&self, operator: &Pubkey, amount: u64) -> Result<Signature> {
        let vault_address = self.vault_address(operator)?;
        let source = self.token_account(operator)?;
        let program = self.vault_program;
        let operator = *operator;

        self.execute(&[operator], |accounts, _now| {
            let event = apply_receive_revenue(accounts, &vault_address, &operator, &source, amount)?;
            Ok(vec![Invocation {
                program,
                events: vec![event],
            }])
        })
    }

    /// Arbitrator slashes a vault for a job
    pub fn slash(&self, arbitrator: &Pubkey, vault_address: &Pubkey, job_id: u64, job_payment: u64, client: &Pubkey) -> Result<Signature> {
        let client_account = self.token_account(client)?;
        let arbitrator_account = self.token_account(arbitrator)?;
        let program = self.vault_program;
        let (arbitrator, vault_address) = (*arbitrator, *vault_address);

        self.execute(&[arbitrator], |accounts, _now| {
            let mut vault = accounts.vault(&vault_address)?;
            vault::require_arbitrator(&vault, &arbitrator)?;
            let pool = accounts.pool(&vault, &vault_address);
            let outcome = vault::apply_slash(&mut vault, pool, job_payment)?;

            let source = vault.vault_token_account;
            accounts.transfer(&source, &client_account, outcome.split.client)?;
            accounts.transfer(&source, &arbitrator_account, outcome.split.arbitrator)?;
            accounts.transfer(&source, &vault.protocol_treasury, outcome.split.protocol)?;
            accounts.vaults.insert(vault_address, vault);

            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::Slashed {
                    vault: vault_address,
                    job_id,
                    slash_total: outcome.split.total,
                    from_bond: outcome.from_bond,
                    from_pool: outcome.from_pool,
                    client_amount: outcome.split.client,
                    arbitrator_amount: outcome.split.arbitrator,
                    protocol_amount: outcome.split.protocol,
                }],
            }])
        })
    }

    /// Operator pauses the vault
    pub fn pause(&self, operator: &Pubkey) -> Result<Signature> {
        let vault_address = self.vault_address(operator)?;
        let program = self.vault_program;
        let operator = *operator;

        self.execute(&[operator], |accounts, now| {
            let mut vault = accounts.vault(&vault_address)?;
            vault::require_operator(&vault, &operator)?;
            vault::pause(&mut vault);
            accounts.vaults.insert(vault_address, vault);
            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::VaultPaused {
                    vault: vault_address,
                    timestamp: now,
                }],
            }])
        })
    }

    /// Operator unpauses the vault
    pub fn unpause(&self, operator: &Pubkey) -> Result<Signature> {
        let vault_address = self.vault_address(operator)?;
        let program = self.vault_program;
        let params = self.params.clone();
        let operator = *operator;

        self.execute(&[operator], |accounts, now| {
            let mut vault = accounts.vault(&vault_address)?;
            vault::require_operator(&vault, &operator)?;
            let operator_shares = accounts.shares.get(&(vault_address, operator)).copied().unwrap_or(0);
            vault::unpause(&mut vault, operator_shares, &params)?;
            accounts.vaults.insert(vault_address, vault);
            Ok(vec![Invocation {
                program,
                events: vec![LedgerEvent::VaultUnpaused {
                    vault: vault_address,
                    timestamp: now,
                }],
            }])
        })
    }

    /// Record a job directly (outside a signed transaction)
    pub fn record_job(&self, signer: &Pubkey, registry_address: &Pubkey, job: NewJob) -> Result<Signature> {
        let program = self.registry_program;
        let (signer, registry_address) = (*signer, *registry_address);

        self.execute(&[signer], |accounts, now| {
            let event = apply_record_job(accounts, &program, &registry_address, None, &signer, job, now)?;
            Ok(vec![Invocation {
                program,
                events: vec![event],
            }])
        })
    }

    fn receipt_op<F>(&self, signer: &Pubkey, registry_address: &Pubkey, job_id: u64, f: F) -> Result<Signature>
    where
        F: FnOnce(&mut RegistryAccount, &mut JobReceipt, i64) -> ProgramResult<LedgerEvent>,
    {
        let receipt_address = pda::job_receipt_address(&self.registry_program, registry_address, job_id)?;
        let program = self.registry_program;
        let registry_address = *registry_address;

        self.execute(&[*signer], |accounts, now| {
            let mut registry = accounts.registry(&registry_address)?;
            let mut receipt = accounts.receipt(&receipt_address)?;
            let event = f(&mut registry, &mut receipt, now)?;
            accounts.registries.insert(registry_address, registry);
            accounts.receipts.insert(receipt_address, receipt);
            Ok(vec![Invocation {
                program,
                events: vec![event],
            }])
        })
    }

    /// Client challenges a receipt
    pub fn challenge(&self, challenger: &Pubkey, registry_address: &Pubkey, job_id: u64) -> Result<Signature> {
        let who = *challenger;
        let registry = *registry_address;
        self.receipt_op(challenger, registry_address, job_id, move |reg, job, now| {
            receipt::challenge(reg, job, &who, now)?;
            Ok(LedgerEvent::JobChallenged {
                registry,
                job_id,
                challenger: who,
                challenged_at: now,
            })
        })
    }

    /// Finalize an unchallenged receipt after its window
    pub fn finalize(&self, caller: &Pubkey, registry_address: &Pubkey, job_id: u64) -> Result<Signature> {
        let registry = *registry_address;
        self.receipt_op(caller, registry_address, job_id, move |reg, job, now| {
            receipt::finalize(reg, job, now)?;
            Ok(LedgerEvent::JobFinalized {
                registry,
                job_id,
                finalized_at: now,
            })
        })
    }

    /// Protocol authority resolves a dispute
    pub fn resolve(&self, authority: &Pubkey, registry_address: &Pubkey, job_id: u64, for_agent: bool) -> Result<Signature> {
        let who = *authority;
        let registry = *registry_address;
        self.receipt_op(authority, registry_address, job_id, move |reg, job, now| {
            if for_agent {
                receipt::resolve_for_agent(reg, job, &who, now)?;
            } else {
                receipt::resolve_against_agent(reg, job, &who, now)?;
            }
            Ok(LedgerEvent::JobResolved {
                registry,
                job_id,
                status: job.status,
                resolved_at: now,
            })
        })
    }

    /// Client acknowledges a receipt
    pub fn verify_receipt(&self, client: &Pubkey, registry_address: &Pubkey, job_id: u64) -> Result<Signature> {
        let who = *client;
        let registry = *registry_address;
        self.receipt_op(client, registry_address, job_id, move |_reg, job, now| {
            receipt::verify(job, &who)?;
            Ok(LedgerEvent::ReceiptVerified {
                registry,
                job_id,
                client: who,
                verified_at: now,
            })
        })
    }

    fn ensure_available(&self) -> Result<()> {
        if self.state.lock().unavailable {
            return Err(Error::Timeout("simulated ledger unavailable".to_string()));
        }
        Ok(())
    }

    fn dispatch(&self, accounts: &mut Accounts, tx: &Transaction, now: i64) -> ProgramResult<Vec<Invocation>> {
        let signers = tx.message.signers();
        let mut invocations = Vec::new();

        for compiled in &tx.message.instructions {
            let (program, keys) = tx.message.resolve(compiled)?;
            let instruction = ProgramInstruction::decode(&compiled.data)?
                .ok_or_else(|| vault_ledger::Error::Decode("unsupported instruction".to_string()))?;
            let account = |i: usize| {
                keys.get(i)
                    .copied()
                    .ok_or_else(|| vault_ledger::Error::Decode(format!("missing account {}", i)))
            };

            let event = match instruction {
                ProgramInstruction::ReceiveRevenue { amount } if program == self.vault_program => {
                    let (vault_address, operator) = (account(0)?, account(1)?);
                    let vault = accounts.vault(&vault_address)?;
                    if !signers.contains(&operator) {
                        return Err(RejectionCode::Unauthorized.into());
                    }
                    if account(2)? != vault.vault_token_account || account(4)? != vault.protocol_treasury {
                        return Err(vault_ledger::Error::Decode("account constraint violated".to_string()));
                    }
                    apply_receive_revenue(accounts, &vault_address, &operator, &account(3)?, amount)?
                }
                ProgramInstruction::RecordJob {
                    artifact_hash,
                    payment_amount,
                    payment_tx_ref,
                } if program == self.registry_program => {
                    let signer = account(2)?;
                    if !signers.contains(&signer) {
                        return Err(RejectionCode::Unauthorized.into());
                    }
                    let job = NewJob {
                        client: account(3)?,
                        artifact_hash,
                        payment_amount,
                        payment_tx_ref,
                    };
                    apply_record_job(accounts, &program, &account(0)?, Some(account(1)?), &signer, job, now)?
                }
                _ => {
                    return Err(vault_ledger::Error::Decode(format!(
                        "instruction not handled by program {}",
                        program
                    )))
                }
            };
            invocations.push(Invocation {
                program,
                events: vec![event],
            });
        }
        Ok(invocations)
    }
}

fn next_signature(journal: &mut Journal, signers: &[Pubkey]) -> Signature {
    journal.counter += 1;
    let mut hasher = Sha256::new();
    hasher.update(journal.counter.to_le_bytes());
    for signer in signers {
        hasher.update(signer.as_bytes());
    }
    let first: [u8; 32] = hasher.finalize().into();
    let second: [u8; 32] = Sha256::digest(first).into();

    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(&first);
    bytes[32..].copy_from_slice(&second);
    Signature::from_bytes(bytes)
}

fn apply_receive_revenue(
    accounts: &mut Accounts,
    vault_address: &Pubkey,
    operator: &Pubkey,
    source: &Pubkey,
    amount: u64,
) -> ProgramResult<LedgerEvent> {
    let mut vault = accounts.vault(vault_address)?;
    vault::require_operator(&vault, operator)?;
    let pool = accounts.pool(&vault, vault_address);
    let job_id = vault.total_jobs;
    let split = vault::apply_revenue(&mut vault, pool, amount)?;

    accounts.transfer(source, &vault.protocol_treasury, split.protocol_cut)?;
    accounts.transfer(source, &vault.vault_token_account, split.vault_cut)?;
    accounts.vaults.insert(*vault_address, vault);

    Ok(LedgerEvent::RevenueReceived {
        vault: *vault_address,
        amount,
        job_id,
        vault_cut: split.vault_cut,
        protocol_cut: split.protocol_cut,
    })
}

fn apply_record_job(
    accounts: &mut Accounts,
    program: &Pubkey,
    registry_address: &Pubkey,
    claimed_receipt: Option<Pubkey>,
    signer: &Pubkey,
    job: NewJob,
    now: i64,
) -> ProgramResult<LedgerEvent> {
    let mut registry = accounts.registry(registry_address)?;
    let receipt_address = pda::job_receipt_address(program, registry_address, registry.job_counter)?;
    if claimed_receipt.map_or(false, |claimed| claimed != receipt_address) {
        return Err(vault_ledger::Error::Decode("receipt seeds constraint violated".to_string()));
    }

    let receipt = receipt::record_job(&mut registry, *registry_address, signer, job, now)?;
    let event = LedgerEvent::JobRecorded {
        registry: *registry_address,
        job_id: receipt.job_id,
        client: receipt.client,
        payment_amount: receipt.payment_amount,
        created_at: receipt.created_at,
    };
    accounts.registries.insert(*registry_address, registry);
    accounts.receipts.insert(receipt_address, receipt);
    Ok(event)
}

fn token_account_data(mint: &Pubkey, amount: u64) -> Vec<u8> {
    let mut data = vec![0u8; TOKEN_ACCOUNT_LEN];
    data[..32].copy_from_slice(mint.as_bytes());
    data[64..72].copy_from_slice(&amount.to_le_bytes());
    data
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        let state = self.state.lock();
        let accounts = &state.accounts;

        if let Some(vault) = accounts.vaults.get(address) {
            return Ok(Some(vault.encode()));
        }
        if let Some(registry) = accounts.registries.get(address) {
            return Ok(Some(registry.encode()));
        }
        Ok(accounts
            .tokens
            .get(address)
            .map(|amount| token_account_data(&self.usdc_mint, *amount)))
    }

    async fn get_signatures(&self, program: &Pubkey, query: SignatureQuery) -> Result<Vec<SignatureInfo>> {
        self.ensure_available()?;
        let state = self.state.lock();
        let history = match state.journal.history.get(program) {
            Some(history) => history,
            None => return Ok(Vec::new()),
        };

        let mut newest_first = history.iter().rev();
        if let Some(before) = query.before {
            // Unknown `before`: nothing older can be identified
            if !newest_first.any(|info| info.signature == before) {
                return Ok(Vec::new());
            }
        }
        Ok(newest_first
            .take_while(|info| Some(info.signature) != query.until)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn get_transaction_logs(&self, signature: &Signature) -> Result<Option<TransactionLogs>> {
        self.ensure_available()?;
        Ok(self.state.lock().journal.transactions.get(signature).cloned())
    }

    async fn subscribe_logs(&self, program: &Pubkey) -> Result<LogStream> {
        self.ensure_available()?;
        let program = *program;
        let stream = BroadcastStream::new(self.live.subscribe()).filter_map(move |item| {
            let logs = match item {
                Ok((programs, logs)) if programs.contains(&program) => Some(logs),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(program = %program, error = %e, "Simulated subscription lagged");
                    None
                }
            };
            futures::future::ready(logs)
        });
        Ok(stream.boxed())
    }

    async fn latest_blockhash(&self) -> Result<RecentBlockhash> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        let validity = state.blockhash_validity;
        let journal = &mut state.journal;
        journal.counter += 1;

        let mut seed = b"blockhash".to_vec();
        seed.extend_from_slice(&journal.counter.to_le_bytes());
        let blockhash = Hash::digest(&seed);
        let last_valid_block_height = journal.block_height + validity;
        journal.blockhashes.insert(blockhash, last_valid_block_height);
        Ok(RecentBlockhash {
            blockhash,
            last_valid_block_height,
        })
    }

    async fn block_height(&self) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        // Blocks keep coming even when nothing lands
        if state.drop_transactions {
            state.journal.block_height += 1;
        }
        Ok(state.journal.block_height)
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<Signature> {
        self.ensure_available()?;
        tx.verify().map_err(|e| Error::TransactionRejected(e.to_string()))?;
        let signature = tx
            .signature()
            .copied()
            .ok_or_else(|| Error::TransactionRejected("transaction has no signatures".to_string()))?;

        let mut state = self.state.lock();
        match state.journal.blockhashes.get(&tx.message.recent_blockhash) {
            Some(last_valid) if *last_valid >= state.journal.block_height => {}
            Some(_) => return Err(Error::TransactionRejected("Blockhash expired".to_string())),
            None => return Err(Error::TransactionRejected("Blockhash not found".to_string())),
        }
        if state.journal.statuses.contains_key(&signature) {
            return Err(Error::TransactionRejected("Transaction already processed".to_string()));
        }
        if state.drop_transactions {
            debug!(signature = %signature.short(), "Dropping simulated transaction");
            return Ok(signature);
        }

        let now = state.now;
        let mut draft = state.accounts.clone();
        match self.dispatch(&mut draft, tx, now) {
            Ok(invocations) => {
                state.accounts = draft;
                self.record(&mut state, signature, invocations, None);
            }
            Err(err) => {
                let programs = tx
                    .message
                    .instructions
                    .iter()
                    .filter_map(|ix| tx.message.resolve(ix).ok().map(|(program, _)| program))
                    .map(|program| Invocation {
                        program,
                        events: Vec::new(),
                    })
                    .collect();
                self.record(&mut state, signature, programs, Some(err.to_string()));
            }
        }
        Ok(signature)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<TxStatus> {
        self.ensure_available()?;
        Ok(self
            .state
            .lock()
            .journal
            .statuses
            .get(signature)
            .cloned()
            .unwrap_or(TxStatus::Pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Pubkey {
        Pubkey::new([b; 32])
    }

    #[tokio::test]
    async fn test_history_pagination_newest_first() {
        let ledger = SimulatedLedger::new();
        let operator = key(1);
        ledger.mint_to(&operator, 1_000_000_000).unwrap();
        let vault = ledger.create_vault(VaultSetup::new(operator, key(2), key(3))).unwrap();
        let mut sigs = vec![];
        for _ in 0..5 {
            sigs.push(ledger.stake_bond(&operator, 1).unwrap());
        }

        let program = ledger.vault_program();
        let page = ledger
            .get_signatures(&program, SignatureQuery { limit: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|i| i.signature).collect::<Vec<_>>(), vec![sigs[4], sigs[3]]);

        let next = ledger
            .get_signatures(
                &program,
                SignatureQuery {
                    before: Some(sigs[3]),
                    until: Some(sigs[0]),
                    limit: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(next.iter().map(|i| i.signature).collect::<Vec<_>>(), vec![sigs[2], sigs[1]]);
        assert!(ledger.vault(&vault).is_some());
    }

    #[tokio::test]
    async fn test_failed_operation_lands_without_state_change() {
        let ledger = SimulatedLedger::new();
        let operator = key(1);
        let vault = ledger.create_vault(VaultSetup::new(operator, key(2), key(3))).unwrap();

        // No funds for the bond
        let err = ledger.stake_bond(&operator, 10).unwrap_err();
        assert!(matches!(err, Error::Ledger(ref e) if e.rejection() == Some(RejectionCode::InsufficientFunds)));
        assert_eq!(ledger.vault(&vault).unwrap().operator_bond, 0);

        let history = ledger
            .get_signatures(&ledger.vault_program(), SignatureQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].err.is_some());
    }

    #[tokio::test]
    async fn test_account_reads_decode() {
        let ledger = SimulatedLedger::new();
        let operator = key(1);
        ledger.mint_to(&operator, 500_000_000).unwrap();
        let vault = ledger.create_vault(VaultSetup::new(operator, key(2), key(3))).unwrap();
        ledger.stake_bond(&operator, 100_000_000).unwrap();

        let state = ledger.get_vault(&vault).await.unwrap().unwrap();
        assert_eq!(state.operator_bond, 100_000_000);
        let balance = ledger.get_token_balance(&state.vault_token_account).await.unwrap();
        assert_eq!(balance, Some(100_000_000));
        assert_eq!(ledger.get_vault(&key(9)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_queries_time_out() {
        let ledger = SimulatedLedger::new();
        ledger.set_unavailable(true);
        let err = ledger.block_height().await.unwrap_err();
        assert!(err.is_transient());
    }
}
