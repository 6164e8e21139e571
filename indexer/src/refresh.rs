//! Point reads of vault balances
//!
//! `tvl` and `operator_bond` drift from what events alone can reconstruct
//! (deposits and withdrawals move both pool and shares), so after any event
//! that moves balances the vault is re-read and the values overwritten.
//! Requests for one vault within the debounce interval collapse into one.

use crate::actor::StatsHandle;
use crate::metrics::Metrics;
use crate::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledger_rpc::LedgerClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vault_ledger::Pubkey;

/// Debounced vault refresher
#[derive(Clone)]
pub struct Refresher {
    client: Arc<dyn LedgerClient>,
    handle: StatsHandle,
    metrics: Metrics,
    debounce: Duration,
    last_requested: Arc<DashMap<Pubkey, Instant>>,
}

impl std::fmt::Debug for Refresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("debounce", &self.debounce)
            .field("pending", &self.last_requested.len())
            .finish()
    }
}

impl Refresher {
    /// Create refresher
    pub fn new(client: Arc<dyn LedgerClient>, handle: StatsHandle, metrics: Metrics, debounce: Duration) -> Self {
        Self {
            client,
            handle,
            metrics,
            debounce,
            last_requested: Arc::new(DashMap::new()),
        }
    }

    /// Schedule a refresh unless one was requested within the debounce interval.
    /// Returns whether a refresh was scheduled.
    pub fn request(&self, vault: Pubkey) -> bool {
        let now = Instant::now();
        let scheduled = match self.last_requested.entry(vault) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) >= self.debounce {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };

        if scheduled {
            let refresher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = refresher.refresh_now(vault).await {
                    if e.is_transient() {
                        refresher.metrics.transient("refresh");
                    }
                    tracing::warn!(vault = %vault, error = %e, "Vault refresh failed");
                }
            });
        }
        scheduled
    }

    /// Read the vault and its token balance now. Returns false if the vault
    /// account does not exist yet.
    pub async fn refresh_now(&self, vault: Pubkey) -> Result<bool> {
        // A direct read also opens a debounce window
        self.last_requested.insert(vault, Instant::now());

        let account = match self.client.get_vault(&vault).await? {
            Some(account) => account,
            None => {
                tracing::debug!(vault = %vault, "Vault not provisioned, skipping refresh");
                return Ok(false);
            }
        };
        let tvl = self
            .client
            .get_token_balance(&account.vault_token_account)
            .await?
            .unwrap_or(0);

        self.handle
            .refresh(vault, tvl, account.operator_bond, account.paused)
            .await?;
        self.metrics.refreshes_total.inc();
        tracing::debug!(vault = %vault, tvl, bond = account.operator_bond, "Vault refreshed");
        Ok(true)
    }
}
