//! Single-writer ownership of the indexed state
//!
//! One task owns the stats map, API counters, cursors and the dirty
//! generation. Ingestion, refreshes, reads and snapshotting all go through
//! a cloneable [`StatsHandle`]; reads get clones, never references.
//!
//! ```text
//!  backfill ──┐
//!  live logs ─┤                      ┌──────────────────────────┐
//!  refresher ─┼── StatsHandle ─mpsc─▶│ StatsActor (single task) │
//!  queries ───┤                      │  stats, cursors, dedup   │
//!  snapshots ─┘                      └──────────────────────────┘
//! ```

use crate::checkpoint::{Cursor, Snapshot, Source, SNAPSHOT_VERSION};
use crate::directory::Mappings;
use crate::stats::{AgentStats, EventContext};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot};
use vault_ledger::{LedgerEvent, Pubkey, Signature};

/// Signatures remembered per source for duplicate detection
pub const DEDUP_CAPACITY: usize = 10_000;

/// A transaction's decoded events, ready to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTransaction {
    /// Program the transaction was read from
    pub source: Source,
    /// Transaction signature
    pub signature: Signature,
    /// Slot the transaction landed in
    pub slot: u64,
    /// Block time (unix seconds)
    pub timestamp: i64,
    /// Execution failed on the ledger; advances the cursor only
    pub failed: bool,
    /// Events the source program emitted
    pub events: Vec<LedgerEvent>,
}

/// Result of applying one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Already applied from this source
    pub duplicate: bool,
    /// Events that reached a vault's stats
    pub applied: usize,
    /// Vaults whose balances should be re-read
    pub refresh: Vec<Pubkey>,
}

/// Counters reported by the actor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActorStatus {
    /// Events applied since start (including restored state)
    pub events_indexed: u64,
    /// Vaults with stats
    pub vaults_with_stats: usize,
}

/// Message sent to the stats actor
#[derive(Debug)]
pub enum StatsMessage {
    /// Apply a transaction's events
    Apply {
        tx: IndexedTransaction,
        response: oneshot::Sender<ApplyOutcome>,
    },

    /// Overwrite balances from a point read
    Refresh {
        vault: Pubkey,
        tvl: u64,
        operator_bond: u64,
        paused: bool,
        now_ms: i64,
        response: oneshot::Sender<()>,
    },

    /// Count an API call for an agent
    IncrementApiCalls {
        agent_id: String,
        response: oneshot::Sender<()>,
    },

    /// Replace directory lookups
    SetMappings {
        mappings: Mappings,
        response: oneshot::Sender<()>,
    },

    /// Read stats of some vaults
    GetStats {
        vaults: Vec<Pubkey>,
        response: oneshot::Sender<HashMap<Pubkey, AgentStats>>,
    },

    /// Read a source cursor
    GetCursor {
        source: Source,
        response: oneshot::Sender<Option<Cursor>>,
    },

    /// Load persisted state
    Restore {
        snapshot: Snapshot,
        response: oneshot::Sender<()>,
    },

    /// Copy state for persistence; `None` when nothing changed and not forced
    TakeSnapshot {
        force: bool,
        now_ms: i64,
        response: oneshot::Sender<Option<(Snapshot, u64)>>,
    },

    /// A snapshot of `generation` was written
    MarkPersisted {
        generation: u64,
        response: oneshot::Sender<()>,
    },

    /// Read counters
    Status {
        response: oneshot::Sender<ActorStatus>,
    },

    /// Shutdown actor
    Shutdown,
}

#[derive(Debug, Default)]
struct RecentSignatures {
    order: VecDeque<Signature>,
    seen: HashSet<Signature>,
}

impl RecentSignatures {
    /// Remember `signature`; false if it was already known
    fn insert(&mut self, signature: Signature) -> bool {
        if !self.seen.insert(signature) {
            return false;
        }
        self.order.push_back(signature);
        if self.order.len() > DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Actor that owns the indexed state
#[derive(Debug)]
pub struct StatsActor {
    mailbox: mpsc::Receiver<StatsMessage>,
    stats: HashMap<Pubkey, AgentStats>,
    api_calls: HashMap<String, u64>,
    cursors: HashMap<Source, Cursor>,
    recent: HashMap<Source, RecentSignatures>,
    mappings: Mappings,
    events_indexed: u64,
    generation: u64,
    persisted_generation: u64,
}

impl StatsActor {
    /// Create new actor
    pub fn new(mailbox: mpsc::Receiver<StatsMessage>) -> Self {
        Self {
            mailbox,
            stats: HashMap::new(),
            api_calls: HashMap::new(),
            cursors: HashMap::new(),
            recent: HashMap::new(),
            mappings: Mappings::default(),
            events_indexed: 0,
            generation: 0,
            persisted_generation: 0,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let StatsMessage::Shutdown = msg {
                tracing::debug!("Stats actor shutting down");
                break;
            }
            self.handle_message(msg);
        }
    }

    fn handle_message(&mut self, msg: StatsMessage) {
        match msg {
            StatsMessage::Apply { tx, response } => {
                let outcome = self.apply(tx);
                let _ = response.send(outcome);
            }

            StatsMessage::Refresh {
                vault,
                tvl,
                operator_bond,
                paused,
                now_ms,
                response,
            } => {
                self.stats
                    .entry(vault)
                    .or_default()
                    .apply_refresh(tvl, operator_bond, paused, now_ms);
                self.touch();
                let _ = response.send(());
            }

            StatsMessage::IncrementApiCalls { agent_id, response } => {
                *self.api_calls.entry(agent_id).or_insert(0) += 1;
                self.touch();
                let _ = response.send(());
            }

            StatsMessage::SetMappings { mappings, response } => {
                self.mappings = mappings;
                let _ = response.send(());
            }

            StatsMessage::GetStats { vaults, response } => {
                let found = vaults
                    .into_iter()
                    .filter_map(|vault| self.stats_of(&vault).map(|stats| (vault, stats)))
                    .collect();
                let _ = response.send(found);
            }

            StatsMessage::GetCursor { source, response } => {
                let _ = response.send(self.cursors.get(&source).copied());
            }

            StatsMessage::Restore { snapshot, response } => {
                self.restore(snapshot);
                let _ = response.send(());
            }

            StatsMessage::TakeSnapshot {
                force,
                now_ms,
                response,
            } => {
                let taken = if force || self.generation != self.persisted_generation {
                    Some((self.snapshot(now_ms), self.generation))
                } else {
                    None
                };
                let _ = response.send(taken);
            }

            StatsMessage::MarkPersisted { generation, response } => {
                self.persisted_generation = self.persisted_generation.max(generation);
                let _ = response.send(());
            }

            StatsMessage::Status { response } => {
                let _ = response.send(ActorStatus {
                    events_indexed: self.events_indexed,
                    vaults_with_stats: self.stats.len(),
                });
            }

            StatsMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn touch(&mut self) {
        self.generation += 1;
    }

    fn apply(&mut self, tx: IndexedTransaction) -> ApplyOutcome {
        if !self.recent.entry(tx.source).or_default().insert(tx.signature) {
            return ApplyOutcome {
                duplicate: true,
                ..Default::default()
            };
        }

        let next = Cursor {
            signature: tx.signature,
            slot: tx.slot,
        };
        match self.cursors.get(&tx.source) {
            Some(current) if !current.admits(&next) => {}
            _ => {
                self.cursors.insert(tx.source, next);
            }
        }
        self.touch();

        let mut outcome = ApplyOutcome::default();
        if tx.failed {
            return outcome;
        }

        let ctx = EventContext {
            signature: tx.signature,
            timestamp: tx.timestamp,
        };
        for event in &tx.events {
            let vault = match self.vault_of(event) {
                Some(vault) => vault,
                None => {
                    tracing::debug!(event = event.name(), "Event for an unknown registry, skipping");
                    continue;
                }
            };
            let needs_refresh = self.stats.entry(vault).or_default().apply(event, &ctx);
            if needs_refresh && !outcome.refresh.contains(&vault) {
                outcome.refresh.push(vault);
            }
            outcome.applied += 1;
            self.events_indexed += 1;
        }
        outcome
    }

    fn vault_of(&self, event: &LedgerEvent) -> Option<Pubkey> {
        event.vault().or_else(|| {
            event
                .registry()
                .and_then(|registry| self.mappings.registry_to_vault.get(&registry).copied())
        })
    }

    fn stats_of(&self, vault: &Pubkey) -> Option<AgentStats> {
        let mut stats = self.stats.get(vault)?.clone();
        stats.api_calls = self
            .mappings
            .vault_to_agent
            .get(vault)
            .and_then(|agent| self.api_calls.get(agent))
            .copied()
            .unwrap_or(0);
        Some(stats)
    }

    fn snapshot(&self, now_ms: i64) -> Snapshot {
        let mut last_signatures = BTreeMap::new();
        let mut last_slots = BTreeMap::new();
        for source in Source::ALL {
            let cursor = self.cursors.get(&source);
            last_signatures.insert(source, cursor.map(|c| c.signature));
            if let Some(cursor) = cursor {
                last_slots.insert(source, cursor.slot);
            }
        }

        Snapshot {
            version: SNAPSHOT_VERSION,
            last_signatures,
            last_slots,
            agent_stats: self
                .stats
                .keys()
                .filter_map(|vault| self.stats_of(vault).map(|stats| (*vault, stats)))
                .collect(),
            api_calls: self.api_calls.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            saved_at: now_ms,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.cursors = Source::ALL
            .iter()
            .filter_map(|source| snapshot.cursor(*source).map(|cursor| (*source, cursor)))
            .collect();
        self.stats = snapshot.agent_stats.into_iter().collect();
        self.api_calls = snapshot.api_calls.into_iter().collect();
        self.recent.clear();
        self.generation = 0;
        self.persisted_generation = 0;
        tracing::info!(
            vaults = self.stats.len(),
            cursors = self.cursors.len(),
            "Restored indexer state from snapshot"
        );
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct StatsHandle {
    sender: mpsc::Sender<StatsMessage>,
}

impl StatsHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<StatsMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> StatsMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Apply a transaction
    pub async fn apply(&self, tx: IndexedTransaction) -> Result<ApplyOutcome> {
        self.request(|response| StatsMessage::Apply { tx, response }).await
    }

    /// Overwrite balances of a vault
    pub async fn refresh(&self, vault: Pubkey, tvl: u64, operator_bond: u64, paused: bool) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.request(|response| StatsMessage::Refresh {
            vault,
            tvl,
            operator_bond,
            paused,
            now_ms,
            response,
        })
        .await
    }

    /// Count an API call
    pub async fn increment_api_calls(&self, agent_id: impl Into<String>) -> Result<()> {
        let agent_id = agent_id.into();
        self.request(|response| StatsMessage::IncrementApiCalls { agent_id, response })
            .await
    }

    /// Replace directory lookups
    pub async fn set_mappings(&self, mappings: Mappings) -> Result<()> {
        self.request(|response| StatsMessage::SetMappings { mappings, response })
            .await
    }

    /// Stats of the given vaults that have any
    pub async fn get_stats(&self, vaults: Vec<Pubkey>) -> Result<HashMap<Pubkey, AgentStats>> {
        self.request(|response| StatsMessage::GetStats { vaults, response })
            .await
    }

    /// Cursor of a source
    pub async fn cursor(&self, source: Source) -> Result<Option<Cursor>> {
        self.request(|response| StatsMessage::GetCursor { source, response })
            .await
    }

    /// Load persisted state
    pub async fn restore(&self, snapshot: Snapshot) -> Result<()> {
        self.request(|response| StatsMessage::Restore { snapshot, response })
            .await
    }

    /// Copy state for persistence with its generation
    pub async fn take_snapshot(&self, force: bool) -> Result<Option<(Snapshot, u64)>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.request(|response| StatsMessage::TakeSnapshot {
            force,
            now_ms,
            response,
        })
        .await
    }

    /// Record that `generation` is durable
    pub async fn mark_persisted(&self, generation: u64) -> Result<()> {
        self.request(|response| StatsMessage::MarkPersisted { generation, response })
            .await
    }

    /// Read counters
    pub async fn status(&self) -> Result<ActorStatus> {
        self.request(|response| StatsMessage::Status { response }).await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(StatsMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the stats actor
pub fn spawn_stats_actor() -> StatsHandle {
    let (tx, rx) = mpsc::channel(1000); // Bounded channel for backpressure
    let actor = StatsActor::new(rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    StatsHandle::new(tx)
}
