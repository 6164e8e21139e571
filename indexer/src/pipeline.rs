//! The event indexer: startup, background tasks and the query surface

use crate::actor::{spawn_stats_actor, StatsHandle};
use crate::checkpoint::{BlobStore, CheckpointStore, Source};
use crate::config::Config;
use crate::directory::{AgentDirectory, Mappings};
use crate::ingest::Ingestor;
use crate::metrics::Metrics;
use crate::refresh::Refresher;
use crate::stats::AgentStats;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_rpc::LedgerClient;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vault_ledger::Pubkey;

/// Indexer health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStatus {
    /// Background startup finished
    pub initialized: bool,
    /// Vaults in the agent directory
    pub vaults_tracked: usize,
    /// Events applied
    pub events_indexed: u64,
    /// End of the startup backfill
    pub last_backfill_time: Option<DateTime<Utc>>,
    /// Live subscriptions running
    pub subscription_count: usize,
}

#[derive(Debug, Default)]
struct RunState {
    last_backfill: Option<DateTime<Utc>>,
    subscriptions: usize,
}

/// Builds and serves per-vault statistics from ledger events
pub struct EventIndexer {
    config: Config,
    client: Arc<dyn LedgerClient>,
    directory: Arc<dyn AgentDirectory>,
    checkpoints: CheckpointStore,
    handle: StatsHandle,
    ingestor: Ingestor,
    refresher: Refresher,
    metrics: Metrics,
    mappings: Arc<RwLock<Mappings>>,
    state: Arc<RwLock<RunState>>,
    initialized: Arc<watch::Sender<bool>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for EventIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIndexer")
            .field("vault_program", &self.config.vault_program)
            .field("registry_program", &self.config.registry_program)
            .field("initialized", &*self.initialized.borrow())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl EventIndexer {
    /// Create an indexer. Must be called inside a Tokio runtime; the stats
    /// actor is spawned immediately.
    pub fn new(
        config: Config,
        client: Arc<dyn LedgerClient>,
        directory: Arc<dyn AgentDirectory>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let metrics = Metrics::new()?;
        let handle = spawn_stats_actor();
        let refresher = Refresher::new(client.clone(), handle.clone(), metrics.clone(), config.debounce());
        let ingestor = Ingestor::new(
            client.clone(),
            handle.clone(),
            refresher.clone(),
            metrics.clone(),
            config.vault_program,
            config.registry_program,
            config.backfill.clone(),
        );
        let checkpoints = CheckpointStore::new(blobs, config.snapshot.key.clone());
        let (shutdown_tx, _) = watch::channel(false);
        let (initialized, _) = watch::channel(false);

        Ok(Self {
            config,
            client,
            directory,
            checkpoints,
            handle,
            ingestor,
            refresher,
            metrics,
            mappings: Arc::new(RwLock::new(Mappings::default())),
            state: Arc::new(RwLock::new(RunState::default())),
            initialized: Arc::new(initialized),
            shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Restore the last snapshot, load the directory and start snapshotting,
    /// then hand backfill, startup refreshes and subscriptions to a background
    /// task. Restored stats are served as soon as this returns;
    /// [`EventIndexer::wait_initialized`] resolves once the background part is
    /// done.
    ///
    /// Per-source failures are logged and leave that source stale; only a
    /// dead stats actor fails startup.
    pub async fn start(&self) -> Result<()> {
        if let Some(snapshot) = self.checkpoints.load().await {
            self.handle.restore(snapshot).await?;
        }
        if let Err(e) = self.refresh_mappings().await {
            tracing::warn!(error = %e, "Loading agent directory failed, continuing without mappings");
        }

        // Backfill progress is checkpointed too
        self.spawn_snapshot_loop();

        let bootstrap = Bootstrap {
            handle: self.handle.clone(),
            ingestor: self.ingestor.clone(),
            refresher: self.refresher.clone(),
            metrics: self.metrics.clone(),
            mappings: self.mappings.clone(),
            state: self.state.clone(),
            initialized: self.initialized.clone(),
            shutdown: self.shutdown_tx.subscribe(),
            tasks: self.tasks.clone(),
            startup_pause_ms: self.config.refresh.startup_pause_ms,
        };
        let shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = bootstrap.run() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Indexer startup failed");
                    }
                }
                _ = stopped(shutdown) => {
                    tracing::info!("Shutdown before startup finished, backfill abandoned");
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Wait for the background startup to finish. Fails if the indexer is
    /// shut down first.
    pub async fn wait_initialized(&self) -> Result<()> {
        let mut initialized = self.initialized.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        let ready = tokio::select! {
            biased;
            changed = initialized.wait_for(|ready| *ready) => changed.is_ok(),
            _ = stopped(shutdown) => false,
        };
        if ready {
            Ok(())
        } else {
            Err(Error::Concurrency("indexer stopped before initializing".to_string()))
        }
    }

    fn spawn_snapshot_loop(&self) {
        let handle = self.handle.clone();
        let checkpoints = self.checkpoints.clone();
        let metrics = self.metrics.clone();
        let period = self.config.snapshot_interval();
        let mut shutdown = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = persist(&handle, &checkpoints, &metrics, false).await {
                            tracing::warn!(error = %e, "Periodic snapshot failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stats of one vault
    pub async fn get_stats(&self, vault: &Pubkey) -> Result<Option<AgentStats>> {
        Ok(self.handle.get_stats(vec![*vault]).await?.remove(vault))
    }

    /// Stats of several vaults; vaults without stats are absent
    pub async fn get_stats_for_vaults(&self, vaults: &[Pubkey]) -> Result<HashMap<Pubkey, AgentStats>> {
        self.handle.get_stats(vaults.to_vec()).await
    }

    /// Stats of an agent's vault. An unknown agent triggers one directory
    /// reload before giving up.
    pub async fn get_stats_by_agent(&self, agent_id: &str) -> Result<Option<AgentStats>> {
        let known = self.mappings.read().agent_to_vault.get(agent_id).copied();
        let vault = match known {
            Some(vault) => vault,
            None => {
                self.refresh_mappings().await?;
                match self.mappings.read().agent_to_vault.get(agent_id).copied() {
                    Some(vault) => vault,
                    None => return Ok(None),
                }
            }
        };
        self.get_stats(&vault).await
    }

    /// Count an API call served for `agent_id`
    pub async fn increment_api_calls(&self, agent_id: &str) -> Result<()> {
        self.handle.increment_api_calls(agent_id).await
    }

    /// Rebuild vault/registry/agent lookups from the directory. Returns the
    /// number of vaults tracked.
    pub async fn refresh_mappings(&self) -> Result<usize> {
        let entries = self.directory.agents().await?;
        let mappings = Mappings::build(&entries, &self.config.registry_program);
        let tracked = mappings.vault_to_agent.len();

        self.handle.set_mappings(mappings.clone()).await?;
        *self.mappings.write() = mappings;
        self.metrics.vaults_tracked.set(tracked as i64);
        tracing::info!(vaults = tracked, "Agent mappings rebuilt");
        Ok(tracked)
    }

    /// Indexer health
    pub async fn status(&self) -> Result<IndexerStatus> {
        let actor = self.handle.status().await?;
        let initialized = *self.initialized.borrow();
        let state = self.state.read();
        Ok(IndexerStatus {
            initialized,
            vaults_tracked: self.mappings.read().vault_to_agent.len(),
            events_indexed: actor.events_indexed,
            last_backfill_time: state.last_backfill,
            subscription_count: state.subscriptions,
        })
    }

    /// Persist now if anything changed. Returns whether a snapshot was written.
    pub async fn snapshot_now(&self) -> Result<bool> {
        persist(&self.handle, &self.checkpoints, &self.metrics, false).await
    }

    /// Refresh one vault immediately, bypassing the debounce
    pub async fn refresh_vault(&self, vault: &Pubkey) -> Result<bool> {
        self.refresher.refresh_now(*vault).await
    }

    /// Ledger client in use
    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.client
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stop subscriptions and snapshotting, flush a final snapshot and stop
    /// the actor, all within the configured grace period
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let grace = self.config.shutdown_grace();

        let drain = async {
            // Startup may still be spawning followers
            loop {
                let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
                if tasks.is_empty() {
                    break;
                }
                for task in tasks {
                    let _ = task.await;
                }
            }
            persist(&self.handle, &self.checkpoints, &self.metrics, true).await
        };
        let result = match tokio::time::timeout(grace, drain).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                tracing::warn!(grace = ?grace, "Shutdown grace period elapsed before final snapshot");
                Ok(())
            }
        };

        self.initialized.send_replace(false);
        self.handle.shutdown().await?;
        tracing::info!("Event indexer stopped");
        result
    }
}

/// Startup work that runs after [`EventIndexer::start`] returns
struct Bootstrap {
    handle: StatsHandle,
    ingestor: Ingestor,
    refresher: Refresher,
    metrics: Metrics,
    mappings: Arc<RwLock<Mappings>>,
    state: Arc<RwLock<RunState>>,
    initialized: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    startup_pause_ms: u64,
}

impl Bootstrap {
    async fn run(self) -> Result<()> {
        let backfills = Source::ALL.iter().map(|&source| self.backfill(source));
        for result in futures::future::join_all(backfills).await {
            result?;
        }
        self.state.write().last_backfill = Some(Utc::now());

        let vaults = self.mappings.read().vaults();
        for (i, vault) in vaults.iter().enumerate() {
            if i > 0 && self.startup_pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.startup_pause_ms)).await;
            }
            if let Err(e) = self.refresher.refresh_now(*vault).await {
                tracing::warn!(vault = %vault, error = %e, "Startup refresh failed");
            }
        }

        for source in Source::ALL {
            let stream = match self.ingestor.subscribe(source).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.metrics.transient("subscribe");
                    tracing::warn!(source = %source, error = %e, "Subscription failed, source stays backfill-only");
                    continue;
                }
            };

            // Close the gap between the backfill and the subscription
            self.backfill(source).await?;

            let ingestor = self.ingestor.clone();
            let shutdown = self.shutdown.clone();
            let state = self.state.clone();
            self.state.write().subscriptions += 1;
            let task = tokio::spawn(async move {
                ingestor.follow(source, stream, shutdown).await;
                state.write().subscriptions -= 1;
            });
            self.tasks.lock().push(task);
        }

        self.initialized.send_replace(true);
        tracing::info!(
            vaults = vaults.len(),
            subscriptions = self.state.read().subscriptions,
            "Event indexer started"
        );
        Ok(())
    }

    /// Replay everything newer than the source's cursor
    async fn backfill(&self, source: Source) -> Result<()> {
        let until = self.handle.cursor(source).await?.map(|c| c.signature);
        self.ingestor.backfill(source, until).await;
        Ok(())
    }
}

/// Resolves once `shutdown` flips or its sender is gone
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Write a snapshot if the state is dirty (or `force`); the dirty state is
/// only cleared once the write succeeded
async fn persist(
    handle: &StatsHandle,
    checkpoints: &CheckpointStore,
    metrics: &Metrics,
    force: bool,
) -> Result<bool> {
    let (snapshot, generation) = match handle.take_snapshot(force).await? {
        Some(taken) => taken,
        None => return Ok(false),
    };

    match checkpoints.save(&snapshot).await {
        Ok(()) => {
            handle.mark_persisted(generation).await?;
            metrics.snapshot_writes.inc();
            tracing::debug!(generation, vaults = snapshot.agent_stats.len(), "Snapshot written");
            Ok(true)
        }
        Err(e) => {
            metrics.snapshot_failures.inc();
            if e.is_transient() {
                metrics.transient("snapshot");
            }
            Err(e)
        }
    }
}
