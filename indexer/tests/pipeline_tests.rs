//! Indexer against the simulated ledger
//!
//! - Backfill rebuilds stats from history, paging and in order
//! - Live transactions flow through the same reducer
//! - Restart from a snapshot matches a full replay
//! - Snapshot failures keep the state dirty
//! - Startup returns before the backfill and snapshots cover it

use indexer::config::{BackfillConfig, RefreshConfig, SnapshotConfig};
use indexer::{
    AgentEntry, AgentStats, BlobStore, Config, EventIndexer, MemoryBlobStore, Snapshot, Source,
    StaticAgentDirectory,
};
use ledger_rpc::{LedgerClient, SignatureQuery, SimulatedLedger, VaultSetup};
use std::sync::Arc;
use std::time::Duration;
use vault_ledger::receipt::NewJob;
use vault_ledger::{Hash, JobStatus, Pubkey};

const SNAPSHOT_KEY: &str = "indexer-snapshot";

struct World {
    ledger: SimulatedLedger,
    operator: Pubkey,
    arbitrator: Pubkey,
    client: Pubkey,
    vault: Pubkey,
    registry: Pubkey,
}

fn world() -> World {
    let ledger = SimulatedLedger::new();
    let operator = Pubkey::new([7u8; 32]);
    let arbitrator = Pubkey::new([23u8; 32]);
    let client = Pubkey::new([20u8; 32]);
    let treasury = ledger.token_account(&Pubkey::new([22u8; 32])).unwrap();

    ledger.mint_to(&operator, 1_000_000_000).unwrap();
    let vault = ledger
        .create_vault(VaultSetup::new(operator, arbitrator, treasury))
        .unwrap();
    ledger.stake_bond(&operator, 100_000_000).unwrap();
    let registry = ledger
        .create_registry(&vault, Pubkey::new([21u8; 32]), 3_600, None)
        .unwrap();

    World {
        ledger,
        operator,
        arbitrator,
        client,
        vault,
        registry,
    }
}

impl World {
    fn config(&self) -> Config {
        Config {
            vault_program: self.ledger.vault_program(),
            registry_program: self.ledger.registry_program(),
            backfill: BackfillConfig {
                page_size: 2,
                page_pause_ms: 0,
                tx_pause_ms: 0,
            },
            refresh: RefreshConfig {
                debounce_secs: 0,
                startup_pause_ms: 0,
            },
            snapshot: SnapshotConfig {
                interval_secs: 3_600,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn directory(&self) -> Arc<StaticAgentDirectory> {
        Arc::new(StaticAgentDirectory::new(vec![AgentEntry {
            agent_id: "agent-1".to_string(),
            vault: Some(self.vault),
            registry: None,
        }]))
    }

    fn indexer(&self, directory: Arc<StaticAgentDirectory>, blobs: Arc<MemoryBlobStore>) -> EventIndexer {
        EventIndexer::new(self.config(), Arc::new(self.ledger.clone()), directory, blobs).unwrap()
    }

    fn record_job(&self, amount: u64) {
        self.ledger
            .record_job(
                &self.operator,
                &self.registry,
                NewJob {
                    client: self.client,
                    artifact_hash: Hash::digest(b"artifact"),
                    payment_amount: amount,
                    payment_tx_ref: [0u8; 64],
                },
            )
            .unwrap();
    }

    fn tvl(&self) -> u64 {
        let vault = self.ledger.vault(&self.vault).unwrap();
        self.ledger.balance(&vault.vault_token_account)
    }
}

async fn wait_for(indexer: &EventIndexer, vault: &Pubkey, check: impl Fn(&AgentStats) -> bool) -> AgentStats {
    for _ in 0..300 {
        if let Some(stats) = indexer.get_stats(vault).await.unwrap() {
            if check(&stats) {
                return stats;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("stats never reached the expected state");
}

async fn stored_snapshot(blobs: &MemoryBlobStore) -> Snapshot {
    let data = blobs.get(SNAPSHOT_KEY).await.unwrap().unwrap();
    Snapshot::decode(&data).unwrap().unwrap()
}

fn without_timestamps(mut stats: AgentStats) -> AgentStats {
    stats.updated_at = 0;
    stats
}

#[tokio::test]
async fn test_backfill_rebuilds_history() {
    let w = world();
    w.ledger.receive_revenue(&w.operator, 10_000_000).unwrap();
    w.record_job(10_000_000);
    w.ledger.receive_revenue(&w.operator, 10_000_000).unwrap();
    w.record_job(10_000_000);
    w.ledger.slash(&w.arbitrator, &w.vault, 0, 5_000_000, &w.client).unwrap();
    w.ledger.slash(&w.arbitrator, &w.vault, 1, 5_000_000, &w.client).unwrap();
    w.ledger.pause(&w.operator).unwrap();

    let indexer = w.indexer(w.directory(), Arc::new(MemoryBlobStore::new()));
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();

    let stats = indexer.get_stats(&w.vault).await.unwrap().unwrap();
    assert_eq!(stats.total_revenue, 5_000_000);
    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.total_slashed, 20_000_000);
    assert_eq!(stats.slash_events, 2);
    assert_eq!(stats.operator_bond, 80_000_000);
    assert_eq!(stats.tvl, w.tvl());
    assert!(stats.paused);
    assert_eq!(stats.jobs_recorded, 2);
    assert_eq!(stats.recent_jobs[0].job_id, 1);
    assert_eq!(stats.revenue_by_day.len(), 1);
    assert_eq!(stats.revenue_by_day[0].revenue, 5_000_000);

    let status = indexer.status().await.unwrap();
    assert!(status.initialized);
    assert_eq!(status.vaults_tracked, 1);
    assert_eq!(status.subscription_count, 2);
    assert!(status.events_indexed >= 7);
    assert!(status.last_backfill_time.is_some());

    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_live_transactions_update_stats() {
    let w = world();
    let indexer = w.indexer(w.directory(), Arc::new(MemoryBlobStore::new()));
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();

    w.ledger.receive_revenue(&w.operator, 10_000_000).unwrap();
    w.record_job(10_000_000);
    let stats = wait_for(&indexer, &w.vault, |s| s.total_revenue == 2_500_000 && s.jobs_recorded == 1).await;
    assert_eq!(stats.recent_jobs[0].status, JobStatus::Active);

    w.ledger.challenge(&w.client, &w.registry, 0).unwrap();
    wait_for(&indexer, &w.vault, |s| s.recent_jobs[0].status == JobStatus::Challenged).await;

    // Refresh after revenue picks up the new balance
    let tvl = w.tvl();
    wait_for(&indexer, &w.vault, |s| s.tvl == tvl).await;

    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_matches_full_replay() {
    let w = world();
    let blobs = Arc::new(MemoryBlobStore::new());
    w.ledger.receive_revenue(&w.operator, 10_000_000).unwrap();
    w.record_job(10_000_000);

    let first = w.indexer(w.directory(), blobs.clone());
    first.start().await.unwrap();
    first.wait_initialized().await.unwrap();
    first.shutdown().await.unwrap();
    let before = stored_snapshot(&blobs).await;

    // Activity while the indexer is down
    w.ledger.advance_clock(86_400);
    w.ledger.receive_revenue(&w.operator, 20_000_000).unwrap();
    w.record_job(20_000_000);
    w.ledger.slash(&w.arbitrator, &w.vault, 1, 5_000_000, &w.client).unwrap();

    let resumed = w.indexer(w.directory(), blobs.clone());
    resumed.start().await.unwrap();
    resumed.wait_initialized().await.unwrap();
    let resumed_stats = resumed.get_stats(&w.vault).await.unwrap().unwrap();
    resumed.shutdown().await.unwrap();

    let fresh = w.indexer(w.directory(), Arc::new(MemoryBlobStore::new()));
    fresh.start().await.unwrap();
    fresh.wait_initialized().await.unwrap();
    let fresh_stats = fresh.get_stats(&w.vault).await.unwrap().unwrap();
    fresh.shutdown().await.unwrap();

    assert_eq!(resumed_stats.total_revenue, 7_500_000);
    assert_eq!(resumed_stats.revenue_by_day.len(), 2);
    assert_eq!(without_timestamps(resumed_stats), without_timestamps(fresh_stats));

    // Checkpoints only move forward
    let after = stored_snapshot(&blobs).await;
    for source in Source::ALL {
        let old = before.cursor(source).unwrap();
        let new = after.cursor(source).unwrap();
        assert!(new.slot >= old.slot);
    }
    assert!(after.cursor(Source::Vault).unwrap().slot > before.cursor(Source::Vault).unwrap().slot);
}

#[tokio::test]
async fn test_failed_transaction_advances_cursor_only() {
    let w = world();
    w.ledger.pause(&w.operator).unwrap();
    assert!(w.ledger.receive_revenue(&w.operator, 10_000_000).is_err());
    let failed = w
        .ledger
        .get_signatures(&w.ledger.vault_program(), SignatureQuery { limit: 1, ..Default::default() })
        .await
        .unwrap()
        .remove(0);
    assert!(failed.err.is_some());

    let blobs = Arc::new(MemoryBlobStore::new());
    let indexer = w.indexer(w.directory(), blobs.clone());
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();
    assert!(indexer.snapshot_now().await.unwrap());

    let stats = indexer.get_stats(&w.vault).await.unwrap().unwrap();
    assert_eq!(stats.total_revenue, 0);
    assert_eq!(stored_snapshot(&blobs).await.cursor(Source::Vault).unwrap().signature, failed.signature);
    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_failure_keeps_state_dirty() {
    let w = world();
    let blobs = Arc::new(MemoryBlobStore::new());
    let indexer = w.indexer(w.directory(), blobs.clone());
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();
    // Let refreshes scheduled during backfill land
    tokio::time::sleep(Duration::from_millis(100)).await;

    blobs.set_failing(true);
    assert!(indexer.snapshot_now().await.is_err());
    assert_eq!(indexer.metrics().snapshot_failures.get(), 1);
    assert!(blobs.is_empty());

    blobs.set_failing(false);
    assert!(indexer.snapshot_now().await.unwrap());
    assert!(!indexer.snapshot_now().await.unwrap());
    assert_eq!(indexer.metrics().snapshot_writes.get(), 1);
    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registry_events_need_a_known_agent() {
    let w = world();
    w.record_job(1_000_000);
    let directory = Arc::new(StaticAgentDirectory::new(Vec::new()));
    let indexer = w.indexer(directory.clone(), Arc::new(MemoryBlobStore::new()));
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();

    // Vault events apply regardless; registry events are skipped
    let stats = indexer.get_stats(&w.vault).await.unwrap().unwrap();
    assert_eq!(stats.jobs_recorded, 0);
    assert_eq!(indexer.status().await.unwrap().vaults_tracked, 0);

    directory.register(AgentEntry {
        agent_id: "agent-1".to_string(),
        vault: Some(w.vault),
        registry: Some(w.registry),
    });
    assert_eq!(indexer.refresh_mappings().await.unwrap(), 1);
    w.record_job(2_000_000);
    let stats = wait_for(&indexer, &w.vault, |s| s.jobs_recorded == 1).await;
    assert_eq!(stats.recent_jobs[0].payment_amount, 2_000_000);
    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_agent_lookup_and_api_calls() {
    let w = world();
    w.ledger.receive_revenue(&w.operator, 10_000_000).unwrap();
    let directory = Arc::new(StaticAgentDirectory::new(Vec::new()));
    let indexer = w.indexer(directory.clone(), Arc::new(MemoryBlobStore::new()));
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();

    assert!(indexer.get_stats_by_agent("agent-1").await.unwrap().is_none());

    // Registered after startup; the lookup reloads the directory
    directory.register(AgentEntry {
        agent_id: "agent-1".to_string(),
        vault: Some(w.vault),
        registry: None,
    });
    indexer.increment_api_calls("agent-1").await.unwrap();
    indexer.increment_api_calls("agent-1").await.unwrap();
    let stats = indexer.get_stats_by_agent("agent-1").await.unwrap().unwrap();
    assert_eq!(stats.total_revenue, 2_500_000);
    assert_eq!(stats.api_calls, 2);

    let many = indexer
        .get_stats_for_vaults(&[w.vault, Pubkey::new([99u8; 32])])
        .await
        .unwrap();
    assert_eq!(many.len(), 1);
    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unavailable_ledger_degrades() {
    let w = world();
    w.ledger.set_unavailable(true);
    let indexer = w.indexer(w.directory(), Arc::new(MemoryBlobStore::new()));
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();

    let status = indexer.status().await.unwrap();
    assert!(status.initialized);
    assert_eq!(status.subscription_count, 0);
    assert_eq!(status.events_indexed, 0);
    assert!(indexer.get_stats(&w.vault).await.unwrap().is_none());
    assert!(indexer.metrics().transient_failures.with_label_values(&["backfill"]).get() >= 2);
    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_live_transaction_advances_cursor() {
    let w = world();
    let blobs = Arc::new(MemoryBlobStore::new());
    let indexer = w.indexer(w.directory(), blobs.clone());
    indexer.start().await.unwrap();
    indexer.wait_initialized().await.unwrap();

    w.ledger.pause(&w.operator).unwrap();
    assert!(w.ledger.receive_revenue(&w.operator, 10_000_000).is_err());
    let failed = w
        .ledger
        .get_signatures(&w.ledger.vault_program(), SignatureQuery { limit: 1, ..Default::default() })
        .await
        .unwrap()
        .remove(0);
    assert!(failed.err.is_some());

    let mut cursor = None;
    for _ in 0..300 {
        indexer.snapshot_now().await.unwrap();
        if !blobs.is_empty() {
            cursor = stored_snapshot(&blobs).await.cursor(Source::Vault).map(|c| c.signature);
            if cursor == Some(failed.signature) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cursor, Some(failed.signature));

    let stats = indexer.get_stats(&w.vault).await.unwrap().unwrap();
    assert_eq!(stats.total_revenue, 0);
    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshots_taken_during_backfill() {
    let w = world();
    for _ in 0..20 {
        w.record_job(1_000_000);
    }
    let blobs = Arc::new(MemoryBlobStore::new());
    let mut config = w.config();
    config.backfill.tx_pause_ms = 100;
    config.snapshot.interval_secs = 1;
    let indexer = EventIndexer::new(config, Arc::new(w.ledger.clone()), w.directory(), blobs.clone()).unwrap();

    // Returns before the registry history has been replayed
    indexer.start().await.unwrap();
    assert!(!indexer.status().await.unwrap().initialized);

    let mut during_backfill = false;
    for _ in 0..150 {
        if !blobs.is_empty() {
            during_backfill = !indexer.status().await.unwrap().initialized;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(during_backfill, "no snapshot before the backfill finished");
    let partial = stored_snapshot(&blobs).await;
    assert!(partial.cursor(Source::Registry).is_some());
    indexer.shutdown().await.unwrap();

    // A restart resumes from the partial checkpoint
    let resumed = w.indexer(w.directory(), blobs.clone());
    resumed.start().await.unwrap();
    resumed.wait_initialized().await.unwrap();
    let stats = resumed.get_stats(&w.vault).await.unwrap().unwrap();
    assert_eq!(stats.jobs_recorded, 20);
    resumed.shutdown().await.unwrap();
}
