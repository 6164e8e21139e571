//! Property tests for the reducer and replay
//!
//! - Resuming from a serialized snapshot gives the same stats as one pass
//! - Re-delivering already applied transactions changes nothing

use indexer::actor::{spawn_stats_actor, IndexedTransaction};
use indexer::directory::Mappings;
use indexer::stats::EventContext;
use indexer::{AgentStats, Source};
use proptest::prelude::*;
use vault_ledger::{LedgerEvent, Pubkey, Signature};

const START: i64 = 1_700_000_000;

fn vault() -> Pubkey {
    Pubkey::new([1u8; 32])
}

fn registry() -> Pubkey {
    Pubkey::new([2u8; 32])
}

fn event_strategy() -> impl Strategy<Value = LedgerEvent> {
    prop_oneof![
        (1u64..10_000_000).prop_map(|vault_cut| LedgerEvent::RevenueReceived {
            vault: vault(),
            amount: vault_cut * 4,
            job_id: 0,
            vault_cut,
            protocol_cut: vault_cut / 5,
        }),
        (1u64..5_000_000).prop_map(|payment| LedgerEvent::Slashed {
            vault: vault(),
            job_id: 0,
            slash_total: payment * 2,
            from_bond: payment * 2,
            from_pool: 0,
            client_amount: payment * 3 / 2,
            arbitrator_amount: payment / 5,
            protocol_amount: payment * 2 - payment * 3 / 2 - payment / 5,
        }),
        any::<bool>().prop_map(|paused| if paused {
            LedgerEvent::VaultPaused { vault: vault(), timestamp: START }
        } else {
            LedgerEvent::VaultUnpaused { vault: vault(), timestamp: START }
        }),
        (0u64..80).prop_map(|job_id| LedgerEvent::JobRecorded {
            registry: registry(),
            job_id,
            client: Pubkey::new([3u8; 32]),
            payment_amount: 1_000_000,
            created_at: START,
        }),
        (0u64..80).prop_map(|job_id| LedgerEvent::JobChallenged {
            registry: registry(),
            job_id,
            challenger: Pubkey::new([3u8; 32]),
            challenged_at: START,
        }),
        (0u64..80).prop_map(|job_id| LedgerEvent::JobFinalized {
            registry: registry(),
            job_id,
            finalized_at: START,
        }),
    ]
}

/// Events with the day (0..120) each one lands on
fn history() -> impl Strategy<Value = Vec<(LedgerEvent, i64)>> {
    prop::collection::vec((event_strategy(), 0i64..120), 1..120)
}

fn context(i: usize, day: i64) -> EventContext {
    let mut sig = [0u8; 64];
    sig[..8].copy_from_slice(&(i as u64).to_le_bytes());
    EventContext {
        signature: Signature::from_bytes(sig),
        timestamp: START + day * 86_400,
    }
}

fn transaction(i: usize, event: &LedgerEvent, day: i64) -> IndexedTransaction {
    let ctx = context(i, day);
    IndexedTransaction {
        source: if event.vault().is_some() { Source::Vault } else { Source::Registry },
        signature: ctx.signature,
        slot: i as u64 + 1,
        timestamp: ctx.timestamp,
        failed: false,
        events: vec![event.clone()],
    }
}

proptest! {
    #[test]
    fn prop_resume_from_snapshot_matches_single_pass(events in history(), split in 0usize..120) {
        let split = split.min(events.len());

        let mut single = AgentStats::default();
        for (i, (event, day)) in events.iter().enumerate() {
            single.apply(event, &context(i, *day));
        }

        let mut resumed = AgentStats::default();
        for (i, (event, day)) in events.iter().enumerate().take(split) {
            resumed.apply(event, &context(i, *day));
        }
        let json = serde_json::to_vec(&resumed).unwrap();
        let mut resumed: AgentStats = serde_json::from_slice(&json).unwrap();
        for (i, (event, day)) in events.iter().enumerate().skip(split) {
            resumed.apply(event, &context(i, *day));
        }

        prop_assert_eq!(single, resumed);
    }

    #[test]
    fn prop_redelivery_is_idempotent(events in history()) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let handle = spawn_stats_actor();
            let mut mappings = Mappings::default();
            mappings.registry_to_vault.insert(registry(), vault());
            handle.set_mappings(mappings).await.unwrap();

            for (i, (event, day)) in events.iter().enumerate() {
                handle.apply(transaction(i, event, *day)).await.unwrap();
            }
            let once = handle.get_stats(vec![vault()]).await.unwrap();
            let indexed = handle.status().await.unwrap().events_indexed;

            for (i, (event, day)) in events.iter().enumerate() {
                let outcome = handle.apply(transaction(i, event, *day)).await.unwrap();
                assert!(outcome.duplicate);
            }
            assert_eq!(handle.get_stats(vec![vault()]).await.unwrap(), once);
            assert_eq!(handle.status().await.unwrap().events_indexed, indexed);
            assert_eq!(indexed, events.len() as u64);
        });
    }
}
