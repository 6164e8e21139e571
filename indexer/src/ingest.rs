//! Transaction ingestion: backfill from history and live subscription
//!
//! Both paths funnel into [`Ingestor::ingest`], which decodes the source
//! program's events and hands them to the stats actor. The actor rejects
//! signatures it has already applied, so overlap between the end of a
//! backfill and the start of a subscription is harmless.

use crate::actor::{IndexedTransaction, StatsHandle};
use crate::checkpoint::Source;
use crate::config::BackfillConfig;
use crate::metrics::Metrics;
use crate::refresh::Refresher;
use crate::Result;
use futures::StreamExt;
use ledger_rpc::{LedgerClient, LogStream, SignatureQuery, TransactionLogs};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vault_ledger::events::parse_logs;
use vault_ledger::{Pubkey, Signature};

/// Result of one backfill run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Signatures listed in history
    pub signatures: usize,
    /// Transactions handed to the actor (including failed ones)
    pub processed: usize,
    /// Events applied
    pub events: usize,
    /// Run stopped early on an error
    pub interrupted: bool,
}

/// Decodes transactions of both programs and applies them
#[derive(Clone)]
pub struct Ingestor {
    client: Arc<dyn LedgerClient>,
    handle: StatsHandle,
    refresher: Refresher,
    metrics: Metrics,
    vault_program: Pubkey,
    registry_program: Pubkey,
    backfill: BackfillConfig,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("vault_program", &self.vault_program)
            .field("registry_program", &self.registry_program)
            .field("backfill", &self.backfill)
            .finish()
    }
}

impl Ingestor {
    /// Create ingestor
    pub fn new(
        client: Arc<dyn LedgerClient>,
        handle: StatsHandle,
        refresher: Refresher,
        metrics: Metrics,
        vault_program: Pubkey,
        registry_program: Pubkey,
        backfill: BackfillConfig,
    ) -> Self {
        Self {
            client,
            handle,
            refresher,
            metrics,
            vault_program,
            registry_program,
            backfill,
        }
    }

    /// Program id of a source
    pub fn program(&self, source: Source) -> Pubkey {
        match source {
            Source::Vault => self.vault_program,
            Source::Registry => self.registry_program,
        }
    }

    /// Decode and apply one transaction. Returns the number of events applied.
    pub async fn ingest(&self, source: Source, logs: TransactionLogs) -> Result<usize> {
        let program = self.program(source);
        let failed = logs.err.is_some();
        let parsed = if failed {
            Default::default()
        } else {
            parse_logs(&program, &logs.logs)
        };
        if parsed.undecodable > 0 {
            self.metrics.decode_failures.inc_by(parsed.undecodable as u64);
            tracing::warn!(
                signature = %logs.signature,
                count = parsed.undecodable,
                "Skipped undecodable event payloads"
            );
        }

        let tx = IndexedTransaction {
            source,
            signature: logs.signature,
            slot: logs.slot,
            timestamp: logs
                .block_time
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            failed,
            events: parsed.events,
        };
        let outcome = self.handle.apply(tx).await?;
        if outcome.duplicate {
            tracing::trace!(signature = %logs.signature, "Already applied");
            return Ok(0);
        }

        self.metrics
            .transactions_total
            .with_label_values(&[source.as_str()])
            .inc();
        self.metrics.events_total.inc_by(outcome.applied as u64);
        for vault in outcome.refresh {
            self.refresher.request(vault);
        }
        Ok(outcome.applied)
    }

    /// Replay history newer than `until`, oldest first.
    ///
    /// Pages are listed newest-first and all collected before any transaction
    /// is applied, so the cursor only moves forward. An error listing or
    /// fetching stops the run; the cursor then marks how far it got and the
    /// next run resumes from there.
    pub async fn backfill(&self, source: Source, until: Option<Signature>) -> BackfillReport {
        let program = self.program(source);
        let mut report = BackfillReport::default();

        let mut signatures = Vec::new();
        let mut before = None;
        loop {
            let query = SignatureQuery {
                before,
                until,
                limit: self.backfill.page_size,
            };
            let page = match self.client.get_signatures(&program, query).await {
                Ok(page) => page,
                Err(e) => {
                    self.metrics.transient("backfill");
                    tracing::warn!(source = %source, error = %e, "Listing history failed, backfill aborted");
                    report.interrupted = true;
                    return report;
                }
            };
            let last = page.last().map(|info| info.signature);
            let full = page.len() >= self.backfill.page_size;
            signatures.extend(page);

            match last {
                Some(last) if full => {
                    before = Some(last);
                    pause(self.backfill.page_pause_ms).await;
                }
                _ => break,
            }
        }
        report.signatures = signatures.len();
        tracing::info!(source = %source, count = signatures.len(), "Backfilling transactions");

        signatures.reverse();
        for info in signatures {
            let logs = match self.client.get_transaction_logs(&info.signature).await {
                Ok(Some(logs)) => logs,
                // History without logs still counts as seen
                Ok(None) => TransactionLogs {
                    signature: info.signature,
                    slot: info.slot,
                    block_time: info.block_time,
                    err: info.err.clone(),
                    logs: Vec::new(),
                },
                Err(e) => {
                    self.metrics.transient("backfill");
                    tracing::warn!(
                        source = %source,
                        signature = %info.signature,
                        error = %e,
                        "Fetching transaction failed, backfill stopped"
                    );
                    report.interrupted = true;
                    return report;
                }
            };

            match self.ingest(source, logs).await {
                Ok(events) => {
                    report.processed += 1;
                    report.events += events;
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Applying transaction failed, backfill stopped");
                    report.interrupted = true;
                    return report;
                }
            }
            pause(self.backfill.tx_pause_ms).await;
        }

        tracing::info!(
            source = %source,
            processed = report.processed,
            events = report.events,
            "Backfill complete"
        );
        report
    }

    /// Open the live log stream of `source`. Notifications buffer until
    /// [`Ingestor::follow`] consumes them.
    pub async fn subscribe(&self, source: Source) -> Result<LogStream> {
        let program = self.program(source);
        let stream = self.client.subscribe_logs(&program).await?;
        tracing::info!(source = %source, program = %program, "Subscribed to live logs");
        Ok(stream)
    }

    /// Apply live transactions from `stream` until `shutdown` flips
    pub async fn follow(&self, source: Source, mut stream: LogStream, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = stream.next() => {
                    let logs = match next {
                        Some(logs) => logs,
                        None => {
                            tracing::warn!(source = %source, "Log subscription ended");
                            break;
                        }
                    };
                    if let Err(e) = self.ingest(source, logs).await {
                        tracing::warn!(source = %source, error = %e, "Applying live transaction failed");
                    }
                }
            }
        }
    }
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
