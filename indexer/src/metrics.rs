//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `indexer_events_total` - Events applied to stats
//! - `indexer_transactions_total` - Transactions processed, by source
//! - `indexer_decode_failures_total` - Event payloads that failed to decode
//! - `indexer_transient_failures_total` - Ledger or blob store failures, by operation
//! - `indexer_refreshes_total` - Vault point reads applied
//! - `indexer_snapshot_writes_total` / `indexer_snapshot_failures_total`
//! - `indexer_vaults_tracked` - Vaults in the agent directory

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Events applied
    pub events_total: IntCounter,

    /// Transactions processed
    pub transactions_total: IntCounterVec,

    /// Undecodable event payloads
    pub decode_failures: IntCounter,

    /// Transient failures
    pub transient_failures: IntCounterVec,

    /// Vault refreshes applied
    pub refreshes_total: IntCounter,

    /// Snapshots written
    pub snapshot_writes: IntCounter,

    /// Snapshot writes that failed
    pub snapshot_failures: IntCounter,

    /// Vaults in the directory
    pub vaults_tracked: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let events_total = IntCounter::new("indexer_events_total", "Events applied to stats")?;
        registry.register(Box::new(events_total.clone()))?;

        let transactions_total = IntCounterVec::new(
            Opts::new("indexer_transactions_total", "Transactions processed"),
            &["source"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let decode_failures = IntCounter::new(
            "indexer_decode_failures_total",
            "Event payloads that failed to decode",
        )?;
        registry.register(Box::new(decode_failures.clone()))?;

        let transient_failures = IntCounterVec::new(
            Opts::new("indexer_transient_failures_total", "Ledger or blob store failures"),
            &["operation"],
        )?;
        registry.register(Box::new(transient_failures.clone()))?;

        let refreshes_total = IntCounter::new("indexer_refreshes_total", "Vault point reads applied")?;
        registry.register(Box::new(refreshes_total.clone()))?;

        let snapshot_writes = IntCounter::new("indexer_snapshot_writes_total", "Snapshots written")?;
        registry.register(Box::new(snapshot_writes.clone()))?;

        let snapshot_failures = IntCounter::new(
            "indexer_snapshot_failures_total",
            "Snapshot writes that failed",
        )?;
        registry.register(Box::new(snapshot_failures.clone()))?;

        let vaults_tracked = IntGauge::new("indexer_vaults_tracked", "Vaults in the agent directory")?;
        registry.register(Box::new(vaults_tracked.clone()))?;

        Ok(Self {
            events_total,
            transactions_total,
            decode_failures,
            transient_failures,
            refreshes_total,
            snapshot_writes,
            snapshot_failures,
            vaults_tracked,
            registry,
        })
    }

    /// Count a transient failure of `operation`
    pub fn transient(&self, operation: &str) {
        self.transient_failures.with_label_values(&[operation]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("events_total", &self.events_total.get())
            .field("vaults_tracked", &self.vaults_tracked.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.events_total.inc();
        a.transient("backfill");
        assert_eq!(b.events_total.get(), 0);

        let text = a.render();
        assert!(text.contains("indexer_events_total 1"));
        assert!(text.contains("operation=\"backfill\""));
    }
}
