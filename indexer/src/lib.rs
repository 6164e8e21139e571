//! Vault event indexer
//!
//! Change-data-capture of the vault and registry programs into per-vault
//! statistics, served to the API layer and persisted as periodic snapshots.
//!
//! # Architecture
//!
//! - **Backfill**: signature history replayed oldest-first from the last
//!   checkpoint, one source at a time, paced to respect node limits
//! - **Live subscription**: new transactions pushed through the same reducer
//! - **Single Writer**: one actor owns stats, counters and cursors
//! - **Refresh**: debounced point reads overwrite balances events cannot track
//! - **Snapshots**: dirty state written to a blob store on an interval
//!
//! # Invariants
//!
//! - Deterministic replay: same events from the same checkpoint → same stats
//! - Checkpoints never move backward
//! - A transaction signature is applied at most once per source

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod checkpoint;
pub mod config;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod refresh;
pub mod stats;

// Re-exports
pub use checkpoint::{
    BlobStore, CheckpointStore, Cursor, FileBlobStore, MemoryBlobStore, RocksDbBlobStore, Snapshot,
    Source,
};
pub use config::{Config, SnapshotBackend};
pub use directory::{AgentDirectory, AgentEntry, FileAgentDirectory, StaticAgentDirectory};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use pipeline::{EventIndexer, IndexerStatus};
pub use stats::{AgentStats, JobSummary, RevenueDay};
