//! Checkpoint persistence
//!
//! The snapshot is one JSON document written wholesale under a fixed key:
//!
//! ```json
//! { "version": 1,
//!   "lastSignatures": { "vault": "<sig>", "registry": null },
//!   "lastSlots": { "vault": 1234 },
//!   "agentStats": { "<vault>": { ... } },
//!   "apiCalls": { "<agentId>": 12 },
//!   "savedAt": 1700000000000 }
//! ```
//!
//! # Backends
//!
//! - [`FileBlobStore`]: one file per key, replaced atomically by rename
//! - [`RocksDbBlobStore`]: `snapshots` column family
//! - [`MemoryBlobStore`]: tests and ephemeral runs

use crate::stats::AgentStats;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vault_ledger::{Pubkey, Signature};

/// Snapshot schema this build reads and writes
pub const SNAPSHOT_VERSION: u32 = 1;

/// Column family holding snapshots
const CF_SNAPSHOTS: &str = "snapshots";

/// An event source: one ledger program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Vault program
    Vault,
    /// Registry program
    Registry,
}

impl Source {
    /// Every source, in backfill order
    pub const ALL: [Source; 2] = [Source::Vault, Source::Registry];

    /// Label used in logs and snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Vault => "vault",
            Source::Registry => "registry",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last processed transaction of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Transaction signature
    pub signature: Signature,
    /// Slot of the transaction
    pub slot: u64,
}

impl Cursor {
    /// Whether moving to `next` keeps the cursor monotonic
    pub fn admits(&self, next: &Cursor) -> bool {
        next.slot >= self.slot
    }
}

/// Persisted indexer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Schema version
    pub version: u32,
    /// Cursor signature per source
    pub last_signatures: BTreeMap<Source, Option<Signature>>,
    /// Cursor slot per source
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_slots: BTreeMap<Source, u64>,
    /// Stats per vault
    pub agent_stats: BTreeMap<Pubkey, AgentStats>,
    /// API call counters per agent
    pub api_calls: BTreeMap<String, u64>,
    /// Write time (unix milliseconds)
    pub saved_at: i64,
}

impl Snapshot {
    /// Cursor of `source`, when both signature and slot are known
    pub fn cursor(&self, source: Source) -> Option<Cursor> {
        let signature = (*self.last_signatures.get(&source)?)?;
        Some(Cursor {
            signature,
            slot: self.last_slots.get(&source).copied().unwrap_or(0),
        })
    }

    /// Serialized form
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a stored snapshot; `None` for a version this build does not know
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let version = value.get("version").and_then(serde_json::Value::as_u64);
        if version != Some(SNAPSHOT_VERSION as u64) {
            tracing::warn!(version = ?version, "Ignoring snapshot with unknown version");
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}

/// Durable blob storage for snapshots
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Read a blob; `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a blob
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;
}

/// Blobs as files in a directory
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    /// Store rooted at `dir` (created on first write)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Blobs in a RocksDB column family
#[derive(Clone)]
pub struct RocksDbBlobStore {
    db: Arc<DB>,
}

impl std::fmt::Debug for RocksDbBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBlobStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDbBlobStore {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut cf_opts = Options::default();
        cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open_cf_descriptors(
            &db_opts,
            path,
            vec![ColumnFamilyDescriptor::new(CF_SNAPSHOTS, cf_opts)],
        )?;

        tracing::info!(path = ?path, "Opened RocksDB snapshot store");
        Ok(Self { db: Arc::new(db) })
    }

    fn read(db: &DB, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| Error::BlobStore(format!("column family {} missing", CF_SNAPSHOTS)))?;
        Ok(db.get_cf(&cf, key.as_bytes())?)
    }

    fn write(db: &DB, key: &str, data: &[u8]) -> Result<()> {
        let cf = db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| Error::BlobStore(format!("column family {} missing", CF_SNAPSHOTS)))?;
        db.put_cf(&cf, key.as_bytes(), data)?;
        db.flush_cf(&cf)?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for RocksDbBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::read(&db, &key))
            .await
            .map_err(|e| Error::BlobStore(format!("read task failed: {}", e)))?
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::write(&db, &key, &data))
            .await
            .map_err(|e| Error::BlobStore(format!("write task failed: {}", e)))?
    }
}

/// In-memory blobs; writes can be made to fail
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryBlobStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        if *self.failing.lock() {
            return Err(Error::BlobStore("memory store set to fail".to_string()));
        }
        self.blobs.lock().insert(key.to_string(), data);
        Ok(())
    }
}

/// Snapshot reads and writes under one key
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    blobs: Arc<dyn BlobStore>,
    key: String,
}

impl CheckpointStore {
    /// Store writing `key` into `blobs`
    pub fn new(blobs: Arc<dyn BlobStore>, key: impl Into<String>) -> Self {
        Self {
            blobs,
            key: key.into(),
        }
    }

    /// Latest usable snapshot. Missing, unreadable and unknown-version
    /// snapshots all yield `None`.
    pub async fn load(&self) -> Option<Snapshot> {
        let data = match self.blobs.get(&self.key).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::info!(key = %self.key, "No snapshot found, starting fresh");
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to read snapshot");
                return None;
            }
        };
        match Snapshot::decode(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Ignoring unreadable snapshot");
                None
            }
        }
    }

    /// Persist a snapshot
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.blobs.put(&self.key, snapshot.encode()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        let mut agent_stats = BTreeMap::new();
        agent_stats.insert(
            Pubkey::new([1u8; 32]),
            AgentStats {
                total_revenue: 2_500_000,
                total_jobs: 1,
                ..Default::default()
            },
        );
        let mut last_signatures = BTreeMap::new();
        last_signatures.insert(Source::Vault, Some(Signature::from_bytes([9u8; 64])));
        last_signatures.insert(Source::Registry, None);
        let mut last_slots = BTreeMap::new();
        last_slots.insert(Source::Vault, 42);

        Snapshot {
            version: SNAPSHOT_VERSION,
            last_signatures,
            last_slots,
            agent_stats,
            api_calls: BTreeMap::from([("agent-1".to_string(), 3)]),
            saved_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json: serde_json::Value = serde_json::from_slice(&snapshot().encode().unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["lastSignatures"]["registry"].is_null());
        assert_eq!(json["lastSlots"]["vault"], 42);
        assert_eq!(json["apiCalls"]["agent-1"], 3);
        assert_eq!(json["savedAt"], 1_700_000_000_000i64);
        let vault = Pubkey::new([1u8; 32]).to_string();
        assert_eq!(json["agentStats"][vault.as_str()]["totalRevenue"], 2_500_000);
    }

    #[test]
    fn test_unknown_version_ignored() {
        let mut json: serde_json::Value = serde_json::from_slice(&snapshot().encode().unwrap()).unwrap();
        json["version"] = serde_json::json!(2);
        let data = serde_json::to_vec(&json).unwrap();
        assert_eq!(Snapshot::decode(&data).unwrap(), None);
    }

    #[test]
    fn test_snapshot_without_slots_is_readable() {
        let mut json: serde_json::Value = serde_json::from_slice(&snapshot().encode().unwrap()).unwrap();
        json.as_object_mut().unwrap().remove("lastSlots");
        let decoded = Snapshot::decode(&serde_json::to_vec(&json).unwrap()).unwrap().unwrap();
        assert_eq!(decoded.cursor(Source::Vault).unwrap().slot, 0);
        assert_eq!(decoded.cursor(Source::Registry), None);
    }

    #[test]
    fn test_cursor_monotonic() {
        let at = |slot| Cursor {
            signature: Signature::from_bytes([slot as u8; 64]),
            slot,
        };
        assert!(at(5).admits(&at(6)));
        assert!(at(5).admits(&at(5)));
        assert!(!at(5).admits(&at(4)));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(Arc::new(FileBlobStore::new(dir.path().join("snaps"))), "indexer-snapshot");
        assert!(store.load().await.is_none());

        store.save(&snapshot()).await.unwrap();
        assert_eq!(store.load().await, Some(snapshot()));
        assert!(dir.path().join("snaps/indexer-snapshot.json").exists());
    }

    #[tokio::test]
    async fn test_rocksdb_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(Arc::new(RocksDbBlobStore::open(dir.path()).unwrap()), "indexer-snapshot");
        store.save(&snapshot()).await.unwrap();
        assert_eq!(store.load().await, Some(snapshot()));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_ignored() {
        let blobs = MemoryBlobStore::new();
        blobs.put("indexer-snapshot", b"{not json".to_vec()).await.unwrap();
        let store = CheckpointStore::new(Arc::new(blobs), "indexer-snapshot");
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_failure() {
        let blobs = MemoryBlobStore::new();
        blobs.set_failing(true);
        let store = CheckpointStore::new(Arc::new(blobs.clone()), "k");
        assert!(store.save(&snapshot()).await.unwrap_err().is_transient());
        assert!(blobs.is_empty());
    }
}
