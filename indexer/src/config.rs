//! Configuration for the indexer

use ledger_rpc::RpcClientConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vault_ledger::pda::{DEFAULT_REGISTRY_PROGRAM_ID, DEFAULT_VAULT_PROGRAM_ID};
use vault_ledger::Pubkey;

/// Indexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ledger node connection
    pub rpc: RpcClientConfig,

    /// Vault program id
    pub vault_program: Pubkey,

    /// Registry program id
    pub registry_program: Pubkey,

    /// JSON file listing agents and their vaults
    pub directory_path: PathBuf,

    /// Backfill pacing
    pub backfill: BackfillConfig,

    /// Vault refresh pacing
    pub refresh: RefreshConfig,

    /// Snapshot persistence
    pub snapshot: SnapshotConfig,

    /// Time allowed for the final snapshot on shutdown (seconds)
    pub shutdown_grace_secs: u64,

    /// Emit logs as JSON
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcClientConfig::default(),
            vault_program: *DEFAULT_VAULT_PROGRAM_ID,
            registry_program: *DEFAULT_REGISTRY_PROGRAM_ID,
            directory_path: PathBuf::from("./data/agents.json"),
            backfill: BackfillConfig::default(),
            refresh: RefreshConfig::default(),
            snapshot: SnapshotConfig::default(),
            shutdown_grace_secs: 10,
            log_json: false,
        }
    }
}

/// Backfill configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Signatures requested per history page
    pub page_size: usize,

    /// Pause between history pages (milliseconds)
    pub page_pause_ms: u64,

    /// Pause between transaction fetches (milliseconds)
    pub tx_pause_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            page_pause_ms: 200,
            tx_pause_ms: 100,
        }
    }
}

/// Vault refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Minimum interval between refreshes of one vault (seconds)
    pub debounce_secs: u64,

    /// Pause between vaults during the startup refresh (milliseconds)
    pub startup_pause_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 30,
            startup_pause_ms: 200,
        }
    }
}

/// Where snapshots are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SnapshotBackend {
    /// One JSON file per key in a directory
    File {
        /// Directory holding the snapshot files
        path: PathBuf,
    },
    /// RocksDB column family
    RocksDb {
        /// Database directory
        path: PathBuf,
    },
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot every N seconds when something changed
    pub interval_secs: u64,

    /// Logical name of the snapshot blob
    pub key: String,

    /// Storage backend
    pub backend: SnapshotBackend,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            key: "indexer-snapshot".to_string(),
            backend: SnapshotBackend::File {
                path: PathBuf::from("./data/snapshots"),
            },
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("INDEXER_RPC_URL") {
            config.rpc.url = url;
        }

        if let Ok(id) = std::env::var("INDEXER_VAULT_PROGRAM_ID") {
            config.vault_program = id
                .parse()
                .map_err(|e| crate::Error::Config(format!("INDEXER_VAULT_PROGRAM_ID: {}", e)))?;
        }

        if let Ok(id) = std::env::var("INDEXER_REGISTRY_PROGRAM_ID") {
            config.registry_program = id
                .parse()
                .map_err(|e| crate::Error::Config(format!("INDEXER_REGISTRY_PROGRAM_ID: {}", e)))?;
        }

        if let Ok(path) = std::env::var("INDEXER_DIRECTORY_PATH") {
            config.directory_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("INDEXER_SNAPSHOT_PATH") {
            config.snapshot.backend = SnapshotBackend::File {
                path: PathBuf::from(path),
            };
        }

        if let Ok(path) = std::env::var("INDEXER_ROCKSDB_PATH") {
            config.snapshot.backend = SnapshotBackend::RocksDb {
                path: PathBuf::from(path),
            };
        }

        if let Ok(json) = std::env::var("INDEXER_LOG_JSON") {
            config.log_json = json == "1" || json.eq_ignore_ascii_case("true");
        }

        Ok(config)
    }

    pub(crate) fn debounce(&self) -> Duration {
        Duration::from_secs(self.refresh.debounce_secs)
    }

    pub(crate) fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot.interval_secs.max(1))
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backfill.page_size, 1000);
        assert_eq!(config.refresh.debounce_secs, 30);
        assert_eq!(config.snapshot.interval_secs, 60);
        assert_eq!(config.snapshot.key, "indexer-snapshot");
        assert_eq!(config.vault_program, *DEFAULT_VAULT_PROGRAM_ID);
    }

    #[test]
    fn test_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indexer.toml");
        let mut config = Config::default();
        config.snapshot.backend = SnapshotBackend::RocksDb {
            path: PathBuf::from("/var/lib/indexer"),
        };
        config.backfill.page_size = 250;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.backfill.page_size, 250);
        assert_eq!(loaded.snapshot.backend, config.snapshot.backend);
        assert_eq!(loaded.registry_program, config.registry_program);
    }
}
