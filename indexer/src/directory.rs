//! Agent directory: which vault and registry belong to which agent

use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use vault_ledger::{pda, Pubkey};

/// One registered agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    /// Agent identifier
    pub agent_id: String,
    /// Vault, once provisioned
    #[serde(default)]
    pub vault: Option<Pubkey>,
    /// Registry; derived from the vault when absent
    #[serde(default)]
    pub registry: Option<Pubkey>,
}

/// Source of agent registrations
#[async_trait]
pub trait AgentDirectory: Send + Sync + std::fmt::Debug {
    /// All known agents
    async fn agents(&self) -> Result<Vec<AgentEntry>>;
}

/// Agents listed in a JSON file, re-read on every call
#[derive(Debug, Clone)]
pub struct FileAgentDirectory {
    path: PathBuf,
}

impl FileAgentDirectory {
    /// Directory backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AgentDirectory for FileAgentDirectory {
    async fn agents(&self) -> Result<Vec<AgentEntry>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = ?self.path, "Agent directory file not found");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Agents held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticAgentDirectory {
    entries: Arc<RwLock<Vec<AgentEntry>>>,
}

impl StaticAgentDirectory {
    /// Directory with `entries`
    pub fn new(entries: Vec<AgentEntry>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    /// Add or replace an agent
    pub fn register(&self, entry: AgentEntry) {
        let mut entries = self.entries.write();
        entries.retain(|e| e.agent_id != entry.agent_id);
        entries.push(entry);
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn agents(&self) -> Result<Vec<AgentEntry>> {
        Ok(self.entries.read().clone())
    }
}

/// Lookup tables built from the directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mappings {
    /// Vault → agent
    pub vault_to_agent: HashMap<Pubkey, String>,
    /// Agent → vault
    pub agent_to_vault: HashMap<String, Pubkey>,
    /// Registry → vault
    pub registry_to_vault: HashMap<Pubkey, Pubkey>,
}

impl Mappings {
    /// Build lookups; agents without a vault are skipped
    pub fn build(entries: &[AgentEntry], registry_program: &Pubkey) -> Self {
        let mut mappings = Self::default();
        for entry in entries {
            let vault = match entry.vault {
                Some(vault) => vault,
                None => continue,
            };
            mappings.vault_to_agent.insert(vault, entry.agent_id.clone());
            mappings.agent_to_vault.insert(entry.agent_id.clone(), vault);

            let registry = match entry.registry {
                Some(registry) => Some(registry),
                None => pda::registry_address(registry_program, &vault)
                    .map_err(|e| tracing::warn!(vault = %vault, error = %e, "Cannot derive registry"))
                    .ok(),
            };
            if let Some(registry) = registry {
                mappings.registry_to_vault.insert(registry, vault);
            }
        }
        mappings
    }

    /// Vaults tracked
    pub fn vaults(&self) -> Vec<Pubkey> {
        let mut vaults: Vec<Pubkey> = self.vault_to_agent.keys().copied().collect();
        vaults.sort();
        vaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_ledger::pda::DEFAULT_REGISTRY_PROGRAM_ID;

    fn entry(id: &str, vault: Option<u8>, registry: Option<u8>) -> AgentEntry {
        AgentEntry {
            agent_id: id.to_string(),
            vault: vault.map(|b| Pubkey::new([b; 32])),
            registry: registry.map(|b| Pubkey::new([b; 32])),
        }
    }

    #[test]
    fn test_mappings_derive_missing_registry() {
        let entries = vec![entry("a", Some(1), Some(2)), entry("b", Some(3), None), entry("c", None, None)];
        let mappings = Mappings::build(&entries, &DEFAULT_REGISTRY_PROGRAM_ID);

        assert_eq!(mappings.vaults().len(), 2);
        assert_eq!(mappings.agent_to_vault["a"], Pubkey::new([1u8; 32]));
        assert_eq!(mappings.registry_to_vault[&Pubkey::new([2u8; 32])], Pubkey::new([1u8; 32]));

        let derived = pda::registry_address(&DEFAULT_REGISTRY_PROGRAM_ID, &Pubkey::new([3u8; 32])).unwrap();
        assert_eq!(mappings.registry_to_vault[&derived], Pubkey::new([3u8; 32]));
        assert!(!mappings.agent_to_vault.contains_key("c"));
    }

    #[tokio::test]
    async fn test_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        let vault = Pubkey::new([1u8; 32]);
        std::fs::write(&path, format!(r#"[{{"agentId":"agent-1","vault":"{}"}},{{"agentId":"agent-2"}}]"#, vault)).unwrap();

        let agents = FileAgentDirectory::new(&path).agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].vault, Some(vault));
        assert_eq!(agents[1].vault, None);

        let missing = FileAgentDirectory::new(dir.path().join("none.json"));
        assert!(missing.agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_directory_register_replaces() {
        let directory = StaticAgentDirectory::new(vec![entry("a", None, None)]);
        directory.register(entry("a", Some(1), None));
        let agents = directory.agents().await.unwrap();
        assert_eq!(agents, vec![entry("a", Some(1), None)]);
    }
}
