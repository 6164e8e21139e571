//! Configuration for settlement

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vault_ledger::pda::{DEFAULT_REGISTRY_PROGRAM_ID, DEFAULT_VAULT_PROGRAM_ID};
use vault_ledger::vault::DEFAULT_MIN_PROTOCOL_FEE_BPS;
use vault_ledger::Pubkey;

/// Devnet USDC mint
const DEFAULT_USDC_MINT: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU";

/// Settlement dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vault program id
    pub vault_program: Pubkey,

    /// Registry program id
    pub registry_program: Pubkey,

    /// Payment token mint
    pub usdc_mint: Pubkey,

    /// Vault to settle against; derived from the signer (as operator) when unset
    #[serde(default)]
    pub vault: Option<Pubkey>,

    /// Upper bound for one settlement write, submission to confirmation (seconds)
    pub operation_timeout_secs: u64,

    /// Interval between confirmation polls (milliseconds)
    pub confirmation_poll_ms: u64,

    /// Lowest protocol fee a vault may charge
    pub min_protocol_fee_bps: u16,

    /// Signing strategy
    pub signer: SignerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_program: *DEFAULT_VAULT_PROGRAM_ID,
            registry_program: *DEFAULT_REGISTRY_PROGRAM_ID,
            // Literal above is valid base58
            usdc_mint: DEFAULT_USDC_MINT.parse().unwrap_or_default(),
            vault: None,
            operation_timeout_secs: 60,
            confirmation_poll_ms: 500,
            min_protocol_fee_bps: DEFAULT_MIN_PROTOCOL_FEE_BPS,
            signer: SignerConfig::default(),
        }
    }
}

/// Where signatures come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignerConfig {
    /// Ed25519 key held in process
    Local {
        /// Keypair file (JSON array of 64 bytes)
        keypair_path: PathBuf,
    },
    /// Managed signing service holding the key
    Remote {
        /// Service base URL
        endpoint: String,
        /// Key identifier at the service
        key_id: String,
        /// Request timeout (seconds)
        #[serde(default = "default_remote_timeout")]
        timeout_secs: u64,
    },
}

fn default_remote_timeout() -> u64 {
    10
}

impl Default for SignerConfig {
    fn default() -> Self {
        SignerConfig::Local {
            keypair_path: PathBuf::from("./keys/operator.json"),
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

        if let Ok(id) = std::env::var("SETTLEMENT_VAULT_PROGRAM_ID") {
            config.vault_program = parse_key("SETTLEMENT_VAULT_PROGRAM_ID", &id)?;
        }

        if let Ok(id) = std::env::var("SETTLEMENT_REGISTRY_PROGRAM_ID") {
            config.registry_program = parse_key("SETTLEMENT_REGISTRY_PROGRAM_ID", &id)?;
        }

        if let Ok(mint) = std::env::var("SETTLEMENT_USDC_MINT") {
            config.usdc_mint = parse_key("SETTLEMENT_USDC_MINT", &mint)?;
        }

        if let Ok(vault) = std::env::var("SETTLEMENT_VAULT") {
            config.vault = Some(parse_key("SETTLEMENT_VAULT", &vault)?);
        }

        if let Ok(secs) = std::env::var("SETTLEMENT_TIMEOUT_SECS") {
            config.operation_timeout_secs = secs
                .parse()
                .map_err(|e| crate::Error::Config(format!("SETTLEMENT_TIMEOUT_SECS: {}", e)))?;
        }

        if let Ok(path) = std::env::var("SETTLEMENT_KEYPAIR_PATH") {
            config.signer = SignerConfig::Local {
                keypair_path: PathBuf::from(path),
            };
        }

        // A configured signing service wins over a local key
        if let Ok(key_id) = std::env::var("SETTLEMENT_SIGNER_KEY_ID") {
            let endpoint = std::env::var("SETTLEMENT_SIGNER_ENDPOINT").map_err(|_| {
                crate::Error::Config("SETTLEMENT_SIGNER_KEY_ID set without SETTLEMENT_SIGNER_ENDPOINT".to_string())
            })?;
            config.signer = SignerConfig::Remote {
                endpoint,
                key_id,
                timeout_secs: default_remote_timeout(),
            };
        }

        Ok(config)
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub(crate) fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms)
    }
}

fn parse_key(var: &str, value: &str) -> crate::Result<Pubkey> {
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{}: {}", var, e)))
}
