//! Typed ledger events and their log encoding
//!
//! Programs emit events as `Program data: <base64>` log lines, each payload
//! an 8-byte `sha256("event:<Name>")` discriminator followed by borsh fields.
//! Events decode once here into [`LedgerEvent`]; consumers match on it
//! exhaustively.

use crate::codec::{discriminator, Reader, Writer};
use crate::types::{JobStatus, Pubkey};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

const DATA_PREFIX: &str = "Program data: ";
const LOG_PREFIX: &str = "Program ";

/// Every event the vault and registry programs emit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all_fields = "camelCase")]
#[allow(missing_docs)]
pub enum LedgerEvent {
    // Vault program
    VaultInitialized {
        vault: Pubkey,
        operator: Pubkey,
        agent_fee_bps: u16,
        protocol_fee_bps: u16,
        max_tvl: u64,
        created_at: i64,
    },
    BondStaked {
        vault: Pubkey,
        operator: Pubkey,
        amount: u64,
        total_bond: u64,
    },
    Deposited {
        vault: Pubkey,
        depositor: Pubkey,
        amount: u64,
        shares: u64,
    },
    Withdrawn {
        vault: Pubkey,
        withdrawer: Pubkey,
        shares: u64,
        usdc_out: u64,
    },
    RevenueReceived {
        vault: Pubkey,
        amount: u64,
        job_id: u64,
        vault_cut: u64,
        protocol_cut: u64,
    },
    Slashed {
        vault: Pubkey,
        job_id: u64,
        slash_total: u64,
        from_bond: u64,
        from_pool: u64,
        client_amount: u64,
        arbitrator_amount: u64,
        protocol_amount: u64,
    },
    VaultPaused {
        vault: Pubkey,
        timestamp: i64,
    },
    VaultUnpaused {
        vault: Pubkey,
        timestamp: i64,
    },

    // Registry program
    RegistryInitialized {
        vault: Pubkey,
        operator: Pubkey,
        protocol_authority: Pubkey,
        challenge_window: i64,
    },
    JobRecorded {
        registry: Pubkey,
        job_id: u64,
        client: Pubkey,
        payment_amount: u64,
        created_at: i64,
    },
    JobChallenged {
        registry: Pubkey,
        job_id: u64,
        challenger: Pubkey,
        challenged_at: i64,
    },
    JobResolved {
        registry: Pubkey,
        job_id: u64,
        status: JobStatus,
        resolved_at: i64,
    },
    JobFinalized {
        registry: Pubkey,
        job_id: u64,
        finalized_at: i64,
    },
    ReceiptVerified {
        registry: Pubkey,
        job_id: u64,
        client: Pubkey,
        verified_at: i64,
    },
}

const EVENT_NAMES: [&str; 14] = [
    "VaultInitialized",
    "BondStaked",
    "Deposited",
    "Withdrawn",
    "RevenueReceived",
    "Slashed",
    "VaultPaused",
    "VaultUnpaused",
    "RegistryInitialized",
    "JobRecorded",
    "JobChallenged",
    "JobResolved",
    "JobFinalized",
    "ReceiptVerified",
];

impl LedgerEvent {
    /// Event name as declared by the program
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::VaultInitialized { .. } => "VaultInitialized",
            LedgerEvent::BondStaked { .. } => "BondStaked",
            LedgerEvent::Deposited { .. } => "Deposited",
            LedgerEvent::Withdrawn { .. } => "Withdrawn",
            LedgerEvent::RevenueReceived { .. } => "RevenueReceived",
            LedgerEvent::Slashed { .. } => "Slashed",
            LedgerEvent::VaultPaused { .. } => "VaultPaused",
            LedgerEvent::VaultUnpaused { .. } => "VaultUnpaused",
            LedgerEvent::RegistryInitialized { .. } => "RegistryInitialized",
            LedgerEvent::JobRecorded { .. } => "JobRecorded",
            LedgerEvent::JobChallenged { .. } => "JobChallenged",
            LedgerEvent::JobResolved { .. } => "JobResolved",
            LedgerEvent::JobFinalized { .. } => "JobFinalized",
            LedgerEvent::ReceiptVerified { .. } => "ReceiptVerified",
        }
    }

    /// Vault the event refers to, for vault-program events
    pub fn vault(&self) -> Option<Pubkey> {
        match self {
            LedgerEvent::VaultInitialized { vault, .. }
            | LedgerEvent::BondStaked { vault, .. }
            | LedgerEvent::Deposited { vault, .. }
            | LedgerEvent::Withdrawn { vault, .. }
            | LedgerEvent::RevenueReceived { vault, .. }
            | LedgerEvent::Slashed { vault, .. }
            | LedgerEvent::VaultPaused { vault, .. }
            | LedgerEvent::VaultUnpaused { vault, .. } => Some(*vault),
            _ => None,
        }
    }

    /// Registry the event refers to, for registry-program events
    pub fn registry(&self) -> Option<Pubkey> {
        match self {
            LedgerEvent::JobRecorded { registry, .. }
            | LedgerEvent::JobChallenged { registry, .. }
            | LedgerEvent::JobResolved { registry, .. }
            | LedgerEvent::JobFinalized { registry, .. }
            | LedgerEvent::ReceiptVerified { registry, .. } => Some(*registry),
            _ => None,
        }
    }

    /// Discriminator + borsh payload
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_discriminator(discriminator("event", self.name()));
        match self {
            LedgerEvent::VaultInitialized {
                vault,
                operator,
                agent_fee_bps,
                protocol_fee_bps,
                max_tvl,
                created_at,
            } => {
                w.pubkey(vault)
                    .pubkey(operator)
                    .u16(*agent_fee_bps)
                    .u16(*protocol_fee_bps)
                    .u64(*max_tvl)
                    .i64(*created_at);
            }
            LedgerEvent::BondStaked {
                vault,
                operator,
                amount,
                total_bond,
            } => {
                w.pubkey(vault).pubkey(operator).u64(*amount).u64(*total_bond);
            }
            LedgerEvent::Deposited {
                vault,
                depositor,
                amount,
                shares,
            } => {
                w.pubkey(vault).pubkey(depositor).u64(*amount).u64(*shares);
            }
            LedgerEvent::Withdrawn {
                vault,
                withdrawer,
                shares,
                usdc_out,
            } => {
                w.pubkey(vault).pubkey(withdrawer).u64(*shares).u64(*usdc_out);
            }
            LedgerEvent::RevenueReceived {
                vault,
                amount,
                job_id,
                vault_cut,
                protocol_cut,
            } => {
                w.pubkey(vault)
                    .u64(*amount)
                    .u64(*job_id)
                    .u64(*vault_cut)
                    .u64(*protocol_cut);
            }
            LedgerEvent::Slashed {
                vault,
                job_id,
                slash_total,
                from_bond,
                from_pool,
                client_amount,
                arbitrator_amount,
                protocol_amount,
            } => {
                w.pubkey(vault)
                    .u64(*job_id)
                    .u64(*slash_total)
                    .u64(*from_bond)
                    .u64(*from_pool)
                    .u64(*client_amount)
                    .u64(*arbitrator_amount)
                    .u64(*protocol_amount);
            }
            LedgerEvent::VaultPaused { vault, timestamp }
            | LedgerEvent::VaultUnpaused { vault, timestamp } => {
                w.pubkey(vault).i64(*timestamp);
            }
            LedgerEvent::RegistryInitialized {
                vault,
                operator,
                protocol_authority,
                challenge_window,
            } => {
                w.pubkey(vault)
                    .pubkey(operator)
                    .pubkey(protocol_authority)
                    .i64(*challenge_window);
            }
            LedgerEvent::JobRecorded {
                registry,
                job_id,
                client,
                payment_amount,
                created_at,
            } => {
                w.pubkey(registry)
                    .u64(*job_id)
                    .pubkey(client)
                    .u64(*payment_amount)
                    .i64(*created_at);
            }
            LedgerEvent::JobChallenged {
                registry,
                job_id,
                challenger,
                challenged_at,
            } => {
                w.pubkey(registry)
                    .u64(*job_id)
                    .pubkey(challenger)
                    .i64(*challenged_at);
            }
            LedgerEvent::JobResolved {
                registry,
                job_id,
                status,
                resolved_at,
            } => {
                w.pubkey(registry)
                    .u64(*job_id)
                    .u8(*status as u8)
                    .i64(*resolved_at);
            }
            LedgerEvent::JobFinalized {
                registry,
                job_id,
                finalized_at,
            } => {
                w.pubkey(registry).u64(*job_id).i64(*finalized_at);
            }
            LedgerEvent::ReceiptVerified {
                registry,
                job_id,
                client,
                verified_at,
            } => {
                w.pubkey(registry)
                    .u64(*job_id)
                    .pubkey(client)
                    .i64(*verified_at);
            }
        }
        w.into_bytes()
    }

    /// Decode a payload; `Ok(None)` for a discriminator this crate does not know
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 8 {
            return Err(Error::Decode(format!("event payload of {} bytes", data.len())));
        }
        let name = match EVENT_NAMES
            .iter()
            .find(|name| discriminator("event", name) == data[..8])
        {
            Some(name) => *name,
            None => return Ok(None),
        };

        let mut r = Reader::new(&data[8..]);
        let event = match name {
            "VaultInitialized" => LedgerEvent::VaultInitialized {
                vault: r.pubkey()?,
                operator: r.pubkey()?,
                agent_fee_bps: r.u16()?,
                protocol_fee_bps: r.u16()?,
                max_tvl: r.u64()?,
                created_at: r.i64()?,
            },
            "BondStaked" => LedgerEvent::BondStaked {
                vault: r.pubkey()?,
                operator: r.pubkey()?,
                amount: r.u64()?,
                total_bond: r.u64()?,
            },
            "Deposited" => LedgerEvent::Deposited {
                vault: r.pubkey()?,
                depositor: r.pubkey()?,
                amount: r.u64()?,
                shares: r.u64()?,
            },
            "Withdrawn" => LedgerEvent::Withdrawn {
                vault: r.pubkey()?,
                withdrawer: r.pubkey()?,
                shares: r.u64()?,
                usdc_out: r.u64()?,
            },
            "RevenueReceived" => LedgerEvent::RevenueReceived {
                vault: r.pubkey()?,
                amount: r.u64()?,
                job_id: r.u64()?,
                vault_cut: r.u64()?,
                protocol_cut: r.u64()?,
            },
            "Slashed" => LedgerEvent::Slashed {
                vault: r.pubkey()?,
                job_id: r.u64()?,
                slash_total: r.u64()?,
                from_bond: r.u64()?,
                from_pool: r.u64()?,
                client_amount: r.u64()?,
                arbitrator_amount: r.u64()?,
                protocol_amount: r.u64()?,
            },
            "VaultPaused" => LedgerEvent::VaultPaused {
                vault: r.pubkey()?,
                timestamp: r.i64()?,
            },
            "VaultUnpaused" => LedgerEvent::VaultUnpaused {
                vault: r.pubkey()?,
                timestamp: r.i64()?,
            },
            "RegistryInitialized" => LedgerEvent::RegistryInitialized {
                vault: r.pubkey()?,
                operator: r.pubkey()?,
                protocol_authority: r.pubkey()?,
                challenge_window: r.i64()?,
            },
            "JobRecorded" => LedgerEvent::JobRecorded {
                registry: r.pubkey()?,
                job_id: r.u64()?,
                client: r.pubkey()?,
                payment_amount: r.u64()?,
                created_at: r.i64()?,
            },
            "JobChallenged" => LedgerEvent::JobChallenged {
                registry: r.pubkey()?,
                job_id: r.u64()?,
                challenger: r.pubkey()?,
                challenged_at: r.i64()?,
            },
            "JobResolved" => LedgerEvent::JobResolved {
                registry: r.pubkey()?,
                job_id: r.u64()?,
                status: JobStatus::from_u8(r.u8()?)?,
                resolved_at: r.i64()?,
            },
            "JobFinalized" => LedgerEvent::JobFinalized {
                registry: r.pubkey()?,
                job_id: r.u64()?,
                finalized_at: r.i64()?,
            },
            _ => LedgerEvent::ReceiptVerified {
                registry: r.pubkey()?,
                job_id: r.u64()?,
                client: r.pubkey()?,
                verified_at: r.i64()?,
            },
        };
        Ok(Some(event))
    }

    /// `Program data: <base64>` line for this event
    pub fn to_log_line(&self) -> String {
        format!("{}{}", DATA_PREFIX, BASE64.encode(self.encode()))
    }
}

/// Events extracted from one transaction's logs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLogs {
    /// Decoded events, in emission order
    pub events: Vec<LedgerEvent>,
    /// Data lines from the target program that failed to decode
    pub undecodable: usize,
}

/// Decode the events `program` emitted in a transaction's logs
///
/// Tracks the invoke stack so that data lines emitted by other programs
/// (including ones invoked through CPI) are ignored.
pub fn parse_logs<S: AsRef<str>>(program: &Pubkey, logs: &[S]) -> ParsedLogs {
    let program_id = program.to_string();
    let mut stack: Vec<String> = Vec::new();
    let mut parsed = ParsedLogs::default();

    for line in logs {
        let line = line.as_ref();

        if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
            if stack.last().map(String::as_str) != Some(program_id.as_str()) {
                continue;
            }
            let decoded = BASE64
                .decode(payload.trim())
                .map_err(|e| Error::Decode(e.to_string()))
                .and_then(|bytes| LedgerEvent::decode(&bytes));
            match decoded {
                Ok(Some(event)) => parsed.events.push(event),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(program = %program_id, error = %e, "Undecodable event payload");
                    parsed.undecodable += 1;
                }
            }
            continue;
        }

        let rest = match line.strip_prefix(LOG_PREFIX) {
            Some(rest) => rest,
            None => continue,
        };
        let mut parts = rest.split_whitespace();
        let (id, verb) = match (parts.next(), parts.next()) {
            (Some(id), Some(verb)) => (id, verb),
            _ => continue,
        };
        if verb == "invoke" {
            stack.push(id.to_string());
        } else if (verb == "success" || verb.starts_with("failed")) && stack.last().map(String::as_str) == Some(id) {
            stack.pop();
        }
    }

    parsed
}

/// Log lines a program invocation emitting `events` produces
pub fn encode_logs(program: &Pubkey, events: &[LedgerEvent]) -> Vec<String> {
    let mut logs = Vec::with_capacity(events.len() + 2);
    logs.push(format!("Program {} invoke [1]", program));
    logs.extend(events.iter().map(LedgerEvent::to_log_line));
    logs.push(format!("Program {} success", program));
    logs
}
