//! Per-vault aggregates and the event reducer
//!
//! The reducer is deterministic: the same events with the same context
//! always produce the same stats. Fields that events cannot track precisely
//! (`tvl`, `operator_bond`) are overwritten by point reads instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vault_ledger::{JobStatus, LedgerEvent, Pubkey, Signature};

/// Days kept in `revenue_by_day`
pub const MAX_REVENUE_DAYS: usize = 90;

/// Jobs kept in `recent_jobs`
pub const MAX_RECENT_JOBS: usize = 50;

/// Vault revenue on one UTC day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueDay {
    /// `YYYY-MM-DD`
    pub date: String,
    /// Sum of vault cuts
    pub revenue: u64,
}

/// Summary of a recorded job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    /// Registry job id
    pub job_id: u64,
    /// Paying client
    pub client: Pubkey,
    /// Amount paid
    pub payment_amount: u64,
    /// Recording time (unix seconds)
    pub created_at: i64,
    /// Last known receipt status
    pub status: JobStatus,
    /// Transaction that recorded the job
    pub tx_signature: Signature,
}

/// Derived statistics of one vault
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    /// Vault token account balance
    pub tvl: u64,
    /// Sum of vault cuts
    pub total_revenue: u64,
    /// Revenue events seen
    pub total_jobs: u64,
    /// Operator bond
    pub operator_bond: u64,
    /// Sum of slash totals
    pub total_slashed: u64,
    /// Slash events seen
    pub slash_events: u64,
    /// Vault paused
    pub paused: bool,
    /// Receipts recorded
    pub jobs_recorded: u64,
    /// API calls served for the owning agent
    pub api_calls: u64,
    /// Daily revenue, oldest first
    pub revenue_by_day: Vec<RevenueDay>,
    /// Recorded jobs, newest first
    pub recent_jobs: Vec<JobSummary>,
    /// Last change (unix milliseconds)
    pub updated_at: i64,
}

/// Transaction an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    /// Transaction signature
    pub signature: Signature,
    /// Block time (unix seconds)
    pub timestamp: i64,
}

impl EventContext {
    /// UTC day bucket of the transaction
    pub fn day(&self) -> String {
        day_key(self.timestamp)
    }
}

/// `YYYY-MM-DD` of a unix timestamp
pub fn day_key(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

impl AgentStats {
    /// Apply one event. Returns true when the vault should be re-read.
    pub fn apply(&mut self, event: &LedgerEvent, ctx: &EventContext) -> bool {
        self.updated_at = ctx.timestamp.saturating_mul(1000);

        match event {
            LedgerEvent::Deposited { .. } | LedgerEvent::Withdrawn { .. } | LedgerEvent::BondStaked { .. } => true,

            LedgerEvent::RevenueReceived { vault_cut, .. } => {
                self.total_revenue = self.total_revenue.saturating_add(*vault_cut);
                self.total_jobs += 1;
                self.add_revenue(ctx.day(), *vault_cut);
                true
            }

            LedgerEvent::Slashed { slash_total, .. } => {
                self.total_slashed = self.total_slashed.saturating_add(*slash_total);
                self.slash_events += 1;
                false
            }

            LedgerEvent::VaultPaused { .. } => {
                self.paused = true;
                false
            }

            LedgerEvent::VaultUnpaused { .. } => {
                self.paused = false;
                false
            }

            LedgerEvent::JobRecorded {
                job_id,
                client,
                payment_amount,
                created_at,
                ..
            } => {
                self.jobs_recorded += 1;
                self.recent_jobs.insert(
                    0,
                    JobSummary {
                        job_id: *job_id,
                        client: *client,
                        payment_amount: *payment_amount,
                        created_at: *created_at,
                        status: JobStatus::Active,
                        tx_signature: ctx.signature,
                    },
                );
                self.recent_jobs.truncate(MAX_RECENT_JOBS);
                false
            }

            LedgerEvent::JobChallenged { job_id, .. } => {
                self.set_job_status(*job_id, JobStatus::Challenged);
                false
            }

            LedgerEvent::JobResolved { job_id, status, .. } => {
                self.set_job_status(*job_id, *status);
                false
            }

            LedgerEvent::JobFinalized { job_id, .. } => {
                self.set_job_status(*job_id, JobStatus::Finalized);
                false
            }

            LedgerEvent::VaultInitialized { .. }
            | LedgerEvent::RegistryInitialized { .. }
            | LedgerEvent::ReceiptVerified { .. } => false,
        }
    }

    /// Overwrite the fields only a point read knows
    pub fn apply_refresh(&mut self, tvl: u64, operator_bond: u64, paused: bool, now_ms: i64) {
        self.tvl = tvl;
        self.operator_bond = operator_bond;
        self.paused = paused;
        self.updated_at = now_ms;
    }

    fn add_revenue(&mut self, date: String, amount: u64) {
        match self.revenue_by_day.binary_search_by(|d| d.date.as_str().cmp(date.as_str())) {
            Ok(i) => {
                let day = &mut self.revenue_by_day[i];
                day.revenue = day.revenue.saturating_add(amount);
            }
            Err(i) => self.revenue_by_day.insert(i, RevenueDay { date, revenue: amount }),
        }
        if self.revenue_by_day.len() > MAX_REVENUE_DAYS {
            let excess = self.revenue_by_day.len() - MAX_REVENUE_DAYS;
            self.revenue_by_day.drain(..excess);
        }
    }

    // Evicted jobs are ignored
    fn set_job_status(&mut self, job_id: u64, status: JobStatus) {
        if let Some(job) = self.recent_jobs.iter_mut().find(|j| j.job_id == job_id) {
            job.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOV_14_2023: i64 = 1_700_000_000;

    fn ctx(timestamp: i64) -> EventContext {
        EventContext {
            signature: Signature::from_bytes([7u8; 64]),
            timestamp,
        }
    }

    fn vault() -> Pubkey {
        Pubkey::new([1u8; 32])
    }

    fn revenue(vault_cut: u64) -> LedgerEvent {
        LedgerEvent::RevenueReceived {
            vault: vault(),
            amount: vault_cut * 4,
            job_id: 0,
            vault_cut,
            protocol_cut: 0,
        }
    }

    fn recorded(job_id: u64) -> LedgerEvent {
        LedgerEvent::JobRecorded {
            registry: Pubkey::new([2u8; 32]),
            job_id,
            client: Pubkey::new([3u8; 32]),
            payment_amount: 1_000_000,
            created_at: NOV_14_2023,
        }
    }

    #[test]
    fn test_day_key() {
        assert_eq!(day_key(NOV_14_2023), "2023-11-14");
        assert_eq!(day_key(0), "1970-01-01");
    }

    #[test]
    fn test_revenue_accumulates_per_day() {
        let mut stats = AgentStats::default();
        assert!(stats.apply(&revenue(2_500_000), &ctx(NOV_14_2023)));
        assert!(stats.apply(&revenue(500_000), &ctx(NOV_14_2023 + 60)));
        assert!(stats.apply(&revenue(1_000_000), &ctx(NOV_14_2023 + 86_400)));

        assert_eq!(stats.total_revenue, 4_000_000);
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(
            stats.revenue_by_day,
            vec![
                RevenueDay { date: "2023-11-14".into(), revenue: 3_000_000 },
                RevenueDay { date: "2023-11-15".into(), revenue: 1_000_000 },
            ]
        );
    }

    #[test]
    fn test_revenue_series_capped() {
        let mut stats = AgentStats::default();
        for day in 0..100 {
            stats.apply(&revenue(1), &ctx(NOV_14_2023 + day * 86_400));
        }
        assert_eq!(stats.revenue_by_day.len(), MAX_REVENUE_DAYS);
        // Oldest ten days dropped
        assert_eq!(stats.revenue_by_day[0].date, day_key(NOV_14_2023 + 10 * 86_400));
    }

    #[test]
    fn test_recent_jobs_newest_first_and_capped() {
        let mut stats = AgentStats::default();
        for id in 0..60 {
            stats.apply(&recorded(id), &ctx(NOV_14_2023));
        }
        assert_eq!(stats.jobs_recorded, 60);
        assert_eq!(stats.recent_jobs.len(), MAX_RECENT_JOBS);
        assert_eq!(stats.recent_jobs[0].job_id, 59);
        assert_eq!(stats.recent_jobs[49].job_id, 10);
    }

    #[test]
    fn test_job_status_transitions() {
        let mut stats = AgentStats::default();
        let registry = Pubkey::new([2u8; 32]);
        stats.apply(&recorded(0), &ctx(NOV_14_2023));
        stats.apply(&recorded(1), &ctx(NOV_14_2023));

        stats.apply(
            &LedgerEvent::JobChallenged {
                registry,
                job_id: 0,
                challenger: Pubkey::new([3u8; 32]),
                challenged_at: NOV_14_2023,
            },
            &ctx(NOV_14_2023),
        );
        assert_eq!(stats.recent_jobs[1].status, JobStatus::Challenged);

        stats.apply(
            &LedgerEvent::JobResolved {
                registry,
                job_id: 0,
                status: JobStatus::Rejected,
                resolved_at: NOV_14_2023,
            },
            &ctx(NOV_14_2023),
        );
        stats.apply(
            &LedgerEvent::JobFinalized {
                registry,
                job_id: 1,
                finalized_at: NOV_14_2023,
            },
            &ctx(NOV_14_2023),
        );
        assert_eq!(stats.recent_jobs[1].status, JobStatus::Rejected);
        assert_eq!(stats.recent_jobs[0].status, JobStatus::Finalized);

        // Unknown job is a no-op
        let before = stats.clone();
        stats.apply(
            &LedgerEvent::JobFinalized {
                registry,
                job_id: 99,
                finalized_at: NOV_14_2023,
            },
            &ctx(NOV_14_2023),
        );
        assert_eq!(stats, before);
    }

    #[test]
    fn test_slash_and_pause() {
        let mut stats = AgentStats::default();
        let slash = LedgerEvent::Slashed {
            vault: vault(),
            job_id: 1,
            slash_total: 10_000_000,
            from_bond: 10_000_000,
            from_pool: 0,
            client_amount: 7_500_000,
            arbitrator_amount: 1_000_000,
            protocol_amount: 1_500_000,
        };
        assert!(!stats.apply(&slash, &ctx(NOV_14_2023)));
        stats.apply(&slash, &ctx(NOV_14_2023));
        assert_eq!(stats.total_slashed, 20_000_000);
        assert_eq!(stats.slash_events, 2);

        stats.apply(&LedgerEvent::VaultPaused { vault: vault(), timestamp: 0 }, &ctx(NOV_14_2023));
        assert!(stats.paused);
        stats.apply(&LedgerEvent::VaultUnpaused { vault: vault(), timestamp: 0 }, &ctx(NOV_14_2023));
        assert!(!stats.paused);
    }

    #[test]
    fn test_serialized_shape() {
        let mut stats = AgentStats::default();
        stats.apply(&recorded(4), &ctx(NOV_14_2023));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["jobsRecorded"], 1);
        assert_eq!(json["recentJobs"][0]["jobId"], 4);
        assert_eq!(json["recentJobs"][0]["status"], "active");
        assert!(json["revenueByDay"].as_array().unwrap().is_empty());
    }
}
