use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleSpec;
use crate::types::CronJobRunStatus;

/// Persisted schedule state for one recurring agent.
///
/// Claim fields form a lease: a row is claimable again once
/// `claim_expires_at_ms` has passed, whether or not the holder released it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub agent_id: String,
    pub enabled: bool,
    pub schedule: ScheduleSpec,
    pub definition_hash: String,
    /// `None` until the first dispatch; such a job is immediately due.
    pub next_run_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub claimed_by: Option<String>,
    pub claimed_at_ms: Option<i64>,
    pub claim_expires_at_ms: Option<i64>,
    pub in_flight_run_key: Option<String>,
    pub in_flight_goal_id: Option<String>,
    pub in_flight_started_at_ms: Option<i64>,
    pub failure_count: i64,
    pub backoff_until_ms: Option<i64>,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl CronJob {
    /// Enabled, due (or never run), unclaimed or lease-expired, and past any
    /// backoff. Both stores claim exactly the rows matching this.
    pub fn is_claimable(&self, now_ms: i64) -> bool {
        self.enabled
            && self.next_run_at_ms.map_or(true, |next| next <= now_ms)
            && (self.claimed_by.is_none()
                || self.claim_expires_at_ms.map_or(true, |exp| exp < now_ms))
            && self.backoff_until_ms.map_or(true, |until| until <= now_ms)
    }
}

/// Registry-derived fields written by the reconciler.
#[derive(Debug, Clone)]
pub struct CronJobDefinition {
    pub agent_id: String,
    pub enabled: bool,
    pub schedule: ScheduleSpec,
    pub definition_hash: String,
    /// Replaces the stored next run when `Some`; kept as-is otherwise.
    pub reset_next_run_at_ms: Option<Option<i64>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub now_ms: i64,
    pub claim_ttl_ms: i64,
    pub claimed_by: &'a str,
    pub limit: i64,
}

/// What happened to a claimed job; applied by `update_cron_job_after_outcome`.
/// Every variant clears the claim and in-flight fields.
#[derive(Debug, Clone)]
pub enum CronJobOutcome {
    /// A goal was submitted for `scheduled_for_ms`.
    Dispatched {
        scheduled_for_ms: i64,
        next_run_at_ms: i64,
    },
    /// The occurrence had already been dispatched; only advance the schedule.
    Skipped { next_run_at_ms: i64 },
    /// Dispatch failed; keep `next_run_at_ms` so the occurrence is retried.
    Failed {
        error: String,
        backoff_until_ms: i64,
    },
}

/// Idempotency record for one (agent, scheduled-for) occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobRun {
    pub run_key: String,
    pub agent_id: String,
    pub scheduled_for_ms: i64,
    pub status: CronJobRunStatus,
    pub goal_id: Option<String>,
    pub coalesced_count: i64,
    pub definition_hash: String,
    pub claimed_by: String,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewCronJobRun {
    pub agent_id: String,
    pub scheduled_for_ms: i64,
    pub coalesced_count: i64,
    pub definition_hash: String,
    pub claimed_by: String,
    pub now_ms: i64,
}

pub fn run_key(agent_id: &str, scheduled_for_ms: i64) -> String {
    format!("{}:{}", agent_id, scheduled_for_ms)
}

impl NewCronJobRun {
    pub fn run_key(&self) -> String {
        run_key(&self.agent_id, self.scheduled_for_ms)
    }
}
