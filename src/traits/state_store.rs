use async_trait::async_trait;

use super::{
    ClaimRequest, CronJob, CronJobDefinition, CronJobOutcome, CronJobRun, Decision, Escalation,
    EscalationTransition, Goal, NewCronJobRun, NewRun, Run, RunCompletion, WorkItem,
};
use crate::types::{CronJobRunStatus, EscalationStatus, GoalStatus, WorkItemStatus};

/// Goal persistence and budget counters.
#[async_trait]
pub trait GoalStore: Send + Sync {
    async fn create_goal(&self, goal: &Goal) -> anyhow::Result<()>;

    async fn get_goal(&self, id: &str) -> anyhow::Result<Option<Goal>>;

    async fn get_goals_by_status(&self, status: GoalStatus) -> anyhow::Result<Vec<Goal>>;

    /// Compare-and-set on status. Returns false if the goal is not currently
    /// in one of `from`.
    async fn transition_goal_status(
        &self,
        id: &str,
        from: &[GoalStatus],
        to: GoalStatus,
    ) -> anyhow::Result<bool>;

    /// Move a goal to `to` from any state with a legal edge into it.
    async fn update_goal_status(&self, id: &str, to: GoalStatus) -> anyhow::Result<bool> {
        self.transition_goal_status(id, &GoalStatus::sources_of(to), to)
            .await
    }

    /// Atomically add to the spend counters and return the updated goal.
    async fn record_goal_usage(
        &self,
        id: &str,
        tokens: i64,
        time_minutes: f64,
        cost_usd: f64,
    ) -> anyhow::Result<Option<Goal>>;
}

/// Work-item persistence.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    async fn create_work_item(&self, item: &WorkItem) -> anyhow::Result<()>;

    async fn create_work_items(&self, items: &[WorkItem]) -> anyhow::Result<()> {
        for item in items {
            self.create_work_item(item).await?;
        }
        Ok(())
    }

    async fn get_work_item(&self, id: &str) -> anyhow::Result<Option<WorkItem>>;

    /// All items of a goal, oldest first.
    async fn get_work_items_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<WorkItem>>;

    async fn update_work_item_status(
        &self,
        id: &str,
        status: WorkItemStatus,
    ) -> anyhow::Result<bool>;

    /// Persist the mutable fields (status, retry count, verification, agent).
    async fn update_work_item(&self, item: &WorkItem) -> anyhow::Result<()>;
}

/// Run attempts.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a running run with the next sequence number for its work item.
    async fn create_run(&self, run: &NewRun) -> anyhow::Result<Run>;

    async fn complete_run(
        &self,
        id: &str,
        completion: &RunCompletion,
    ) -> anyhow::Result<Option<Run>>;

    async fn get_run(&self, id: &str) -> anyhow::Result<Option<Run>>;

    /// Runs ordered by sequence ascending.
    async fn get_runs_by_work_item(&self, work_item_id: &str) -> anyhow::Result<Vec<Run>>;

    async fn get_latest_run(&self, work_item_id: &str) -> anyhow::Result<Option<Run>> {
        Ok(self.get_runs_by_work_item(work_item_id).await?.pop())
    }
}

/// Cron job rows, the claim primitive and idempotent occurrence records.
#[async_trait]
pub trait CronJobStore: Send + Sync {
    async fn upsert_cron_job(&self, def: &CronJobDefinition, now_ms: i64) -> anyhow::Result<()>;

    async fn get_cron_job(&self, agent_id: &str) -> anyhow::Result<Option<CronJob>>;

    async fn list_cron_jobs(&self) -> anyhow::Result<Vec<CronJob>>;

    async fn set_cron_job_enabled(
        &self,
        agent_id: &str,
        enabled: bool,
        now_ms: i64,
    ) -> anyhow::Result<bool>;

    /// Atomically claim due, unclaimed (or lease-expired), non-backed-off jobs.
    /// Concurrent callers never receive the same job.
    async fn claim_due_cron_jobs(&self, req: ClaimRequest<'_>) -> anyhow::Result<Vec<CronJob>>;

    /// Drop a claim held by `claimed_by`. No-op if someone else holds it.
    async fn release_cron_job_claim(
        &self,
        agent_id: &str,
        claimed_by: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool>;

    async fn mark_cron_job_in_flight(
        &self,
        agent_id: &str,
        claimed_by: &str,
        run_key: &str,
        goal_id: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool>;

    /// Apply a dispatch outcome and release the claim. Returns false if the
    /// claim was lost to another instance in the meantime.
    async fn update_cron_job_after_outcome(
        &self,
        agent_id: &str,
        claimed_by: &str,
        outcome: &CronJobOutcome,
        now_ms: i64,
    ) -> anyhow::Result<bool>;

    /// Insert-or-fetch by (agent_id, scheduled_for_ms). The flag is true when
    /// this call created the row.
    async fn get_or_create_cron_job_run(
        &self,
        run: &NewCronJobRun,
    ) -> anyhow::Result<(CronJobRun, bool)>;

    async fn get_cron_job_run(&self, run_key: &str) -> anyhow::Result<Option<CronJobRun>>;

    async fn update_cron_job_run(
        &self,
        run_key: &str,
        status: CronJobRunStatus,
        goal_id: Option<&str>,
        error: Option<&str>,
        now_ms: i64,
    ) -> anyhow::Result<bool>;

    /// Most recent first.
    async fn list_cron_job_runs(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<CronJobRun>>;
}

/// Escalation records. State checks live in the handler; the store only
/// offers the conditional write.
#[async_trait]
pub trait EscalationStore: Send + Sync {
    async fn create_escalation(&self, escalation: &Escalation) -> anyhow::Result<()>;

    async fn get_escalation(&self, id: &str) -> anyhow::Result<Option<Escalation>>;

    async fn get_escalations_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<Escalation>>;

    async fn get_escalations_by_work_item(
        &self,
        work_item_id: &str,
    ) -> anyhow::Result<Vec<Escalation>>;

    async fn list_escalations(&self) -> anyhow::Result<Vec<Escalation>>;

    async fn transition_escalation(
        &self,
        id: &str,
        from: &[EscalationStatus],
        transition: &EscalationTransition,
    ) -> anyhow::Result<bool>;
}

/// Audit trail for model and policy decisions.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn create_decision(&self, decision: &Decision) -> anyhow::Result<()>;

    async fn get_decisions_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<Decision>>;
}

/// Facade over every store concern.
///
/// Call sites hold `Arc<dyn StateStore>`; components that only need one
/// concern can depend on the focused trait.
pub trait StateStore:
    Send + Sync + GoalStore + WorkItemStore + RunStore + CronJobStore + EscalationStore + DecisionStore
{
}

impl<T> StateStore for T where
    T: Send
        + Sync
        + GoalStore
        + WorkItemStore
        + RunStore
        + CronJobStore
        + EscalationStore
        + DecisionStore
{
}
