//! In-process store with the same contract as the SQLite one.
//!
//! Every operation takes the single mutex for its whole duration, which gives
//! the conditional updates and the claim the same atomicity the database
//! provides.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::traits::{
    ClaimRequest, CronJob, CronJobDefinition, CronJobOutcome, CronJobRun, CronJobStore, Decision,
    DecisionStore, Escalation, EscalationStore, EscalationTransition, Goal, GoalStore,
    NewCronJobRun, NewRun, Run, RunCompletion, RunStore, WorkItem, WorkItemStore,
};
use crate::types::{CronJobRunStatus, EscalationStatus, GoalStatus, RunStatus, WorkItemStatus};

#[derive(Default)]
struct Inner {
    goals: HashMap<String, Goal>,
    work_items: Vec<WorkItem>,
    runs: Vec<Run>,
    cron_jobs: BTreeMap<String, CronJob>,
    cron_job_runs: Vec<CronJobRun>,
    escalations: Vec<Escalation>,
    decisions: Vec<Decision>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn clear_claim(job: &mut CronJob) {
    job.claimed_by = None;
    job.claimed_at_ms = None;
    job.claim_expires_at_ms = None;
    job.in_flight_run_key = None;
    job.in_flight_goal_id = None;
    job.in_flight_started_at_ms = None;
}

#[async_trait]
impl GoalStore for MemoryStateStore {
    async fn create_goal(&self, goal: &Goal) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.goals.contains_key(&goal.id) {
            anyhow::bail!("goal {} already exists", goal.id);
        }
        inner.goals.insert(goal.id.clone(), goal.clone());
        Ok(())
    }

    async fn get_goal(&self, id: &str) -> anyhow::Result<Option<Goal>> {
        Ok(self.inner.lock().await.goals.get(id).cloned())
    }

    async fn get_goals_by_status(&self, status: GoalStatus) -> anyhow::Result<Vec<Goal>> {
        let inner = self.inner.lock().await;
        let mut goals: Vec<Goal> = inner
            .goals
            .values()
            .filter(|g| g.status == status)
            .cloned()
            .collect();
        goals.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(goals)
    }

    async fn transition_goal_status(
        &self,
        id: &str,
        from: &[GoalStatus],
        to: GoalStatus,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.goals.get_mut(id) {
            Some(goal) if from.contains(&goal.status) => {
                goal.status = to;
                goal.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_goal_usage(
        &self,
        id: &str,
        tokens: i64,
        time_minutes: f64,
        cost_usd: f64,
    ) -> anyhow::Result<Option<Goal>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.goals.get_mut(id).map(|goal| {
            goal.spent_tokens += tokens;
            goal.spent_time_minutes += time_minutes;
            goal.spent_cost_usd += cost_usd;
            goal.updated_at = Utc::now();
            goal.clone()
        }))
    }
}

#[async_trait]
impl WorkItemStore for MemoryStateStore {
    async fn create_work_item(&self, item: &WorkItem) -> anyhow::Result<()> {
        self.create_work_items(std::slice::from_ref(item)).await
    }

    async fn create_work_items(&self, items: &[WorkItem]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for item in items {
            if inner.work_items.iter().any(|w| w.id == item.id) {
                anyhow::bail!("work item {} already exists", item.id);
            }
        }
        inner.work_items.extend(items.iter().cloned());
        Ok(())
    }

    async fn get_work_item(&self, id: &str) -> anyhow::Result<Option<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner.work_items.iter().find(|w| w.id == id).cloned())
    }

    async fn get_work_items_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .work_items
            .iter()
            .filter(|w| w.goal_id == goal_id)
            .cloned()
            .collect())
    }

    async fn update_work_item_status(
        &self,
        id: &str,
        status: WorkItemStatus,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.work_items.iter_mut().find(|w| w.id == id) {
            Some(item) => {
                item.status = status;
                item.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_work_item(&self, item: &WorkItem) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.work_items.iter_mut().find(|w| w.id == item.id) {
            stored.status = item.status;
            stored.priority = item.priority;
            stored.retry_count = item.retry_count;
            stored.max_retries = item.max_retries;
            stored.verification_status = item.verification_status;
            stored.assigned_agent = item.assigned_agent.clone();
            stored.blocks = item.blocks.clone();
            stored.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStateStore {
    async fn create_run(&self, run: &NewRun) -> anyhow::Result<Run> {
        let mut inner = self.inner.lock().await;
        let sequence = inner
            .runs
            .iter()
            .filter(|r| r.work_item_id == run.work_item_id)
            .map(|r| r.run_sequence)
            .max()
            .unwrap_or(0)
            + 1;
        let created = Run {
            id: uuid::Uuid::new_v4().to_string(),
            work_item_id: run.work_item_id.clone(),
            goal_id: run.goal_id.clone(),
            agent_type: run.agent_type.clone(),
            run_sequence: sequence,
            status: RunStatus::Running,
            model: run.model.clone(),
            lane: run.lane.clone(),
            tokens_used: 0,
            cost_usd: 0.0,
            time_seconds: 0.0,
            artifacts: Vec::new(),
            error_message: None,
            execution_log: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        inner.runs.push(created.clone());
        Ok(created)
    }

    async fn complete_run(
        &self,
        id: &str,
        completion: &RunCompletion,
    ) -> anyhow::Result<Option<Run>> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner
            .runs
            .iter_mut()
            .find(|r| r.id == id && r.status == RunStatus::Running)
        else {
            return Ok(None);
        };
        run.status = if completion.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        run.tokens_used = completion.tokens_used;
        run.cost_usd = completion.cost_usd;
        run.time_seconds = completion.time_seconds;
        run.artifacts = completion.artifacts.clone();
        run.error_message = completion.error_message.clone();
        run.execution_log = completion.execution_log.clone();
        run.completed_at = Some(Utc::now());
        Ok(Some(run.clone()))
    }

    async fn get_run(&self, id: &str) -> anyhow::Result<Option<Run>> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn get_runs_by_work_item(&self, work_item_id: &str) -> anyhow::Result<Vec<Run>> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<Run> = inner
            .runs
            .iter()
            .filter(|r| r.work_item_id == work_item_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.run_sequence);
        Ok(runs)
    }
}

#[async_trait]
impl CronJobStore for MemoryStateStore {
    async fn upsert_cron_job(&self, def: &CronJobDefinition, now_ms: i64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.cron_jobs.get_mut(&def.agent_id) {
            Some(job) => {
                job.enabled = def.enabled;
                job.schedule = def.schedule.clone();
                job.definition_hash = def.definition_hash.clone();
                if let Some(next) = def.reset_next_run_at_ms {
                    job.next_run_at_ms = next;
                }
                job.updated_at_ms = now_ms;
            }
            None => {
                inner.cron_jobs.insert(
                    def.agent_id.clone(),
                    CronJob {
                        agent_id: def.agent_id.clone(),
                        enabled: def.enabled,
                        schedule: def.schedule.clone(),
                        definition_hash: def.definition_hash.clone(),
                        next_run_at_ms: def.reset_next_run_at_ms.flatten(),
                        last_run_at_ms: None,
                        claimed_by: None,
                        claimed_at_ms: None,
                        claim_expires_at_ms: None,
                        in_flight_run_key: None,
                        in_flight_goal_id: None,
                        in_flight_started_at_ms: None,
                        failure_count: 0,
                        backoff_until_ms: None,
                        last_error: None,
                        created_at_ms: now_ms,
                        updated_at_ms: now_ms,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_cron_job(&self, agent_id: &str) -> anyhow::Result<Option<CronJob>> {
        Ok(self.inner.lock().await.cron_jobs.get(agent_id).cloned())
    }

    async fn list_cron_jobs(&self) -> anyhow::Result<Vec<CronJob>> {
        Ok(self.inner.lock().await.cron_jobs.values().cloned().collect())
    }

    async fn set_cron_job_enabled(
        &self,
        agent_id: &str,
        enabled: bool,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.cron_jobs.get_mut(agent_id) {
            Some(job) if job.enabled != enabled => {
                job.enabled = enabled;
                job.updated_at_ms = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_due_cron_jobs(&self, req: ClaimRequest<'_>) -> anyhow::Result<Vec<CronJob>> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<&mut CronJob> = inner
            .cron_jobs
            .values_mut()
            .filter(|job| job.is_claimable(req.now_ms))
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at_ms
                .cmp(&b.next_run_at_ms)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let limit = usize::try_from(req.limit).unwrap_or(0);
        let mut claimed = Vec::new();
        for job in due.into_iter().take(limit) {
            job.claimed_by = Some(req.claimed_by.to_string());
            job.claimed_at_ms = Some(req.now_ms);
            job.claim_expires_at_ms = Some(req.now_ms.saturating_add(req.claim_ttl_ms));
            job.updated_at_ms = req.now_ms;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn release_cron_job_claim(
        &self,
        agent_id: &str,
        claimed_by: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.cron_jobs.get_mut(agent_id) {
            Some(job) if job.claimed_by.as_deref() == Some(claimed_by) => {
                clear_claim(job);
                job.updated_at_ms = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_cron_job_in_flight(
        &self,
        agent_id: &str,
        claimed_by: &str,
        run_key: &str,
        goal_id: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.cron_jobs.get_mut(agent_id) {
            Some(job) if job.claimed_by.as_deref() == Some(claimed_by) => {
                job.in_flight_run_key = Some(run_key.to_string());
                job.in_flight_goal_id = Some(goal_id.to_string());
                job.in_flight_started_at_ms = Some(now_ms);
                job.updated_at_ms = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_cron_job_after_outcome(
        &self,
        agent_id: &str,
        claimed_by: &str,
        outcome: &CronJobOutcome,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner
            .cron_jobs
            .get_mut(agent_id)
            .filter(|job| job.claimed_by.as_deref() == Some(claimed_by))
        else {
            return Ok(false);
        };
        match outcome {
            CronJobOutcome::Dispatched {
                scheduled_for_ms,
                next_run_at_ms,
            } => {
                job.next_run_at_ms = Some(*next_run_at_ms);
                job.last_run_at_ms = Some(*scheduled_for_ms);
                job.failure_count = 0;
                job.backoff_until_ms = None;
                job.last_error = None;
            }
            CronJobOutcome::Skipped { next_run_at_ms } => {
                job.next_run_at_ms = Some(*next_run_at_ms);
            }
            CronJobOutcome::Failed {
                error,
                backoff_until_ms,
            } => {
                job.failure_count += 1;
                job.backoff_until_ms = Some(*backoff_until_ms);
                job.last_error = Some(error.clone());
            }
        }
        clear_claim(job);
        job.updated_at_ms = now_ms;
        Ok(true)
    }

    async fn get_or_create_cron_job_run(
        &self,
        run: &NewCronJobRun,
    ) -> anyhow::Result<(CronJobRun, bool)> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .cron_job_runs
            .iter()
            .find(|r| r.agent_id == run.agent_id && r.scheduled_for_ms == run.scheduled_for_ms)
        {
            return Ok((existing.clone(), false));
        }
        let created = CronJobRun {
            run_key: run.run_key(),
            agent_id: run.agent_id.clone(),
            scheduled_for_ms: run.scheduled_for_ms,
            status: CronJobRunStatus::Pending,
            goal_id: None,
            coalesced_count: run.coalesced_count,
            definition_hash: run.definition_hash.clone(),
            claimed_by: run.claimed_by.clone(),
            error: None,
            created_at_ms: run.now_ms,
            updated_at_ms: run.now_ms,
        };
        inner.cron_job_runs.push(created.clone());
        Ok((created, true))
    }

    async fn get_cron_job_run(&self, run_key: &str) -> anyhow::Result<Option<CronJobRun>> {
        let inner = self.inner.lock().await;
        Ok(inner.cron_job_runs.iter().find(|r| r.run_key == run_key).cloned())
    }

    async fn update_cron_job_run(
        &self,
        run_key: &str,
        status: CronJobRunStatus,
        goal_id: Option<&str>,
        error: Option<&str>,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.cron_job_runs.iter_mut().find(|r| r.run_key == run_key) {
            Some(run) => {
                run.status = status;
                if let Some(goal_id) = goal_id {
                    run.goal_id = Some(goal_id.to_string());
                }
                run.error = error.map(str::to_string);
                run.updated_at_ms = now_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_cron_job_runs(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<CronJobRun>> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<CronJobRun> = inner
            .cron_job_runs
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.scheduled_for_ms.cmp(&a.scheduled_for_ms));
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }
}

#[async_trait]
impl EscalationStore for MemoryStateStore {
    async fn create_escalation(&self, escalation: &Escalation) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.escalations.iter().any(|e| e.id == escalation.id) {
            anyhow::bail!("escalation {} already exists", escalation.id);
        }
        inner.escalations.push(escalation.clone());
        Ok(())
    }

    async fn get_escalation(&self, id: &str) -> anyhow::Result<Option<Escalation>> {
        let inner = self.inner.lock().await;
        Ok(inner.escalations.iter().find(|e| e.id == id).cloned())
    }

    async fn get_escalations_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<Escalation>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .escalations
            .iter()
            .filter(|e| e.goal_id == goal_id)
            .cloned()
            .collect())
    }

    async fn get_escalations_by_work_item(
        &self,
        work_item_id: &str,
    ) -> anyhow::Result<Vec<Escalation>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .escalations
            .iter()
            .filter(|e| e.work_item_id == work_item_id)
            .cloned()
            .collect())
    }

    async fn list_escalations(&self) -> anyhow::Result<Vec<Escalation>> {
        Ok(self.inner.lock().await.escalations.clone())
    }

    async fn transition_escalation(
        &self,
        id: &str,
        from: &[EscalationStatus],
        transition: &EscalationTransition,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(esc) = inner
            .escalations
            .iter_mut()
            .find(|e| e.id == id && from.contains(&e.status))
        else {
            return Ok(false);
        };
        esc.status = transition.to;
        if transition.resolution_action.is_some() {
            esc.resolution_action = transition.resolution_action;
        }
        if transition.resolver.is_some() {
            esc.resolver = transition.resolver.clone();
        }
        if transition.notes.is_some() {
            esc.resolution_notes = transition.notes.clone();
        }
        if transition.to == EscalationStatus::Acknowledged {
            esc.acknowledged_at = Some(transition.at);
        }
        if transition.to.is_terminal() {
            esc.resolved_at = Some(transition.at);
        }
        esc.updated_at = transition.at;
        Ok(true)
    }
}

#[async_trait]
impl DecisionStore for MemoryStateStore {
    async fn create_decision(&self, decision: &Decision) -> anyhow::Result<()> {
        self.inner.lock().await.decisions.push(decision.clone());
        Ok(())
    }

    async fn get_decisions_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<Decision>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .decisions
            .iter()
            .filter(|d| d.goal_id == goal_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::schedule::ScheduleSpec;

    fn def(agent_id: &str) -> CronJobDefinition {
        CronJobDefinition {
            agent_id: agent_id.into(),
            enabled: true,
            schedule: ScheduleSpec::interval(60_000).unwrap(),
            definition_hash: "h1".into(),
            reset_next_run_at_ms: None,
        }
    }

    fn claim(by: &str, now_ms: i64) -> ClaimRequest<'_> {
        ClaimRequest {
            now_ms,
            claim_ttl_ms: 1_000,
            claimed_by: by,
            limit: 10,
        }
    }

    #[tokio::test]
    async fn concurrent_claims_are_exclusive() {
        let store = Arc::new(MemoryStateStore::new());
        for id in ["a", "b", "c"] {
            store.upsert_cron_job(&def(id), 0).await.unwrap();
        }

        let (s1, s2) = (store.clone(), store.clone());
        let (r1, r2) = tokio::join!(
            async move { s1.claim_due_cron_jobs(claim("one", 100)).await.unwrap() },
            async move { s2.claim_due_cron_jobs(claim("two", 100)).await.unwrap() },
        );
        assert_eq!(r1.len() + r2.len(), 3);
        for job in r1.iter() {
            assert!(!r2.iter().any(|j| j.agent_id == job.agent_id));
        }
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_and_stale_holder_loses() {
        let store = MemoryStateStore::new();
        store.upsert_cron_job(&def("a"), 0).await.unwrap();

        assert_eq!(store.claim_due_cron_jobs(claim("one", 100)).await.unwrap().len(), 1);
        assert!(store.claim_due_cron_jobs(claim("two", 1_100)).await.unwrap().is_empty());
        assert_eq!(store.claim_due_cron_jobs(claim("two", 1_101)).await.unwrap().len(), 1);

        let outcome = CronJobOutcome::Skipped {
            next_run_at_ms: 5_000,
        };
        assert!(!store
            .update_cron_job_after_outcome("a", "one", &outcome, 1_200)
            .await
            .unwrap());
        assert!(store
            .update_cron_job_after_outcome("a", "two", &outcome, 1_200)
            .await
            .unwrap());
        let job = store.get_cron_job("a").await.unwrap().unwrap();
        assert_eq!(job.next_run_at_ms, Some(5_000));
        assert!(job.claimed_by.is_none());
    }

    #[tokio::test]
    async fn occurrence_rows_are_unique() {
        let store = MemoryStateStore::new();
        let new = NewCronJobRun {
            agent_id: "a".into(),
            scheduled_for_ms: 5_000,
            coalesced_count: 3,
            definition_hash: "h".into(),
            claimed_by: "one".into(),
            now_ms: 5_500,
        };
        let (first, created) = store.get_or_create_cron_job_run(&new).await.unwrap();
        assert!(created);
        assert_eq!(first.run_key, "a:5000");
        let (second, created) = store
            .get_or_create_cron_job_run(&NewCronJobRun {
                claimed_by: "two".into(),
                ..new
            })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.claimed_by, "one");
    }
}
