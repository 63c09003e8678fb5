//! The dispatch loop.
//!
//! Each tick claims due cron jobs with a lease, records the occurrence in an
//! idempotent run row keyed by (agent, scheduled-for), synthesizes a goal for
//! new occurrences and hands it to the execution scheduler. Queued goals that
//! nobody submitted (ad-hoc goals, or tick goals whose dispatcher went away)
//! are picked up by the same tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::dag;
use crate::schedule::{compute_schedule_outcome, ScheduleOutcome};
use crate::traits::store_prelude::*;
use crate::traits::{
    AgentDefinition, AgentRegistry, AgentTickContext, ClaimRequest, CronJob, CronJobOutcome,
    CronJobRun, ExecutionScheduler, Goal, NewCronJobRun, NewGoal, NewWorkItem, TaskContext,
    WorkItem,
};
use crate::types::{CronJobRunStatus, GoalStatus};
use crate::utils::{now_ms, truncate_str};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub adhoc_submitted: usize,
    /// Queued tick goals submitted after their dispatcher gave up on them.
    pub orphans_submitted: usize,
}

impl DispatchReport {
    fn is_idle(&self) -> bool {
        *self == DispatchReport::default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub ticks: u64,
    pub timeouts: u64,
    pub last_tick_at_ms: Option<i64>,
    pub last_report: Option<DispatchReport>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub dispatched_total: u64,
    pub failed_total: u64,
}

/// Tick bookkeeping surfaced by `/status`.
#[derive(Debug, Default)]
pub struct DispatchTelemetry {
    inner: Mutex<TelemetrySnapshot>,
}

impl DispatchTelemetry {
    fn update(&self, f: impl FnOnce(&mut TelemetrySnapshot)) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn record_success(&self, at_ms: i64, report: DispatchReport) {
        self.update(|t| {
            t.ticks += 1;
            t.last_tick_at_ms = Some(at_ms);
            t.consecutive_failures = 0;
            t.dispatched_total += report.dispatched as u64;
            t.failed_total += report.failed as u64;
            t.last_report = Some(report);
        });
    }

    pub fn record_failure(&self, at_ms: i64, error: &str) {
        self.update(|t| {
            t.ticks += 1;
            t.last_tick_at_ms = Some(at_ms);
            t.consecutive_failures += 1;
            t.last_error = Some(error.to_string());
        });
    }

    pub fn record_timeout(&self, at_ms: i64) {
        self.update(|t| {
            t.ticks += 1;
            t.timeouts += 1;
            t.last_tick_at_ms = Some(at_ms);
            t.consecutive_failures += 1;
            t.last_error = Some("tick timed out".to_string());
        });
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// `min(base * 2^(failures-1), max)`.
pub fn backoff_delay_ms(base_ms: i64, max_ms: i64, failures: i64) -> i64 {
    let exp = (failures - 1).clamp(0, 30) as u32;
    base_ms.saturating_mul(1i64 << exp).min(max_ms)
}

enum JobResult {
    Dispatched,
    Skipped,
}

pub struct AgentScheduler {
    store: Arc<dyn StateStore>,
    agents: Arc<dyn AgentRegistry>,
    executor: Arc<dyn ExecutionScheduler>,
    config: SchedulerConfig,
    instance_id: String,
    pickup_queued: bool,
    telemetry: Arc<DispatchTelemetry>,
}

impl AgentScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        agents: Arc<dyn AgentRegistry>,
        executor: Arc<dyn ExecutionScheduler>,
        config: SchedulerConfig,
        instance_id: String,
    ) -> Self {
        Self {
            store,
            agents,
            executor,
            config,
            instance_id,
            pickup_queued: true,
            telemetry: Arc::new(DispatchTelemetry::default()),
        }
    }

    /// Leave queued goals alone. Used when this process has no execution
    /// engine of its own.
    pub fn without_queued_pickup(mut self) -> Self {
        self.pickup_queued = false;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn telemetry(&self) -> Arc<DispatchTelemetry> {
        self.telemetry.clone()
    }

    /// Run the tick loop until `shutdown` fires. Each tick is time-boxed; a
    /// tick that overruns is abandoned and the next one still starts.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let tick_interval = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let tick_timeout = Duration::from_millis(self.config.tick_timeout_ms.max(1));
        info!(
            instance_id = %self.instance_id,
            tick_interval_ms = self.config.tick_interval_ms,
            "Dispatch loop spawned"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let now = now_ms();
                match tokio::time::timeout(tick_timeout, self.dispatch_once(now)).await {
                    Ok(Ok(report)) => {
                        if report.is_idle() {
                            debug!("Dispatch tick idle");
                        } else {
                            info!(
                                claimed = report.claimed,
                                dispatched = report.dispatched,
                                skipped = report.skipped,
                                failed = report.failed,
                                adhoc_submitted = report.adhoc_submitted,
                                orphans_submitted = report.orphans_submitted,
                                "Dispatch tick"
                            );
                        }
                        self.telemetry.record_success(now, report);
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Dispatch tick failed");
                        self.telemetry.record_failure(now, &format!("{:#}", e));
                    }
                    Err(_) => {
                        warn!(timeout_ms = self.config.tick_timeout_ms, "Dispatch tick timed out");
                        self.telemetry.record_timeout(now);
                    }
                }
            }
            info!("Dispatch loop stopped");
        })
    }

    pub async fn dispatch_once(&self, now_ms: i64) -> anyhow::Result<DispatchReport> {
        let mut report = DispatchReport::default();

        let claimed = self
            .store
            .claim_due_cron_jobs(ClaimRequest {
                now_ms,
                claim_ttl_ms: self.config.claim_ttl_ms,
                claimed_by: &self.instance_id,
                limit: self.config.max_claims_per_tick,
            })
            .await
            .context("claiming due cron jobs")?;
        report.claimed = claimed.len();

        for job in &claimed {
            let mut run_key = None;
            match self.dispatch_job(job, now_ms, &mut run_key).await {
                Ok(JobResult::Dispatched) => report.dispatched += 1,
                Ok(JobResult::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(agent_id = %job.agent_id, error = %e, "Cron job dispatch failed");
                    if let Err(e) = self
                        .record_job_failure(job, run_key.as_deref(), &e, now_ms)
                        .await
                    {
                        error!(agent_id = %job.agent_id, error = %e, "Failed to record dispatch failure");
                    }
                }
            }
        }

        if self.pickup_queued {
            if let Err(e) = self.submit_queued_goals(now_ms, &mut report).await {
                warn!(error = %e, "Queued goal pickup failed");
            }
        }

        Ok(report)
    }

    async fn release(&self, job: &CronJob, now_ms: i64) -> anyhow::Result<()> {
        self.store
            .release_cron_job_claim(&job.agent_id, &self.instance_id, now_ms)
            .await?;
        Ok(())
    }

    async fn dispatch_job(
        &self,
        job: &CronJob,
        now_ms: i64,
        run_key: &mut Option<String>,
    ) -> anyhow::Result<JobResult> {
        let agent_id = job.agent_id.as_str();
        let Some(agent) = self.agents.get_agent(agent_id).filter(|a| a.enabled) else {
            info!(agent_id, "Agent missing or disabled, releasing claim");
            self.release(job, now_ms).await?;
            return Ok(JobResult::Skipped);
        };

        let schedule = job.schedule.compile()?;
        let outcome = compute_schedule_outcome(&schedule, now_ms, job.next_run_at_ms);
        if !outcome.due {
            debug!(agent_id, next_run_at_ms = outcome.next_run_at_ms, "Not due, releasing claim");
            self.release(job, now_ms).await?;
            return Ok(JobResult::Skipped);
        }

        // A failed occurrence absorbs every occurrence missed while it backed
        // off, unless the agent changed underneath it.
        let retry = match self.store.list_cron_job_runs(agent_id, 1).await?.pop() {
            Some(prev)
                if prev.status == CronJobRunStatus::Failed
                    && prev.scheduled_for_ms < outcome.scheduled_for_ms =>
            {
                if prev.definition_hash == agent.definition_hash {
                    Some(prev)
                } else {
                    self.supersede_run(&prev, now_ms).await?;
                    None
                }
            }
            _ => None,
        };

        let (run, created) = match retry {
            Some(prev) => {
                info!(
                    agent_id,
                    run_key = %prev.run_key,
                    scheduled_for_ms = outcome.scheduled_for_ms,
                    "Retrying failed occurrence in place of newer ones"
                );
                (prev, false)
            }
            None => {
                self.store
                    .get_or_create_cron_job_run(&NewCronJobRun {
                        agent_id: agent_id.to_string(),
                        scheduled_for_ms: outcome.scheduled_for_ms,
                        coalesced_count: outcome.coalesced_count,
                        definition_hash: agent.definition_hash.clone(),
                        claimed_by: self.instance_id.clone(),
                        now_ms,
                    })
                    .await?
            }
        };
        *run_key = Some(run.run_key.clone());

        if !created && run.status != CronJobRunStatus::Failed {
            info!(agent_id, run_key = %run.run_key, "Occurrence already dispatched, advancing schedule");
            self.store
                .update_cron_job_after_outcome(
                    agent_id,
                    &self.instance_id,
                    &CronJobOutcome::Skipped {
                        next_run_at_ms: outcome.next_run_at_ms,
                    },
                    now_ms,
                )
                .await?;
            return Ok(JobResult::Skipped);
        }

        let reused = match (&run.goal_id, created) {
            (Some(goal_id), false) => self.store.get_goal(goal_id).await?,
            _ => None,
        };
        let goal = match reused {
            Some(goal) if goal.status != GoalStatus::Queued => {
                info!(agent_id, goal_id = %goal.id, status = %goal.status, "Goal of failed occurrence already accepted");
                self.finish_dispatch(agent_id, &run, &goal, &outcome, now_ms)
                    .await?;
                return Ok(JobResult::Dispatched);
            }
            Some(goal) => {
                info!(agent_id, goal_id = %goal.id, run_key = %run.run_key, "Redispatching failed occurrence");
                self.mark_in_flight(agent_id, &run, &goal, now_ms).await?;
                goal
            }
            None => {
                let (goal, item) = synthesize_tick_goal(&agent, &run);
                self.mark_in_flight(agent_id, &run, &goal, now_ms).await?;
                self.store.create_goal(&goal).await?;
                self.store.create_work_item(&item).await?;
                goal
            }
        };

        self.store
            .update_cron_job_run(
                &run.run_key,
                CronJobRunStatus::Pending,
                Some(&goal.id),
                None,
                now_ms,
            )
            .await?;

        let submit_timeout = Duration::from_millis(self.config.submit_timeout_ms);
        match tokio::time::timeout(submit_timeout, self.executor.submit_goal(&goal)).await {
            Ok(result) => result.context("submit_goal failed")?,
            Err(_) => anyhow::bail!(
                "submit_goal timed out after {}ms",
                self.config.submit_timeout_ms
            ),
        }

        self.finish_dispatch(agent_id, &run, &goal, &outcome, now_ms)
            .await?;
        info!(
            agent_id,
            goal_id = %goal.id,
            run_key = %run.run_key,
            coalesced_count = run.coalesced_count,
            next_run_at_ms = outcome.next_run_at_ms,
            "Cron job dispatched"
        );
        Ok(JobResult::Dispatched)
    }

    async fn supersede_run(&self, run: &CronJobRun, now_ms: i64) -> anyhow::Result<()> {
        if let Some(goal_id) = run.goal_id.as_deref() {
            if self
                .store
                .transition_goal_status(goal_id, &[GoalStatus::Queued], GoalStatus::Cancelled)
                .await?
            {
                info!(goal_id, run_key = %run.run_key, "Cancelled goal of superseded occurrence");
            }
        }
        self.store
            .update_cron_job_run(&run.run_key, CronJobRunStatus::Superseded, None, None, now_ms)
            .await?;
        info!(agent_id = %run.agent_id, run_key = %run.run_key, "Failed occurrence superseded");
        Ok(())
    }

    async fn mark_in_flight(
        &self,
        agent_id: &str,
        run: &CronJobRun,
        goal: &Goal,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        if !self
            .store
            .mark_cron_job_in_flight(agent_id, &self.instance_id, &run.run_key, &goal.id, now_ms)
            .await?
        {
            anyhow::bail!("claim on {} lost before submission", agent_id);
        }
        Ok(())
    }

    async fn finish_dispatch(
        &self,
        agent_id: &str,
        run: &CronJobRun,
        goal: &Goal,
        outcome: &ScheduleOutcome,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        self.store
            .update_cron_job_run(
                &run.run_key,
                CronJobRunStatus::Dispatched,
                Some(&goal.id),
                None,
                now_ms,
            )
            .await?;
        if !self
            .store
            .update_cron_job_after_outcome(
                agent_id,
                &self.instance_id,
                &CronJobOutcome::Dispatched {
                    scheduled_for_ms: outcome.scheduled_for_ms.max(run.scheduled_for_ms),
                    next_run_at_ms: outcome.next_run_at_ms,
                },
                now_ms,
            )
            .await?
        {
            warn!(agent_id, "Claim expired before the outcome was written");
        }
        Ok(())
    }

    async fn record_job_failure(
        &self,
        job: &CronJob,
        run_key: Option<&str>,
        error: &anyhow::Error,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        let message = truncate_str(&format!("{:#}", error), 1_000);
        if let Some(key) = run_key {
            self.store
                .update_cron_job_run(key, CronJobRunStatus::Failed, None, Some(&message), now_ms)
                .await?;
        }
        let delay = backoff_delay_ms(
            self.config.backoff_base_ms,
            self.config.backoff_max_ms,
            job.failure_count + 1,
        );
        self.store
            .update_cron_job_after_outcome(
                &job.agent_id,
                &self.instance_id,
                &CronJobOutcome::Failed {
                    error: message,
                    backoff_until_ms: now_ms + delay,
                },
                now_ms,
            )
            .await?;
        Ok(())
    }

    async fn submit_queued_goals(
        &self,
        now_ms: i64,
        report: &mut DispatchReport,
    ) -> anyhow::Result<()> {
        let grace_ms = self.config.submit_timeout_ms as i64;
        let limit = self.config.max_claims_per_tick.max(0) as usize;
        let queued = self.store.get_goals_by_status(GoalStatus::Queued).await?;
        let mut attempted = 0;
        for goal in queued {
            if attempted >= limit {
                break;
            }
            // Tick goals are orphans only while their run row is still pending:
            // failed rows belong to the dispatch path.
            let orphan_run = match goal.context.as_agent_tick() {
                None => None,
                Some(tick) => {
                    if now_ms - goal.created_at.timestamp_millis() < grace_ms {
                        continue;
                    }
                    match self.store.get_cron_job_run(&tick.run_key).await? {
                        Some(run)
                            if run.status == CronJobRunStatus::Pending
                                && run.goal_id.as_deref() == Some(goal.id.as_str()) =>
                        {
                            Some(run)
                        }
                        _ => continue,
                    }
                }
            };
            attempted += 1;

            let submit_timeout = Duration::from_millis(self.config.submit_timeout_ms);
            match tokio::time::timeout(submit_timeout, self.executor.submit_goal(&goal)).await {
                Ok(Ok(())) => match orphan_run {
                    Some(run) => {
                        info!(goal_id = %goal.id, run_key = %run.run_key, "Orphaned tick goal submitted");
                        self.store
                            .update_cron_job_run(
                                &run.run_key,
                                CronJobRunStatus::Dispatched,
                                Some(&goal.id),
                                None,
                                now_ms,
                            )
                            .await?;
                        report.orphans_submitted += 1;
                    }
                    None => {
                        info!(goal_id = %goal.id, "Queued goal submitted");
                        report.adhoc_submitted += 1;
                    }
                },
                Ok(Err(e)) => info!(goal_id = %goal.id, error = %e, "Queued goal not submitted"),
                Err(_) => warn!(goal_id = %goal.id, "Queued goal submission timed out"),
            }
        }
        Ok(())
    }

    /// Validate and store an ad-hoc goal with its work items, leaving it
    /// `queued`.
    pub async fn persist_adhoc_goal(
        &self,
        new_goal: NewGoal,
        new_items: Vec<NewWorkItem>,
    ) -> anyhow::Result<Goal> {
        let goal = Goal::new(new_goal);
        let mut items: Vec<WorkItem> = new_items
            .into_iter()
            .map(|i| WorkItem::new(&goal.id, i))
            .collect();
        dag::validate_acyclic(&items)?;
        dag::derive_blocks(&mut items);

        self.store.create_goal(&goal).await?;
        self.store.create_work_items(&items).await?;
        info!(goal_id = %goal.id, items = items.len(), "Ad-hoc goal persisted");
        Ok(goal)
    }

    pub async fn submit_adhoc_goal(
        &self,
        new_goal: NewGoal,
        new_items: Vec<NewWorkItem>,
    ) -> anyhow::Result<Goal> {
        let goal = self.persist_adhoc_goal(new_goal, new_items).await?;
        self.executor.submit_goal(&goal).await?;
        Ok(goal)
    }
}

/// Build the goal and its single work item for one cron occurrence.
pub fn synthesize_tick_goal(agent: &AgentDefinition, run: &CronJobRun) -> (Goal, WorkItem) {
    let policy = &agent.policy;
    let context = TaskContext::AgentTick(AgentTickContext {
        agent_id: agent.id.clone(),
        definition_hash: agent.definition_hash.clone(),
        run_key: run.run_key.clone(),
        scheduled_for_ms: run.scheduled_for_ms,
        coalesced_count: run.coalesced_count,
        policy: policy.clone(),
        route: None,
    });

    let mut description = format!(
        "Scheduled run of agent {} ({}). scheduled_for_ms={} coalesced_count={}",
        agent.id, agent.agent_type, run.scheduled_for_ms, run.coalesced_count
    );
    if !agent.description.is_empty() {
        description = format!("{}\n\n{}", agent.description, description);
    }

    let goal = Goal::new(NewGoal {
        title: agent.name.clone(),
        description,
        priority: policy.priority,
        success_criteria: policy.success_criteria.clone(),
        budget_tokens: policy.budget_tokens,
        budget_time_minutes: policy.budget_time_minutes,
        budget_cost_usd: policy.budget_cost_usd,
        context: context.clone(),
    });
    let item = WorkItem::new(
        &goal.id,
        NewWorkItem {
            id: None,
            title: agent.name.clone(),
            description: agent.description.clone(),
            item_type: policy.item_type,
            priority: policy.priority,
            dependencies: Vec::new(),
            estimated_effort: policy.effort,
            max_retries: policy.max_retries,
            verification_plan: None,
            assigned_agent: Some(agent.id.clone()),
            context,
        },
    );
    (goal, item)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::events::{EventBus, SchedulerEvent};
    use crate::registry::{definition_hash, ConfigAgentRegistry};
    use crate::schedule::ScheduleSpec;
    use crate::state::MemoryStateStore;
    use crate::traits::{AgentPolicy, CronJobDefinition};

    struct RecordingExecutor {
        store: Arc<MemoryStateStore>,
        submitted: Mutex<Vec<String>>,
        fail: AtomicBool,
        hang: AtomicBool,
        events: EventBus,
    }

    impl RecordingExecutor {
        fn new(store: Arc<MemoryStateStore>) -> Arc<Self> {
            Arc::new(Self {
                store,
                submitted: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                events: EventBus::new(8),
            })
        }

        fn submitted(&self) -> Vec<String> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutionScheduler for RecordingExecutor {
        async fn submit_goal(&self, goal: &Goal) -> anyhow::Result<()> {
            if self.hang.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("executor unavailable");
            }
            if !self
                .store
                .transition_goal_status(&goal.id, &[GoalStatus::Queued], GoalStatus::Active)
                .await?
            {
                anyhow::bail!("goal {} is not queued", goal.id);
            }
            self.submitted.lock().unwrap().push(goal.id.clone());
            Ok(())
        }

        async fn cancel_goal(&self, _goal_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
            self.events.subscribe()
        }
    }

    fn agent(id: &str, every_ms: i64) -> AgentDefinition {
        let mut def = AgentDefinition {
            id: id.into(),
            name: format!("{} agent", id),
            description: "Summarize the inbox".into(),
            agent_type: "report".into(),
            enabled: true,
            schedule: ScheduleSpec::interval(every_ms).unwrap(),
            policy: AgentPolicy {
                priority: Some(70),
                budget_tokens: Some(5_000),
                ..Default::default()
            },
            runner: None,
            definition_hash: String::new(),
        };
        def.definition_hash = definition_hash(&def);
        def
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            claim_ttl_ms: 60_000,
            submit_timeout_ms: 200,
            max_claims_per_tick: 10,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            ..Default::default()
        }
    }

    struct Fixture {
        store: Arc<MemoryStateStore>,
        executor: Arc<RecordingExecutor>,
        scheduler: AgentScheduler,
    }

    async fn fixture(agents: Vec<AgentDefinition>, next_run_at_ms: Option<i64>) -> Fixture {
        let store = Arc::new(MemoryStateStore::new());
        for a in &agents {
            store
                .upsert_cron_job(
                    &CronJobDefinition {
                        agent_id: a.id.clone(),
                        enabled: true,
                        schedule: a.schedule.clone(),
                        definition_hash: a.definition_hash.clone(),
                        reset_next_run_at_ms: Some(next_run_at_ms),
                    },
                    0,
                )
                .await
                .unwrap();
        }
        let executor = RecordingExecutor::new(store.clone());
        let scheduler = AgentScheduler::new(
            store.clone(),
            Arc::new(ConfigAgentRegistry::from_definitions(agents)),
            executor.clone(),
            config(),
            "node-a".into(),
        );
        Fixture {
            store,
            executor,
            scheduler,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(1_000, 60_000, 1), 1_000);
        assert_eq!(backoff_delay_ms(1_000, 60_000, 3), 4_000);
        assert_eq!(backoff_delay_ms(1_000, 60_000, 10), 60_000);
        assert_eq!(backoff_delay_ms(1_000, 60_000, 500), 60_000);
    }

    #[tokio::test]
    async fn misfires_coalesce_into_one_goal() {
        let f = fixture(vec![agent("digest", 1_000)], Some(2_000)).await;

        let report = f.scheduler.dispatch_once(5_500).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.dispatched, 1);

        let submitted = f.executor.submitted();
        assert_eq!(submitted.len(), 1);
        let goal = f.store.get_goal(&submitted[0]).await.unwrap().unwrap();
        assert!(goal.description.contains("coalesced_count=3"));
        assert_eq!(goal.title, "digest agent");
        assert_eq!(goal.priority, 70);
        assert_eq!(goal.budget_tokens, Some(5_000));
        let tick = goal.context.as_agent_tick().unwrap();
        assert_eq!(tick.run_key, "digest:5000");

        let items = f.store.get_work_items_by_goal(&goal.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].assigned_agent.as_deref(), Some("digest"));

        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert_eq!(job.next_run_at_ms, Some(6_000));
        assert_eq!(job.last_run_at_ms, Some(5_000));
        assert!(job.claimed_by.is_none());
        assert!(job.in_flight_run_key.is_none());

        let run = f.store.get_cron_job_run("digest:5000").await.unwrap().unwrap();
        assert_eq!(run.status, CronJobRunStatus::Dispatched);
        assert_eq!(run.goal_id.as_deref(), Some(goal.id.as_str()));
        assert_eq!(run.coalesced_count, 3);
    }

    #[tokio::test]
    async fn replay_after_crash_does_not_resubmit() {
        let a = agent("digest", 1_000);
        let f = fixture(vec![a.clone()], Some(2_000)).await;
        assert_eq!(f.scheduler.dispatch_once(5_500).await.unwrap().dispatched, 1);

        // Simulate an instance that dispatched but died before advancing the row.
        f.store
            .upsert_cron_job(
                &CronJobDefinition {
                    agent_id: a.id.clone(),
                    enabled: true,
                    schedule: a.schedule.clone(),
                    definition_hash: a.definition_hash.clone(),
                    reset_next_run_at_ms: Some(Some(2_000)),
                },
                5_600,
            )
            .await
            .unwrap();

        let report = f.scheduler.dispatch_once(5_700).await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(f.executor.submitted().len(), 1);
        assert_eq!(f.store.list_cron_job_runs("digest", 10).await.unwrap().len(), 1);
        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert_eq!(job.next_run_at_ms, Some(6_000));
        assert!(job.claimed_by.is_none());
    }

    #[tokio::test]
    async fn not_due_is_a_stable_no_op() {
        let f = fixture(vec![agent("digest", 1_000)], Some(10_000)).await;
        for _ in 0..3 {
            let report = f.scheduler.dispatch_once(9_999).await.unwrap();
            assert_eq!(report, DispatchReport::default());
        }
        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert_eq!(job.next_run_at_ms, Some(10_000));

        let report = f.scheduler.dispatch_once(10_000).await.unwrap();
        assert_eq!(report.dispatched, 1);
        let run = f.store.get_cron_job_run("digest:10000").await.unwrap().unwrap();
        assert_eq!(run.coalesced_count, 0);
    }

    #[tokio::test]
    async fn missing_agent_releases_claim() {
        let f = fixture(vec![agent("digest", 1_000)], Some(1_000)).await;
        let scheduler = AgentScheduler::new(
            f.store.clone(),
            Arc::new(ConfigAgentRegistry::default()),
            f.executor.clone(),
            config(),
            "node-a".into(),
        );
        let report = scheduler.dispatch_once(2_000).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.skipped, 1);
        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert!(job.claimed_by.is_none());
        assert_eq!(job.next_run_at_ms, Some(1_000));
    }

    #[tokio::test]
    async fn submit_failure_backs_off_then_redispatches_same_goal() {
        let f = fixture(vec![agent("digest", 10_000)], Some(2_000)).await;
        f.executor.fail.store(true, Ordering::SeqCst);

        let report = f.scheduler.dispatch_once(2_500).await.unwrap();
        assert_eq!(report.failed, 1);

        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert_eq!(job.failure_count, 1);
        assert_eq!(job.backoff_until_ms, Some(3_500));
        assert_eq!(job.next_run_at_ms, Some(2_000));
        assert!(job.claimed_by.is_none());
        assert!(job.last_error.as_deref().unwrap().contains("executor unavailable"));
        let run = f.store.get_cron_job_run("digest:2000").await.unwrap().unwrap();
        assert_eq!(run.status, CronJobRunStatus::Failed);
        let first_goal = run.goal_id.clone().unwrap();

        // Still backing off.
        assert_eq!(f.scheduler.dispatch_once(3_000).await.unwrap().claimed, 0);

        f.executor.fail.store(false, Ordering::SeqCst);
        let report = f.scheduler.dispatch_once(3_500).await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(f.executor.submitted(), vec![first_goal]);
        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert_eq!(job.failure_count, 0);
        assert_eq!(job.backoff_until_ms, None);
        assert_eq!(job.next_run_at_ms, Some(12_000));
    }

    #[tokio::test]
    async fn backoff_longer_than_interval_retries_the_failed_occurrence() {
        let f = fixture(vec![agent("digest", 1_000)], Some(2_000)).await;
        f.executor.fail.store(true, Ordering::SeqCst);
        assert_eq!(f.scheduler.dispatch_once(2_500).await.unwrap().failed, 1);
        let first_goal = f
            .store
            .get_cron_job_run("digest:2000")
            .await
            .unwrap()
            .unwrap()
            .goal_id
            .unwrap();

        // Two more occurrences elapse while the job backs off.
        f.executor.fail.store(false, Ordering::SeqCst);
        let report = f.scheduler.dispatch_once(4_500).await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.orphans_submitted, 0);
        assert_eq!(f.executor.submitted(), vec![first_goal.clone()]);

        let runs = f.store.list_cron_job_runs("digest", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_key, "digest:2000");
        assert_eq!(runs[0].status, CronJobRunStatus::Dispatched);
        assert_eq!(runs[0].goal_id.as_deref(), Some(first_goal.as_str()));
        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert_eq!(job.next_run_at_ms, Some(5_000));
        assert_eq!(job.last_run_at_ms, Some(4_000));
        assert_eq!(
            f.store.get_goals_by_status(GoalStatus::Queued).await.unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn changed_definition_supersedes_failed_occurrence() {
        let f = fixture(vec![agent("digest", 1_000)], Some(2_000)).await;
        f.executor.fail.store(true, Ordering::SeqCst);
        assert_eq!(f.scheduler.dispatch_once(2_500).await.unwrap().failed, 1);
        let old_goal = f
            .store
            .get_cron_job_run("digest:2000")
            .await
            .unwrap()
            .unwrap()
            .goal_id
            .unwrap();
        f.executor.fail.store(false, Ordering::SeqCst);

        let mut edited = agent("digest", 1_000);
        edited.description = "Summarize the inbox and the calendar".into();
        edited.definition_hash = definition_hash(&edited);
        let scheduler = AgentScheduler::new(
            f.store.clone(),
            Arc::new(ConfigAgentRegistry::from_definitions(vec![edited])),
            f.executor.clone(),
            config(),
            "node-a".into(),
        );
        let report = scheduler.dispatch_once(4_500).await.unwrap();
        assert_eq!(report.dispatched, 1);

        let old = f.store.get_cron_job_run("digest:2000").await.unwrap().unwrap();
        assert_eq!(old.status, CronJobRunStatus::Superseded);
        let cancelled = f.store.get_goal(&old_goal).await.unwrap().unwrap();
        assert_eq!(cancelled.status, GoalStatus::Cancelled);

        let new = f.store.get_cron_job_run("digest:4000").await.unwrap().unwrap();
        assert_eq!(new.status, CronJobRunStatus::Dispatched);
        assert_eq!(f.executor.submitted(), vec![new.goal_id.unwrap()]);
    }

    #[tokio::test]
    async fn pickup_skips_tick_goals_of_failed_occurrences() {
        let start = crate::utils::now_ms();
        let f = fixture(vec![agent("digest", 3_600_000)], Some(start)).await;
        f.executor.fail.store(true, Ordering::SeqCst);
        assert_eq!(f.scheduler.dispatch_once(start).await.unwrap().failed, 1);
        let run_key = format!("digest:{}", start);
        let goal_id = f
            .store
            .get_cron_job_run(&run_key)
            .await
            .unwrap()
            .unwrap()
            .goal_id
            .unwrap();
        f.executor.fail.store(false, Ordering::SeqCst);

        // Past the grace period, but the job is still backing off.
        let report = f.scheduler.dispatch_once(start + 500).await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(report.orphans_submitted, 0);
        assert!(f.executor.submitted().is_empty());

        // A pending row whose submit never completed is an orphan.
        f.store
            .update_cron_job_run(&run_key, CronJobRunStatus::Pending, None, None, start)
            .await
            .unwrap();
        let report = f.scheduler.dispatch_once(start + 600).await.unwrap();
        assert_eq!(report.orphans_submitted, 1);
        assert_eq!(f.executor.submitted(), vec![goal_id.clone()]);
        let run = f.store.get_cron_job_run(&run_key).await.unwrap().unwrap();
        assert_eq!(run.status, CronJobRunStatus::Dispatched);
        assert_eq!(run.goal_id.as_deref(), Some(goal_id.as_str()));

        // Once the backoff lapses the occurrence is already dispatched.
        let report = f.scheduler.dispatch_once(start + 1_000).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(f.executor.submitted().len(), 1);
    }

    #[tokio::test]
    async fn hung_submit_times_out() {
        let f = fixture(vec![agent("digest", 1_000)], Some(2_000)).await;
        f.executor.hang.store(true, Ordering::SeqCst);
        let report = f.scheduler.dispatch_once(2_000).await.unwrap();
        assert_eq!(report.failed, 1);
        let job = f.store.get_cron_job("digest").await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn adhoc_goals_are_picked_up() {
        let f = fixture(vec![], None).await;
        let goal = f
            .scheduler
            .persist_adhoc_goal(
                NewGoal {
                    title: "one-off".into(),
                    ..Default::default()
                },
                vec![NewWorkItem {
                    title: "do it".into(),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();

        let report = f.scheduler.dispatch_once(1).await.unwrap();
        assert_eq!(report.adhoc_submitted, 1);
        assert_eq!(f.executor.submitted(), vec![goal.id.clone()]);
        assert_eq!(f.scheduler.dispatch_once(2).await.unwrap().adhoc_submitted, 0);
    }

    #[tokio::test]
    async fn adhoc_pickup_can_be_disabled_and_cycles_are_rejected() {
        let f = fixture(vec![], None).await;
        let scheduler = AgentScheduler::new(
            f.store.clone(),
            Arc::new(ConfigAgentRegistry::default()),
            f.executor.clone(),
            config(),
            "cli".into(),
        )
        .without_queued_pickup();
        scheduler
            .persist_adhoc_goal(
                NewGoal {
                    title: "later".into(),
                    ..Default::default()
                },
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(scheduler.dispatch_once(1).await.unwrap().adhoc_submitted, 0);

        let err = scheduler
            .submit_adhoc_goal(
                NewGoal {
                    title: "loop".into(),
                    ..Default::default()
                },
                vec![
                    NewWorkItem {
                        id: Some("a".into()),
                        dependencies: vec!["b".into()],
                        ..Default::default()
                    },
                    NewWorkItem {
                        id: Some("b".into()),
                        dependencies: vec!["a".into()],
                        ..Default::default()
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert_eq!(
            f.store.get_goals_by_status(GoalStatus::Queued).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn spawned_loop_ticks_until_shutdown() {
        let f = fixture(vec![], None).await;
        let scheduler = Arc::new(AgentScheduler::new(
            f.store.clone(),
            Arc::new(ConfigAgentRegistry::default()),
            f.executor.clone(),
            SchedulerConfig {
                tick_interval_ms: 5,
                ..config()
            },
            "node-a".into(),
        ));
        let telemetry = scheduler.telemetry();
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let snapshot = telemetry.snapshot();
        assert!(snapshot.ticks >= 2);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_report.is_some());
    }
}
