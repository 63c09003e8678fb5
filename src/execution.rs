//! Execution engine.
//!
//! `submit_goal` flips a persisted goal from `queued` to `active` and spawns a
//! driver task for it. The driver polls the store, starts ready work items in
//! their lanes, and settles the goal once every item is done or one has
//! failed for good. Each work item attempt runs in its own task with a child
//! of the goal's cancellation token.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::BudgetTracker;
use crate::config::{BudgetConfig, RetryConfig};
use crate::dag::{self, DagError};
use crate::escalation::EscalationHandler;
use crate::events::{EventBus, SchedulerEvent, SchedulerEventType};
use crate::goal_tokens::GoalTokenRegistry;
use crate::lanes::{LanePermit, LaneSelector};
use crate::retry::{RetryDecision, RetryHandler};
use crate::router::ModelSelector;
use crate::runners::RunnerRegistry;
use crate::traits::{
    AgentRegistry, Decision, EscalationContext, ExecutionScheduler, FailureKind, Goal,
    NewEscalation, NewRun, RunCompletion, RunFailure, RunReport, RunRequest, StateStore, WorkItem,
};
use crate::traits::store_prelude::*;
use crate::types::{
    DecisionType, EscalationStatus, EscalationType, GoalStatus, LaneId, ResolutionAction,
    VerificationStatus, WorkItemStatus,
};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("goal {0} not found")]
    GoalNotFound(String),
    #[error("goal {id} cannot be submitted from status {status}")]
    GoalNotSubmittable { id: String, status: GoalStatus },
    #[error("goal {id} has an invalid work item graph: {source}")]
    InvalidGraph {
        id: String,
        #[source]
        source: DagError,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Everything the engine needs, wired up in `core`.
pub struct EngineComponents {
    pub store: Arc<dyn StateStore>,
    pub events: EventBus,
    pub lanes: Arc<LaneSelector>,
    pub selector: ModelSelector,
    pub runners: Arc<RunnerRegistry>,
    pub agents: Arc<dyn AgentRegistry>,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
    pub poll_interval: Duration,
    pub shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StateStore>,
    events: EventBus,
    lanes: Arc<LaneSelector>,
    selector: ModelSelector,
    runners: Arc<RunnerRegistry>,
    agents: Arc<dyn AgentRegistry>,
    escalations: EscalationHandler,
    budget: BudgetTracker,
    retry: RetryHandler,
    tokens: GoalTokenRegistry,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(c: EngineComponents) -> Self {
        let escalations = EscalationHandler::new(c.store.clone(), c.events.clone());
        let budget = BudgetTracker::new(c.store.clone(), c.events.clone(), &c.budget);
        Self {
            inner: Arc::new(Inner {
                store: c.store,
                events: c.events,
                lanes: c.lanes,
                selector: c.selector,
                runners: c.runners,
                agents: c.agents,
                escalations,
                budget,
                retry: RetryHandler::new(c.retry),
                tokens: GoalTokenRegistry::new(),
                poll_interval: c.poll_interval,
                shutdown: c.shutdown,
            }),
        }
    }

    pub fn escalations(&self) -> &EscalationHandler {
        &self.inner.escalations
    }

    pub fn lanes(&self) -> &LaneSelector {
        &self.inner.lanes
    }

    /// Goals with a live driver in this process.
    pub async fn active_goal_ids(&self) -> Vec<String> {
        self.inner.tokens.active_goal_ids().await
    }

    pub async fn submit(&self, goal_id: &str) -> Result<(), ExecutionError> {
        let inner = &self.inner;
        let goal = inner
            .store
            .get_goal(goal_id)
            .await?
            .ok_or_else(|| ExecutionError::GoalNotFound(goal_id.to_string()))?;
        if goal.status != GoalStatus::Queued {
            return Err(ExecutionError::GoalNotSubmittable {
                id: goal.id,
                status: goal.status,
            });
        }

        let items = inner.store.get_work_items_by_goal(goal_id).await?;
        dag::validate_acyclic(&items).map_err(|source| ExecutionError::InvalidGraph {
            id: goal_id.to_string(),
            source,
        })?;

        if !inner
            .store
            .transition_goal_status(goal_id, &[GoalStatus::Queued], GoalStatus::Active)
            .await?
        {
            let status = inner
                .store
                .get_goal(goal_id)
                .await?
                .map(|g| g.status)
                .unwrap_or(GoalStatus::Cancelled);
            return Err(ExecutionError::GoalNotSubmittable {
                id: goal_id.to_string(),
                status,
            });
        }

        let token = inner.tokens.register(goal_id).await;
        info!(goal_id, items = items.len(), "Goal started");
        inner.events.emit(
            SchedulerEvent::new(SchedulerEventType::GoalStarted)
                .goal(goal_id)
                .data(json!({ "title": goal.title, "work_items": items.len() })),
        );

        let driver = inner.clone();
        let goal_id = goal_id.to_string();
        tokio::spawn(async move { driver.drive_goal(goal_id, token).await });
        Ok(())
    }

    pub async fn cancel(&self, goal_id: &str) -> anyhow::Result<()> {
        let inner = &self.inner;
        inner.tokens.cancel(goal_id).await;
        let Some(goal) = inner.store.get_goal(goal_id).await? else {
            anyhow::bail!("goal {} not found", goal_id);
        };
        if goal.status.is_terminal() {
            info!(goal_id, status = %goal.status, "Cancel requested for finished goal");
            return Ok(());
        }
        inner
            .finish_goal(goal_id, GoalStatus::Cancelled, "cancelled on request")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionScheduler for ExecutionEngine {
    async fn submit_goal(&self, goal: &Goal) -> anyhow::Result<()> {
        self.submit(&goal.id).await?;
        Ok(())
    }

    async fn cancel_goal(&self, goal_id: &str) -> anyhow::Result<()> {
        self.cancel(goal_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }
}

enum Step {
    Continue,
    Finished,
}

impl Inner {
    async fn drive_goal(self: Arc<Self>, goal_id: String, token: CancellationToken) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(goal_id = %goal_id, error = %e, "Work item task panicked");
                }
            }
            if token.is_cancelled() || self.shutdown.is_cancelled() {
                break;
            }

            match self.step(&goal_id, &token, &mut in_flight).await {
                Ok(Step::Finished) => break,
                Ok(Step::Continue) => {}
                Err(e) => warn!(goal_id = %goal_id, error = %e, "Goal driver step failed"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        // Runs race the goal token, so cancelling lets them record their state.
        token.cancel();
        while in_flight.join_next().await.is_some() {}
        self.tokens.remove(&goal_id).await;
        debug!(goal_id = %goal_id, "Goal driver stopped");
    }

    async fn step(
        self: &Arc<Self>,
        goal_id: &str,
        token: &CancellationToken,
        in_flight: &mut JoinSet<()>,
    ) -> anyhow::Result<Step> {
        let Some(goal) = self.store.get_goal(goal_id).await? else {
            warn!(goal_id, "Goal disappeared from the store");
            return Ok(Step::Finished);
        };
        if goal.status.is_terminal() {
            info!(goal_id, status = %goal.status, "Goal reached a terminal state");
            return Ok(Step::Finished);
        }

        let check = self.budget.check_budget(&goal);
        if !check.within_budget {
            token.cancel();
            self.store
                .create_decision(&Decision::new(
                    goal_id,
                    None,
                    DecisionType::BudgetHalt,
                    "budget exceeded, halting goal",
                    json!({ "violations": check.violations }),
                ))
                .await?;
            self.finish_goal(goal_id, GoalStatus::Failed, "budget exceeded")
                .await?;
            return Ok(Step::Finished);
        }

        let mut items = self.store.get_work_items_by_goal(goal_id).await?;
        let done_ids: HashSet<String> = items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Done)
            .map(|i| i.id.clone())
            .collect();
        for item in items
            .iter_mut()
            .filter(|i| i.status == WorkItemStatus::Blocked)
        {
            self.reevaluate_blocked(item, &done_ids).await?;
        }

        if items.iter().all(|i| i.status == WorkItemStatus::Done) {
            self.finish_goal(goal_id, GoalStatus::Completed, "all work items done")
                .await?;
            return Ok(Step::Finished);
        }
        if in_flight.is_empty() && items.iter().any(|i| i.status == WorkItemStatus::Failed) {
            self.finish_goal(goal_id, GoalStatus::Failed, "work item failed")
                .await?;
            return Ok(Step::Finished);
        }

        let blocking = self.escalations.has_blocking_escalations(goal_id).await?;
        let status = match (goal.status, blocking) {
            (GoalStatus::Active, true) => {
                if self
                    .store
                    .transition_goal_status(goal_id, &[GoalStatus::Active], GoalStatus::Blocked)
                    .await?
                {
                    info!(goal_id, "Goal blocked on escalation");
                }
                GoalStatus::Blocked
            }
            (GoalStatus::Blocked, false) => {
                if self
                    .store
                    .transition_goal_status(goal_id, &[GoalStatus::Blocked], GoalStatus::Active)
                    .await?
                {
                    info!(goal_id, "Goal unblocked");
                }
                GoalStatus::Active
            }
            (s, _) => s,
        };
        if status != GoalStatus::Active {
            return Ok(Step::Continue);
        }

        let done: HashSet<&str> = items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Done)
            .map(|i| i.id.as_str())
            .collect();
        let mut ready: Vec<&WorkItem> = items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Ready && dag::dependencies_satisfied(i, &done))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        for item in ready {
            let lane = self.lanes.select_lane(item, &goal);
            let Some(permit) = self.lanes.try_acquire(lane) else {
                debug!(goal_id, work_item_id = %item.id, lane = %lane, "Lane full, deferring");
                continue;
            };
            if !self
                .store
                .update_work_item_status(&item.id, WorkItemStatus::InProgress)
                .await?
            {
                continue;
            }
            let mut item = item.clone();
            item.status = WorkItemStatus::InProgress;
            self.events.emit(
                SchedulerEvent::new(SchedulerEventType::WorkItemStarted)
                    .goal(goal_id)
                    .work_item(&item.id)
                    .data(json!({ "lane": lane })),
            );

            let engine = self.clone();
            let goal = goal.clone();
            let child = token.child_token();
            in_flight.spawn(async move {
                let item_id = item.id.clone();
                if let Err(e) = engine.execute_work_item(goal, item, lane, permit, child).await {
                    error!(work_item_id = %item_id, error = %e, "Work item execution failed");
                    engine.recover_work_item(&item_id).await;
                }
            });
        }
        Ok(Step::Continue)
    }

    /// Put an item an aborted attempt left in `in_progress` back to `ready`
    /// so the next driver step picks it up again.
    async fn recover_work_item(&self, item_id: &str) {
        let result = async {
            match self.store.get_work_item(item_id).await? {
                Some(item) if item.status == WorkItemStatus::InProgress => {
                    self.store
                        .update_work_item_status(item_id, WorkItemStatus::Ready)
                        .await
                }
                _ => Ok(false),
            }
        }
        .await;
        match result {
            Ok(true) => warn!(work_item_id = %item_id, "Work item reset to ready after a failed attempt"),
            Ok(false) => {}
            Err(e) => error!(work_item_id = %item_id, error = %e, "Could not reset work item"),
        }
    }

    /// Unblock an item once its dependencies are done or a human has answered
    /// its latest escalation.
    async fn reevaluate_blocked(
        &self,
        item: &mut WorkItem,
        done_ids: &HashSet<String>,
    ) -> anyhow::Result<()> {
        let latest = self
            .escalations
            .latest_for_work_item(&item.id)
            .await
            .map_err(anyhow::Error::from)?;

        let next = match latest {
            None => {
                let done: HashSet<&str> = done_ids.iter().map(String::as_str).collect();
                if !dag::dependencies_satisfied(item, &done) {
                    return Ok(());
                }
                WorkItemStatus::Ready
            }
            Some(esc) if esc.status.is_pending() => return Ok(()),
            Some(esc) if esc.status == EscalationStatus::Dismissed => WorkItemStatus::Failed,
            Some(esc) => match esc.resolution_action {
                Some(ResolutionAction::Retry)
                | Some(ResolutionAction::Modify)
                | Some(ResolutionAction::ProvideInput) => {
                    item.retry_count = 0;
                    WorkItemStatus::Ready
                }
                Some(ResolutionAction::Skip) => {
                    item.verification_status = VerificationStatus::Skipped;
                    WorkItemStatus::Done
                }
                Some(ResolutionAction::Abort) | None => WorkItemStatus::Failed,
            },
        };

        info!(work_item_id = %item.id, status = %next, "Blocked work item re-evaluated");
        item.status = next;
        self.store.update_work_item(item).await?;
        if next == WorkItemStatus::Failed {
            self.events.emit(
                SchedulerEvent::new(SchedulerEventType::WorkItemFailed)
                    .goal(&item.goal_id)
                    .work_item(&item.id)
                    .data(json!({ "reason": "escalation aborted or dismissed" })),
            );
        }
        Ok(())
    }

    async fn execute_work_item(
        &self,
        goal: Goal,
        mut item: WorkItem,
        lane: LaneId,
        permit: LanePermit,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let override_pair = item
            .context
            .as_agent_tick()
            .and_then(|t| t.policy.model.clone());
        let selection = self
            .selector
            .select_for_work_item(&item, override_pair.as_ref());
        self.store
            .create_decision(&Decision::new(
                &goal.id,
                Some(&item.id),
                DecisionType::ModelSelection,
                selection.reasoning.clone(),
                json!({
                    "model": selection.model,
                    "tier": selection.tier,
                    "complexity_score": selection.complexity_score,
                    "candidates": selection.candidates,
                    "available": selection.available,
                    "lane": lane,
                }),
            ))
            .await?;

        let runner = self.runners.resolve(&item, self.agents.as_ref());
        let run = self
            .store
            .create_run(&NewRun {
                work_item_id: item.id.clone(),
                goal_id: goal.id.clone(),
                agent_type: runner
                    .as_ref()
                    .map(|r| r.name().to_string())
                    .unwrap_or_else(|| "none".to_string()),
                model: Some(selection.model.clone()),
                lane: Some(lane.to_string()),
            })
            .await?;
        info!(
            goal_id = %goal.id,
            work_item_id = %item.id,
            run_id = %run.id,
            model = %selection.model,
            lane = %lane,
            "Work item run started"
        );

        let started = Instant::now();
        let mut cancelled = false;
        let report = match runner {
            None => RunReport::failed(FailureKind::Permanent, "no runner configured for work item"),
            Some(runner) => {
                let request = RunRequest {
                    run_id: run.id.clone(),
                    goal: goal.clone(),
                    work_item: item.clone(),
                    model: selection.model.clone(),
                    lane,
                };
                let fut = AssertUnwindSafe(runner.run(request)).catch_unwind();
                tokio::select! {
                    _ = token.cancelled() => {
                        cancelled = true;
                        RunReport::failed(FailureKind::Transient, "cancelled")
                    }
                    result = fut => match result {
                        Ok(Ok(report)) => report,
                        Ok(Err(e)) => RunReport::failed(FailureKind::Transient, format!("{:#}", e)),
                        Err(_) => RunReport::failed(FailureKind::Transient, "runner panicked"),
                    },
                }
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        self.store
            .complete_run(
                &run.id,
                &RunCompletion {
                    success: report.failure.is_none(),
                    tokens_used: report.tokens_used,
                    cost_usd: report.cost_usd,
                    time_seconds: elapsed,
                    artifacts: report.artifacts.clone(),
                    error_message: report.failure.as_ref().map(|f| f.message.clone()),
                    execution_log: report.log.clone(),
                },
            )
            .await?;
        self.budget
            .record_usage(&goal.id, report.tokens_used, elapsed, report.cost_usd)
            .await?;
        drop(permit);

        if cancelled {
            info!(work_item_id = %item.id, "Work item run cancelled");
            self.store
                .update_work_item_status(&item.id, WorkItemStatus::Ready)
                .await?;
            return Ok(());
        }

        match report.failure {
            None => {
                item.status = WorkItemStatus::Done;
                if item.verification_plan.is_some() {
                    item.verification_status = VerificationStatus::Passed;
                }
                self.store.update_work_item(&item).await?;
                info!(work_item_id = %item.id, run_id = %run.id, "Work item done");
                self.events.emit(
                    SchedulerEvent::new(SchedulerEventType::WorkItemCompleted)
                        .goal(&goal.id)
                        .work_item(&item.id)
                        .run(&run.id),
                );
            }
            Some(failure) => {
                self.handle_failure(&goal, item, &run.id, failure, &token)
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        goal: &Goal,
        mut item: WorkItem,
        run_id: &str,
        failure: RunFailure,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let decision = self.retry.decide(&item, &failure);
        warn!(
            work_item_id = %item.id,
            run_id,
            kind = ?failure.kind,
            error = %failure.message,
            "Work item run failed"
        );
        match decision {
            RetryDecision::Retry { attempt, delay_ms } => {
                item.retry_count = attempt;
                self.store.update_work_item(&item).await?;
                self.store
                    .create_decision(&Decision::new(
                        &goal.id,
                        Some(&item.id),
                        DecisionType::Retry,
                        format!("retry {} of {} in {}ms", attempt, item.max_retries, delay_ms),
                        json!({ "attempt": attempt, "delay_ms": delay_ms, "error": failure.message }),
                    ))
                    .await?;
                // The item stays in_progress while it waits out the delay.
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
                self.store
                    .update_work_item_status(&item.id, WorkItemStatus::Ready)
                    .await?;
            }
            RetryDecision::Escalate {
                escalation_type,
                severity,
                reason,
            } => {
                let context_data = match escalation_type {
                    EscalationType::Stuck => EscalationContext::Stuck {
                        attempts: item.retry_count,
                        last_error: Some(failure.message.clone()),
                    },
                    EscalationType::ValidationFailed => EscalationContext::Validation {
                        failed_checks: Vec::new(),
                        output: Some(failure.message.clone()),
                    },
                    EscalationType::Risk => EscalationContext::Risk {
                        assessment: failure.message.clone(),
                        affected: Vec::new(),
                    },
                    EscalationType::Credential => EscalationContext::Credential {
                        required: Vec::new(),
                    },
                    EscalationType::Ambiguous => EscalationContext::None,
                };
                let escalation = self
                    .escalations
                    .create_escalation(NewEscalation {
                        work_item_id: item.id.clone(),
                        goal_id: goal.id.clone(),
                        run_id: Some(run_id.to_string()),
                        escalation_type,
                        severity,
                        title: format!("{}: {}", escalation_type, item.title),
                        description: reason,
                        context_data,
                    })
                    .await
                    .map_err(anyhow::Error::from)?;
                item.status = WorkItemStatus::Blocked;
                self.store.update_work_item(&item).await?;
                self.store
                    .create_decision(&Decision::new(
                        &goal.id,
                        Some(&item.id),
                        DecisionType::Escalation,
                        format!("escalated as {} ({})", escalation_type, severity),
                        json!({ "escalation_id": escalation.id }),
                    ))
                    .await?;
            }
            RetryDecision::Fail { reason } => {
                item.status = WorkItemStatus::Failed;
                if item.verification_plan.is_some() {
                    item.verification_status = VerificationStatus::Failed;
                }
                self.store.update_work_item(&item).await?;
                self.events.emit(
                    SchedulerEvent::new(SchedulerEventType::WorkItemFailed)
                        .goal(&goal.id)
                        .work_item(&item.id)
                        .run(run_id)
                        .data(json!({ "reason": reason })),
                );
            }
        }
        Ok(())
    }

    /// Move a goal into a terminal state and announce it. Losing the race to
    /// another transition is not an error.
    async fn finish_goal(&self, goal_id: &str, to: GoalStatus, reason: &str) -> anyhow::Result<bool> {
        if !self.store.update_goal_status(goal_id, to).await? {
            debug!(goal_id, to = %to, "Goal already left the expected state");
            return Ok(false);
        }
        let event_type = match to {
            GoalStatus::Completed => SchedulerEventType::GoalCompleted,
            GoalStatus::Cancelled => SchedulerEventType::GoalCancelled,
            _ => SchedulerEventType::GoalFailed,
        };
        info!(goal_id, status = %to, reason, "Goal finished");
        self.events.emit(
            SchedulerEvent::new(event_type)
                .goal(goal_id)
                .data(json!({ "reason": reason })),
        );
        Ok(true)
    }
}
