use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::daemon::{self, StatusState};
use crate::events::{EventBus, SchedulerEvent, SchedulerEventType};
use crate::execution::{EngineComponents, ExecutionEngine};
use crate::lanes::LaneSelector;
use crate::reconcile::{reconcile_cron_jobs_from_registry, ReconcileReport};
use crate::registry::ConfigAgentRegistry;
use crate::router::{ConfiguredAvailability, ModelSelector};
use crate::runners::RunnerRegistry;
use crate::scheduler::{AgentScheduler, DispatchReport};
use crate::state::SqliteStateStore;
use crate::traits::store_prelude::*;
use crate::traits::{AgentRegistry, ExecutionScheduler, Goal, NewGoal, NewWorkItem};
use crate::types::GoalStatus;
use crate::utils::now_ms;

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStateStore>> {
    let store = Arc::new(
        SqliteStateStore::new(&config.state.db_path, config.state.max_connections).await?,
    );
    info!("State store initialized ({})", config.state.db_path);
    Ok(store)
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. State store
    let store = open_store(&config).await?;

    // 2. Agent registry
    let agents = Arc::new(ConfigAgentRegistry::from_config(&config.agents)?);
    info!(agents = agents.list_agents().len(), "Agent registry loaded");

    // 3. Cron rows follow the registry
    let report = reconcile_cron_jobs_from_registry(store.as_ref(), agents.as_ref(), now_ms()).await?;
    info!(
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        disabled = report.disabled,
        "Cron jobs reconciled"
    );

    // 4. Runners
    let runners = Arc::new(RunnerRegistry::from_config(
        &config.runners,
        config.execution.default_runner.clone(),
    ));
    for name in runners.names() {
        info!(runner = %name, "Registered runner");
    }
    if runners.names().is_empty() {
        warn!("No runners configured; work items will fail permanently");
    }

    // 5. Model selector
    let selector = ModelSelector::new(
        config.models.clone(),
        Arc::new(ConfiguredAvailability::new(config.models.available.clone())),
    );

    // 6. Execution engine
    let shutdown = CancellationToken::new();
    let events = EventBus::new(config.execution.event_capacity);
    let engine = ExecutionEngine::new(EngineComponents {
        store: store.clone(),
        events: events.clone(),
        lanes: Arc::new(LaneSelector::new(&config.lanes)),
        selector,
        runners,
        agents: agents.clone(),
        budget: config.budget.clone(),
        retry: config.retry.clone(),
        poll_interval: Duration::from_millis(config.execution.poll_interval_ms.max(1)),
        shutdown: shutdown.clone(),
    });

    // 7. Event log
    spawn_event_logger(events.subscribe(), shutdown.clone());

    // 8. Dispatch loop
    let instance_id = config.daemon.resolve_instance_id();
    let scheduler = Arc::new(AgentScheduler::new(
        store.clone(),
        agents,
        Arc::new(engine.clone()),
        config.scheduler.clone(),
        instance_id.clone(),
    ));
    let telemetry = scheduler.telemetry();
    let dispatch_handle = if config.scheduler.enabled {
        Some(scheduler.spawn(shutdown.clone()))
    } else {
        warn!("Scheduler disabled; cron jobs will not be dispatched by this instance");
        None
    };

    // 9. Health server
    let status = StatusState {
        instance_id: instance_id.clone(),
        store,
        engine,
        telemetry,
    };
    let bind = config.daemon.health_bind.clone();
    let port = config.daemon.health_port;
    let health_shutdown = shutdown.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = daemon::start_health_server(&bind, port, status, health_shutdown).await {
            error!("Health server error: {:#}", e);
        }
    });

    info!(instance_id = %instance_id, "Starting ponybunny v{}", env!("CARGO_PKG_VERSION"));

    // 10. Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    if let Some(handle) = dispatch_handle {
        if let Err(e) = handle.await {
            error!("Dispatch loop ended abnormally: {}", e);
        }
    }
    let _ = health_handle.await;
    info!("Stopped");
    Ok(())
}

fn spawn_event_logger(mut rx: broadcast::Receiver<SchedulerEvent>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => {
                    let goal_id = event.goal_id.as_deref().unwrap_or("-");
                    match event.event_type {
                        SchedulerEventType::GoalFailed
                        | SchedulerEventType::BudgetExceeded
                        | SchedulerEventType::EscalationCreated => {
                            warn!(event = ?event.event_type, goal_id, "Scheduler event")
                        }
                        SchedulerEventType::GoalCompleted | SchedulerEventType::GoalCancelled => {
                            info!(event = ?event.event_type, goal_id, "Scheduler event")
                        }
                        _ => debug!(event = ?event.event_type, goal_id, "Scheduler event"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Stands in for an execution engine in processes that only persist work:
/// goals stay `queued` until a daemon's dispatch tick picks them up.
pub struct QueueOnlyExecutor {
    store: Arc<dyn StateStore>,
    events: EventBus,
}

impl QueueOnlyExecutor {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            events: EventBus::default(),
        }
    }
}

#[async_trait]
impl ExecutionScheduler for QueueOnlyExecutor {
    async fn submit_goal(&self, goal: &Goal) -> anyhow::Result<()> {
        info!(goal_id = %goal.id, "Goal left queued for a running daemon");
        Ok(())
    }

    async fn cancel_goal(&self, goal_id: &str) -> anyhow::Result<()> {
        let cancelled = self
            .store
            .transition_goal_status(
                goal_id,
                &[GoalStatus::Queued, GoalStatus::Active, GoalStatus::Blocked],
                GoalStatus::Cancelled,
            )
            .await?;
        if !cancelled {
            match self.store.get_goal(goal_id).await? {
                None => anyhow::bail!("goal {} not found", goal_id),
                Some(goal) => {
                    info!(goal_id, status = %goal.status, "Cancel requested for finished goal");
                    return Ok(());
                }
            }
        }
        info!(goal_id, "Goal cancelled");
        self.events.emit(SchedulerEvent::new(SchedulerEventType::GoalCancelled).goal(goal_id));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }
}

/// Human-readable summary printed by `check-config`. Assumes `validate` passed.
pub fn describe_config(config: &AppConfig) -> Vec<String> {
    let mut lines = vec![format!("database: {}", config.state.db_path)];

    lines.push(format!("agents: {}", config.agents.len()));
    for agent in &config.agents {
        let schedule = agent
            .schedule
            .resolve(&agent.timezone)
            .map(|s| s.to_string())
            .unwrap_or_else(|e| format!("invalid ({})", e));
        lines.push(format!(
            "  {}{}: {} [runner: {}]",
            agent.id,
            if agent.enabled { "" } else { " (disabled)" },
            schedule,
            agent.runner.as_deref().or(config.execution.default_runner.as_deref()).unwrap_or("none"),
        ));
    }

    let l = &config.lanes;
    lines.push(format!(
        "lanes: main={} subagent={} cron={} session={}",
        l.main.max_concurrency, l.subagent.max_concurrency, l.cron.max_concurrency, l.session.max_concurrency
    ));

    let m = &config.models;
    lines.push(format!(
        "models: simple={} medium={} complex={} default={}",
        or_dash(&m.tiers.simple.primary),
        or_dash(&m.tiers.medium.primary),
        or_dash(&m.tiers.complex.primary),
        or_dash(&m.primary),
    ));

    let mut runners: Vec<&String> = config.runners.keys().collect();
    runners.sort();
    lines.push(format!(
        "runners: {}",
        if runners.is_empty() {
            "-".to_string()
        } else {
            runners.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        }
    ));
    lines
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

pub async fn reconcile_once(config: &AppConfig) -> anyhow::Result<ReconcileReport> {
    let store = open_store(config).await?;
    let agents = ConfigAgentRegistry::from_config(&config.agents)?;
    reconcile_cron_jobs_from_registry(store.as_ref(), &agents, now_ms()).await
}

fn queue_only_scheduler(
    config: &AppConfig,
    store: Arc<dyn StateStore>,
    agents: Arc<dyn AgentRegistry>,
) -> AgentScheduler {
    AgentScheduler::new(
        store.clone(),
        agents,
        Arc::new(QueueOnlyExecutor::new(store)),
        config.scheduler.clone(),
        config.daemon.resolve_instance_id(),
    )
    .without_queued_pickup()
}

/// Reconcile, then run one dispatch tick. Dispatched goals stay `queued`.
pub async fn dispatch_once(config: &AppConfig) -> anyhow::Result<DispatchReport> {
    let store = open_store(config).await?;
    let agents = Arc::new(ConfigAgentRegistry::from_config(&config.agents)?);
    let now = now_ms();
    reconcile_cron_jobs_from_registry(store.as_ref(), agents.as_ref(), now).await?;
    queue_only_scheduler(config, store, agents).dispatch_once(now).await
}

/// Persist an ad-hoc goal with one work item for a running daemon to pick up.
pub async fn submit(config: &AppConfig, title: &str, description: &str) -> anyhow::Result<Goal> {
    let store = open_store(config).await?;
    let scheduler = queue_only_scheduler(config, store, Arc::new(ConfigAgentRegistry::default()));
    scheduler
        .persist_adhoc_goal(
            NewGoal {
                title: title.to_string(),
                description: description.to_string(),
                ..Default::default()
            },
            vec![NewWorkItem {
                title: title.to_string(),
                description: description.to_string(),
                ..Default::default()
            }],
        )
        .await
}

pub async fn cancel(config: &AppConfig, goal_id: &str) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    QueueOnlyExecutor::new(store).cancel_goal(goal_id).await
}
