use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{Goal, WorkItem};
use crate::events::SchedulerEvent;
use crate::schedule::ScheduleSpec;
use crate::types::{Effort, LaneId, WorkItemType};

/// Accepts goals for execution and reports progress as events.
#[async_trait]
pub trait ExecutionScheduler: Send + Sync {
    /// Hand a persisted goal over for execution. Returns once accepted.
    async fn submit_goal(&self, goal: &Goal) -> anyhow::Result<()>;

    /// Cancel a goal's in-flight work. The recurring schedule is unaffected.
    async fn cancel_goal(&self, goal_id: &str) -> anyhow::Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent>;
}

/// Source of agent definitions the reconciler and dispatch loop consult.
pub trait AgentRegistry: Send + Sync {
    fn get_agent(&self, agent_id: &str) -> Option<AgentDefinition>;

    fn list_agents(&self) -> Vec<AgentDefinition>;

    fn enabled_agents(&self) -> Vec<AgentDefinition> {
        self.list_agents().into_iter().filter(|a| a.enabled).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub agent_type: String,
    pub enabled: bool,
    pub schedule: ScheduleSpec,
    pub policy: AgentPolicy,
    /// Name of the runner in the runner registry.
    pub runner: Option<String>,
    /// Hex SHA-256 of the canonical definition; changes on any config drift.
    pub definition_hash: String,
}

/// Execution policy snapshot carried into each tick's goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPolicy {
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub item_type: WorkItemType,
    pub effort: Effort,
    pub budget_tokens: Option<i64>,
    pub budget_time_minutes: Option<f64>,
    pub budget_cost_usd: Option<f64>,
    pub model: Option<ModelPair>,
    pub success_criteria: Vec<String>,
    pub tool_allowlist: Vec<String>,
    pub tool_denylist: Vec<String>,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            priority: None,
            max_retries: None,
            item_type: WorkItemType::Analysis,
            effort: Effort::S,
            budget_tokens: None,
            budget_time_minutes: None,
            budget_cost_usd: None,
            model: None,
            success_criteria: Vec::new(),
            tool_allowlist: Vec::new(),
            tool_denylist: Vec::new(),
        }
    }
}

/// A primary model with an optional fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPair {
    pub primary: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

/// Whether a model id can currently be used.
pub trait ModelAvailability: Send + Sync {
    fn is_model_supported(&self, model: &str) -> bool;
}

impl<F> ModelAvailability for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_model_supported(&self, model: &str) -> bool {
        self(model)
    }
}

/// Opaque executor for a single work item run.
#[async_trait]
pub trait WorkItemRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: RunRequest) -> anyhow::Result<RunReport>;
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub goal: Goal,
    pub work_item: WorkItem,
    pub model: String,
    pub lane: LaneId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunReport {
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub artifacts: Vec<String>,
    pub log: Option<String>,
    /// `None` means the run succeeded.
    pub failure: Option<RunFailure>,
}

impl RunReport {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            failure: Some(RunFailure {
                kind,
                message: message.into(),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Failure classification used by the retry handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Timeout,
    Credential,
    Validation,
    Ambiguous,
    Risk,
    Permanent,
}
