use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskContext;
use crate::types::{
    DecisionType, Effort, GoalStatus, RunStatus, VerificationStatus, WorkItemStatus, WorkItemType,
};

pub const DEFAULT_PRIORITY: i32 = 50;

/// A top-level unit of autonomous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: GoalStatus,
    /// Higher is more urgent.
    pub priority: i32,
    /// Ordered, verifiable statements of done.
    pub success_criteria: Vec<String>,
    pub budget_tokens: Option<i64>,
    pub budget_time_minutes: Option<f64>,
    pub budget_cost_usd: Option<f64>,
    pub spent_tokens: i64,
    pub spent_time_minutes: f64,
    pub spent_cost_usd: f64,
    pub context: TaskContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new goal. Everything else starts zeroed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewGoal {
    pub title: String,
    pub description: String,
    pub priority: Option<i32>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    pub budget_tokens: Option<i64>,
    pub budget_time_minutes: Option<f64>,
    pub budget_cost_usd: Option<f64>,
    #[serde(default)]
    pub context: TaskContext,
}

impl Goal {
    pub fn new(new: NewGoal) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            status: GoalStatus::Queued,
            priority: new.priority.unwrap_or(DEFAULT_PRIORITY),
            success_criteria: new.success_criteria,
            budget_tokens: new.budget_tokens,
            budget_time_minutes: new.budget_time_minutes,
            budget_cost_usd: new.budget_cost_usd,
            spent_tokens: 0,
            spent_time_minutes: 0.0,
            spent_cost_usd: 0.0,
            context: new.context,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One node of a goal's execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub goal_id: String,
    pub title: String,
    pub description: String,
    pub item_type: WorkItemType,
    pub status: WorkItemStatus,
    pub priority: i32,
    /// Ids of work items in the same goal that must be `done` first.
    pub dependencies: Vec<String>,
    /// Inverse of `dependencies`, derived when the goal's items are created.
    pub blocks: Vec<String>,
    pub estimated_effort: Effort,
    pub retry_count: i32,
    pub max_retries: i32,
    pub verification_plan: Option<String>,
    pub verification_status: VerificationStatus,
    /// Agent id whose runner executes this item.
    pub assigned_agent: Option<String>,
    pub context: TaskContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    /// Optional caller-chosen id so dependencies can reference siblings.
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub item_type: WorkItemType,
    pub priority: Option<i32>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub estimated_effort: Effort,
    pub max_retries: Option<i32>,
    pub verification_plan: Option<String>,
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub context: TaskContext,
}

impl Default for NewWorkItem {
    fn default() -> Self {
        Self {
            id: None,
            title: String::new(),
            description: String::new(),
            item_type: WorkItemType::Code,
            priority: None,
            dependencies: Vec::new(),
            estimated_effort: Effort::M,
            max_retries: None,
            verification_plan: None,
            assigned_agent: None,
            context: TaskContext::Adhoc,
        }
    }
}

pub const DEFAULT_MAX_RETRIES: i32 = 3;

impl WorkItem {
    pub fn new(goal_id: &str, new: NewWorkItem) -> Self {
        let now = Utc::now();
        let status = if new.dependencies.is_empty() {
            WorkItemStatus::Ready
        } else {
            WorkItemStatus::Blocked
        };
        Self {
            id: new
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            goal_id: goal_id.to_string(),
            title: new.title,
            description: new.description,
            item_type: new.item_type,
            status,
            priority: new.priority.unwrap_or(DEFAULT_PRIORITY),
            dependencies: new.dependencies,
            blocks: Vec::new(),
            estimated_effort: new.estimated_effort,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            verification_status: VerificationStatus::NotStarted,
            verification_plan: new.verification_plan,
            assigned_agent: new.assigned_agent,
            context: new.context,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One execution attempt of a work item. The latest run is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub work_item_id: String,
    pub goal_id: String,
    pub agent_type: String,
    pub run_sequence: i64,
    pub status: RunStatus,
    pub model: Option<String>,
    pub lane: Option<String>,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub time_seconds: f64,
    pub artifacts: Vec<String>,
    pub error_message: Option<String>,
    pub execution_log: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub work_item_id: String,
    pub goal_id: String,
    pub agent_type: String,
    pub model: Option<String>,
    pub lane: Option<String>,
}

/// Final accounting for a run.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub success: bool,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub time_seconds: f64,
    pub artifacts: Vec<String>,
    pub error_message: Option<String>,
    pub execution_log: Option<String>,
}

/// Audit record for a policy or model decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub goal_id: String,
    pub work_item_id: Option<String>,
    pub run_id: Option<String>,
    pub decision_type: DecisionType,
    pub summary: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        goal_id: &str,
        work_item_id: Option<&str>,
        decision_type: DecisionType,
        summary: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal_id: goal_id.to_string(),
            work_item_id: work_item_id.map(str::to_string),
            run_id: None,
            decision_type,
            summary: summary.into(),
            data,
            created_at: Utc::now(),
        }
    }
}
