//! Scheduler events and the broadcast bus that carries them.
//!
//! The bus is fire-and-forget: emitting with no subscribers is not an error,
//! and slow subscribers observe `RecvError::Lagged` rather than blocking the
//! emitter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerEventType {
    GoalStarted,
    GoalCompleted,
    GoalFailed,
    GoalCancelled,
    WorkItemStarted,
    WorkItemCompleted,
    WorkItemFailed,
    EscalationCreated,
    EscalationResolved,
    BudgetWarning,
    BudgetExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub event_type: SchedulerEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl SchedulerEvent {
    pub fn new(event_type: SchedulerEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            goal_id: None,
            work_item_id: None,
            run_id: None,
            data: None,
        }
    }

    pub fn goal(mut self, goal_id: &str) -> Self {
        self.goal_id = Some(goal_id.to_string());
        self
    }

    pub fn work_item(mut self, work_item_id: &str) -> Self {
        self.work_item_id = Some(work_item_id.to_string());
        self
    }

    pub fn run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }
}

/// Cloneable handle onto one broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: SchedulerEvent) {
        debug!(
            event_type = ?event.event_type,
            goal_id = event.goal_id.as_deref().unwrap_or(""),
            work_item_id = event.work_item_id.as_deref().unwrap_or(""),
            "Scheduler event"
        );
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
