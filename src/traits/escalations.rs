use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EscalationStatus, EscalationType, ResolutionAction, Severity};

/// A request for human intervention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub work_item_id: String,
    pub goal_id: String,
    pub run_id: Option<String>,
    pub escalation_type: EscalationType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub context_data: EscalationContext,
    pub status: EscalationStatus,
    pub resolution_action: Option<ResolutionAction>,
    pub resolver: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Type-specific detail attached to an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationContext {
    #[default]
    None,
    Risk {
        assessment: String,
        #[serde(default)]
        affected: Vec<String>,
    },
    Credential {
        required: Vec<String>,
    },
    Validation {
        #[serde(default)]
        failed_checks: Vec<String>,
        #[serde(default)]
        output: Option<String>,
    },
    Stuck {
        attempts: i32,
        last_error: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub work_item_id: String,
    pub goal_id: String,
    pub run_id: Option<String>,
    pub escalation_type: EscalationType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub context_data: EscalationContext,
}

impl Escalation {
    pub fn new(new: NewEscalation) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            work_item_id: new.work_item_id,
            goal_id: new.goal_id,
            run_id: new.run_id,
            escalation_type: new.escalation_type,
            severity: new.severity,
            title: new.title,
            description: new.description,
            context_data: new.context_data,
            status: EscalationStatus::Open,
            resolution_action: None,
            resolver: None,
            resolution_notes: None,
            created_at: now,
            acknowledged_at: None,
            resolved_at: None,
            updated_at: now,
        }
    }
}

/// A status change applied only if the row is still in one of the expected
/// prior states.
#[derive(Debug, Clone)]
pub struct EscalationTransition {
    pub to: EscalationStatus,
    pub resolution_action: Option<ResolutionAction>,
    pub resolver: Option<String>,
    pub notes: Option<String>,
    pub at: DateTime<Utc>,
}
