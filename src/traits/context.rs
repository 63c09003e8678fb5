use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AgentPolicy;

/// Where a goal or work item came from. Stored as tagged JSON (`kind`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskContext {
    /// Submitted directly, no provenance.
    #[default]
    Adhoc,
    /// Synthesized by the dispatch loop for one cron occurrence.
    AgentTick(AgentTickContext),
    /// Originated from an interactive conversation.
    Conversation(ConversationContext),
    /// Spawned by another goal's work.
    Subagent(SubagentContext),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTickContext {
    pub agent_id: String,
    pub definition_hash: String,
    pub run_key: String,
    pub scheduled_for_ms: i64,
    #[serde(default)]
    pub coalesced_count: i64,
    /// Policy as it was when the occurrence was dispatched.
    pub policy: AgentPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteContext>,
}

/// Optional routing hint for where tick output should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteContext {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentContext {
    pub parent_goal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_work_item_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context is not a JSON object")]
    NotAnObject,
    #[error("context has no 'kind' discriminant")]
    MissingKind,
    #[error("unknown context kind '{0}'")]
    UnknownKind(String),
    #[error("malformed '{kind}' context: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TaskContext {
    const KINDS: [&'static str; 4] = ["adhoc", "agent_tick", "conversation", "subagent"];

    /// Convert untyped JSON text into a context, checking the discriminant first
    /// so unknown kinds are reported by name.
    pub fn from_json(raw: &str) -> Result<Self, ContextError> {
        if raw.trim().is_empty() {
            return Ok(TaskContext::Adhoc);
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ContextError::Malformed {
                kind: "?".to_string(),
                source: e,
            })?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ContextError> {
        let kind = value
            .as_object()
            .ok_or(ContextError::NotAnObject)?
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or(ContextError::MissingKind)?
            .to_string();
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ContextError::UnknownKind(kind));
        }
        serde_json::from_value(value).map_err(|source| ContextError::Malformed { kind, source })
    }

    pub fn to_json(&self) -> String {
        // Serializing a closed enum of plain fields cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"kind":"adhoc"}"#.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskContext::Adhoc => "adhoc",
            TaskContext::AgentTick(_) => "agent_tick",
            TaskContext::Conversation(_) => "conversation",
            TaskContext::Subagent(_) => "subagent",
        }
    }

    pub fn as_agent_tick(&self) -> Option<&AgentTickContext> {
        match self {
            TaskContext::AgentTick(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn is_adhoc(&self) -> bool {
        matches!(self, TaskContext::Adhoc)
    }
}
