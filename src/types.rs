//! Status and kind enums shared by the store, the dispatch loop and the
//! execution engine. All of them persist as their snake_case text form.

use thiserror::Error;

/// Returned when a persisted or configured string does not name a known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            #[allow(dead_code)]
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Lifecycle of a goal. Terminal states never reopen.
    GoalStatus {
        Queued => "queued",
        Active => "active",
        Blocked => "blocked",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl GoalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GoalStatus::Completed | GoalStatus::Failed | GoalStatus::Cancelled
        )
    }

    /// Legal edges of the goal lifecycle.
    pub fn can_transition_to(self, next: GoalStatus) -> bool {
        use GoalStatus::*;
        matches!(
            (self, next),
            (Queued, Active | Cancelled | Failed)
                | (Active, Blocked | Completed | Failed | Cancelled)
                | (Blocked, Active | Failed | Cancelled)
        )
    }

    /// States from which `next` may be entered.
    pub fn sources_of(next: GoalStatus) -> Vec<GoalStatus> {
        GoalStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

string_enum! {
    WorkItemStatus {
        Ready => "ready",
        Blocked => "blocked",
        InProgress => "in_progress",
        Verify => "verify",
        Done => "done",
        Failed => "failed",
    }
}

string_enum! {
    WorkItemType {
        Doc => "doc",
        Test => "test",
        Refactor => "refactor",
        Code => "code",
        Analysis => "analysis",
    }
}

string_enum! {
    /// T-shirt size estimate attached to a work item.
    Effort {
        S => "S",
        M => "M",
        L => "L",
        XL => "XL",
    }
}

string_enum! {
    VerificationStatus {
        NotStarted => "not_started",
        Passed => "passed",
        Failed => "failed",
        Skipped => "skipped",
    }
}

string_enum! {
    RunStatus {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    EscalationType {
        Stuck => "stuck",
        Ambiguous => "ambiguous",
        Risk => "risk",
        Credential => "credential",
        ValidationFailed => "validation_failed",
    }
}

string_enum! {
    /// Ordered low to critical, so `Ord` sorts by urgency.
    Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

string_enum! {
    EscalationStatus {
        Open => "open",
        Acknowledged => "acknowledged",
        Resolved => "resolved",
        Dismissed => "dismissed",
    }
}

impl EscalationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EscalationStatus::Resolved | EscalationStatus::Dismissed)
    }

    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }
}

string_enum! {
    /// What the human decided when resolving an escalation.
    ResolutionAction {
        Retry => "retry",
        Skip => "skip",
        Modify => "modify",
        Abort => "abort",
        ProvideInput => "provide_input",
    }
}

string_enum! {
    /// `superseded`: a failed occurrence replaced by a newer one after the
    /// agent definition changed. Its queued goal is cancelled.
    CronJobRunStatus {
        Pending => "pending",
        Dispatched => "dispatched",
        Failed => "failed",
        Superseded => "superseded",
    }
}

string_enum! {
    DecisionType {
        ModelSelection => "model_selection",
        LaneAssignment => "lane_assignment",
        Retry => "retry",
        Escalation => "escalation",
        BudgetHalt => "budget_halt",
    }
}

string_enum! {
    /// Concurrency partition a work item executes in.
    LaneId {
        Main => "main",
        Subagent => "subagent",
        Cron => "cron",
        Session => "session",
    }
}

string_enum! {
    ComplexityTier {
        Simple => "simple",
        Medium => "medium",
        Complex => "complex",
    }
}
