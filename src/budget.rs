use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::BudgetConfig;
use crate::events::{EventBus, SchedulerEvent, SchedulerEventType};
use crate::traits::store_prelude::*;
use crate::traits::{Goal, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Tokens,
    TimeMinutes,
    CostUsd,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetUsage {
    pub dimension: BudgetDimension,
    pub spent: f64,
    pub limit: f64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BudgetCheck {
    pub within_budget: bool,
    /// Dimensions at or over their ceiling.
    pub violations: Vec<BudgetUsage>,
    /// Dimensions past the warning ratio but still under the ceiling.
    pub warnings: Vec<BudgetUsage>,
}

fn dimensions(goal: &Goal) -> [(BudgetDimension, f64, Option<f64>); 3] {
    [
        (
            BudgetDimension::Tokens,
            goal.spent_tokens as f64,
            goal.budget_tokens.map(|t| t as f64),
        ),
        (
            BudgetDimension::TimeMinutes,
            goal.spent_time_minutes,
            goal.budget_time_minutes,
        ),
        (BudgetDimension::CostUsd, goal.spent_cost_usd, goal.budget_cost_usd),
    ]
}

/// Pure check of a goal's spend against its ceilings. Absent ceilings never
/// constrain.
pub fn check_budget(goal: &Goal, warning_ratio: f64) -> BudgetCheck {
    let mut check = BudgetCheck {
        within_budget: true,
        ..Default::default()
    };
    for (dimension, spent, limit) in dimensions(goal) {
        let Some(limit) = limit else { continue };
        let ratio = if limit > 0.0 { spent / limit } else { f64::INFINITY };
        let usage = BudgetUsage {
            dimension,
            spent,
            limit,
            ratio,
        };
        if spent >= limit {
            check.within_budget = false;
            check.violations.push(usage);
        } else if ratio >= warning_ratio {
            check.warnings.push(usage);
        }
    }
    check
}

#[derive(Clone)]
pub struct BudgetTracker {
    store: Arc<dyn StateStore>,
    events: EventBus,
    warning_ratio: f64,
}

impl BudgetTracker {
    pub fn new(store: Arc<dyn StateStore>, events: EventBus, config: &BudgetConfig) -> Self {
        Self {
            store,
            events,
            warning_ratio: config.warning_ratio,
        }
    }

    pub fn check_budget(&self, goal: &Goal) -> BudgetCheck {
        check_budget(goal, self.warning_ratio)
    }

    /// Add usage to the goal's counters and emit warning or exceeded events for
    /// the updated totals. Returns the post-update check.
    pub async fn record_usage(
        &self,
        goal_id: &str,
        tokens: i64,
        time_seconds: f64,
        cost_usd: f64,
    ) -> anyhow::Result<Option<BudgetCheck>> {
        // Spent counters only grow. `f64::max` also maps NaN to zero.
        let (tokens, time_seconds, cost_usd) = {
            let clamped = (tokens.max(0), time_seconds.max(0.0), cost_usd.max(0.0));
            if clamped != (tokens, time_seconds, cost_usd) {
                warn!(
                    goal_id,
                    tokens, time_seconds, cost_usd, "Negative or invalid usage clamped to zero"
                );
            }
            clamped
        };
        let Some(goal) = self
            .store
            .record_goal_usage(goal_id, tokens, time_seconds / 60.0, cost_usd)
            .await?
        else {
            warn!(goal_id, "Usage recorded for unknown goal");
            return Ok(None);
        };

        let check = self.check_budget(&goal);
        if !check.violations.is_empty() {
            info!(
                goal_id,
                spent_tokens = goal.spent_tokens,
                spent_cost_usd = goal.spent_cost_usd,
                "Goal budget exceeded"
            );
            self.events.emit(
                SchedulerEvent::new(SchedulerEventType::BudgetExceeded)
                    .goal(goal_id)
                    .data(json!({ "violations": check.violations })),
            );
        } else if !check.warnings.is_empty() {
            self.events.emit(
                SchedulerEvent::new(SchedulerEventType::BudgetWarning)
                    .goal(goal_id)
                    .data(json!({ "warnings": check.warnings })),
            );
        }
        Ok(Some(check))
    }
}
