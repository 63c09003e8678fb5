//! Concurrency lanes.
//!
//! Each lane is a semaphore sized to its `max_concurrency`. Permits are handed
//! out without waiting; a caller that gets `None` defers the item to a later
//! pass.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{LaneConfig, LanesConfig};
use crate::traits::{Goal, TaskContext, WorkItem};
use crate::types::LaneId;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LaneStatus {
    pub lane: LaneId,
    pub active: usize,
    pub max_concurrency: usize,
    pub default_priority: i32,
    pub is_available: bool,
    pub started_total: u64,
    pub deferred_total: u64,
}

struct Lane {
    config: LaneConfig,
    permits: Arc<Semaphore>,
    started_total: AtomicU64,
    deferred_total: AtomicU64,
}

impl Lane {
    fn new(config: LaneConfig) -> Self {
        Self {
            config,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            started_total: AtomicU64::new(0),
            deferred_total: AtomicU64::new(0),
        }
    }

    fn active(&self) -> usize {
        self.config
            .max_concurrency
            .saturating_sub(self.permits.available_permits())
    }
}

/// Held while a work item occupies a lane slot.
#[derive(Debug)]
pub struct LanePermit {
    lane: LaneId,
    _permit: OwnedSemaphorePermit,
}

impl LanePermit {
    pub fn lane(&self) -> LaneId {
        self.lane
    }
}

pub struct LaneSelector {
    lanes: BTreeMap<LaneId, Lane>,
}

impl LaneSelector {
    pub fn new(config: &LanesConfig) -> Self {
        let mut lanes = BTreeMap::new();
        lanes.insert(LaneId::Main, Lane::new(config.main));
        lanes.insert(LaneId::Subagent, Lane::new(config.subagent));
        lanes.insert(LaneId::Cron, Lane::new(config.cron));
        lanes.insert(LaneId::Session, Lane::new(config.session));
        Self { lanes }
    }

    /// Pick a lane from provenance. The work item's context wins over the goal's.
    pub fn select_lane(&self, item: &WorkItem, goal: &Goal) -> LaneId {
        lane_for_context(&item.context)
            .or_else(|| lane_for_context(&goal.context))
            .unwrap_or(LaneId::Main)
    }

    pub fn has_capacity(&self, lane: LaneId) -> bool {
        self.lanes
            .get(&lane)
            .is_some_and(|l| l.permits.available_permits() > 0)
    }

    pub fn default_priority(&self, lane: LaneId) -> i32 {
        self.lanes
            .get(&lane)
            .map(|l| l.config.default_priority)
            .unwrap_or_default()
    }

    /// Take a slot in `lane` if one is free.
    pub fn try_acquire(&self, lane: LaneId) -> Option<LanePermit> {
        let l = self.lanes.get(&lane)?;
        match l.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                l.started_total.fetch_add(1, Ordering::Relaxed);
                Some(LanePermit {
                    lane,
                    _permit: permit,
                })
            }
            Err(_) => {
                l.deferred_total.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn get_lane_statuses(&self) -> BTreeMap<LaneId, LaneStatus> {
        self.lanes
            .iter()
            .map(|(id, l)| {
                let active = l.active();
                (
                    *id,
                    LaneStatus {
                        lane: *id,
                        active,
                        max_concurrency: l.config.max_concurrency,
                        default_priority: l.config.default_priority,
                        is_available: active < l.config.max_concurrency,
                        started_total: l.started_total.load(Ordering::Relaxed),
                        deferred_total: l.deferred_total.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

fn lane_for_context(ctx: &TaskContext) -> Option<LaneId> {
    match ctx {
        TaskContext::AgentTick(_) => Some(LaneId::Cron),
        TaskContext::Conversation(_) => Some(LaneId::Session),
        TaskContext::Subagent(_) => Some(LaneId::Subagent),
        TaskContext::Adhoc => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ConversationContext, NewGoal, NewWorkItem, SubagentContext};

    fn config(max: usize) -> LanesConfig {
        let lane = LaneConfig {
            max_concurrency: max,
            default_priority: 10,
        };
        LanesConfig {
            main: lane,
            subagent: lane,
            cron: lane,
            session: LaneConfig {
                max_concurrency: max,
                default_priority: 90,
            },
        }
    }

    fn goal(ctx: TaskContext) -> Goal {
        Goal::new(NewGoal {
            title: "g".into(),
            context: ctx,
            ..Default::default()
        })
    }

    fn item(ctx: TaskContext) -> WorkItem {
        WorkItem::new(
            "g",
            NewWorkItem {
                context: ctx,
                ..Default::default()
            },
        )
    }

    #[test]
    fn selects_lane_from_context() {
        let lanes = LaneSelector::new(&config(1));
        let conversation = TaskContext::Conversation(ConversationContext {
            session_id: "s".into(),
            channel: None,
        });
        let sub = TaskContext::Subagent(SubagentContext {
            parent_goal_id: "p".into(),
            parent_work_item_id: None,
        });

        assert_eq!(
            lanes.select_lane(&item(TaskContext::Adhoc), &goal(TaskContext::Adhoc)),
            LaneId::Main
        );
        assert_eq!(
            lanes.select_lane(&item(TaskContext::Adhoc), &goal(conversation.clone())),
            LaneId::Session
        );
        assert_eq!(
            lanes.select_lane(&item(sub), &goal(conversation)),
            LaneId::Subagent
        );
        assert_eq!(lanes.default_priority(LaneId::Session), 90);
    }

    #[test]
    fn permits_bound_concurrency() {
        let lanes = LaneSelector::new(&config(2));
        assert!(lanes.has_capacity(LaneId::Cron));
        let a = lanes.try_acquire(LaneId::Cron).unwrap();
        let _b = lanes.try_acquire(LaneId::Cron).unwrap();
        assert_eq!(a.lane(), LaneId::Cron);
        assert!(!lanes.has_capacity(LaneId::Cron));
        assert!(lanes.try_acquire(LaneId::Cron).is_none());
        // Other lanes are independent.
        assert!(lanes.has_capacity(LaneId::Main));

        let status = &lanes.get_lane_statuses()[&LaneId::Cron];
        assert_eq!(status.active, 2);
        assert!(!status.is_available);
        assert_eq!(status.started_total, 2);
        assert_eq!(status.deferred_total, 1);

        drop(a);
        assert!(lanes.has_capacity(LaneId::Cron));
        assert_eq!(lanes.get_lane_statuses()[&LaneId::Cron].active, 1);
    }

    #[test]
    fn reports_every_lane() {
        let lanes = LaneSelector::new(&config(3));
        let statuses = lanes.get_lane_statuses();
        assert_eq!(statuses.len(), 4);
        assert!(statuses.values().all(|s| s.is_available && s.active == 0));
    }
}
