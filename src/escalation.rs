//! Human-in-the-loop escalations.
//!
//! Legality is checked against the current row before anything is written, and
//! the write itself is conditional on the prior status, so two resolvers racing
//! on one escalation produce exactly one winner.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::events::{EventBus, SchedulerEvent, SchedulerEventType};
use crate::traits::store_prelude::*;
use crate::traits::{Escalation, EscalationTransition, NewEscalation, StateStore};
use crate::types::{EscalationStatus, EscalationType, ResolutionAction, Severity};

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("escalation {0} not found")]
    NotFound(String),
    #[error("cannot {action} escalation {id}: status is {from}")]
    InvalidTransition {
        id: String,
        from: EscalationStatus,
        action: &'static str,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

const PENDING: [EscalationStatus; 2] = [EscalationStatus::Open, EscalationStatus::Acknowledged];

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EscalationStatistics {
    pub total: usize,
    pub by_status: BTreeMap<EscalationStatus, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<EscalationType, usize>,
    /// Mean of `resolved_at - created_at` over resolved escalations.
    pub mean_resolution_ms: Option<f64>,
}

/// Whether an escalation should hold its goal in `blocked`.
pub fn is_blocking(esc: &Escalation) -> bool {
    esc.status.is_pending()
        && (matches!(
            esc.escalation_type,
            EscalationType::Stuck | EscalationType::Credential | EscalationType::Risk
        ) || esc.severity >= Severity::High)
}

#[derive(Clone)]
pub struct EscalationHandler {
    store: Arc<dyn StateStore>,
    events: EventBus,
}

impl EscalationHandler {
    pub fn new(store: Arc<dyn StateStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn create_escalation(&self, new: NewEscalation) -> Result<Escalation, EscalationError> {
        let escalation = Escalation::new(new);
        self.store.create_escalation(&escalation).await?;
        info!(
            escalation_id = %escalation.id,
            goal_id = %escalation.goal_id,
            work_item_id = %escalation.work_item_id,
            escalation_type = %escalation.escalation_type,
            severity = %escalation.severity,
            "Escalation created"
        );
        self.events.emit(
            SchedulerEvent::new(SchedulerEventType::EscalationCreated)
                .goal(&escalation.goal_id)
                .work_item(&escalation.work_item_id)
                .data(json!({
                    "escalation_id": escalation.id,
                    "escalation_type": escalation.escalation_type,
                    "severity": escalation.severity,
                    "title": escalation.title,
                })),
        );
        Ok(escalation)
    }

    pub async fn acknowledge_escalation(
        &self,
        id: &str,
        by: &str,
    ) -> Result<Escalation, EscalationError> {
        let transition = EscalationTransition {
            to: EscalationStatus::Acknowledged,
            resolution_action: None,
            resolver: Some(by.to_string()),
            notes: None,
            at: Utc::now(),
        };
        self.apply(id, &[EscalationStatus::Open], "acknowledge", &transition)
            .await
    }

    pub async fn resolve_escalation(
        &self,
        id: &str,
        action: ResolutionAction,
        resolver: &str,
        notes: Option<&str>,
    ) -> Result<Escalation, EscalationError> {
        let transition = EscalationTransition {
            to: EscalationStatus::Resolved,
            resolution_action: Some(action),
            resolver: Some(resolver.to_string()),
            notes: notes.map(str::to_string),
            at: Utc::now(),
        };
        let esc = self.apply(id, &PENDING, "resolve", &transition).await?;
        self.emit_resolved(&esc);
        Ok(esc)
    }

    pub async fn dismiss_escalation(
        &self,
        id: &str,
        resolver: &str,
        reason: &str,
    ) -> Result<Escalation, EscalationError> {
        let transition = EscalationTransition {
            to: EscalationStatus::Dismissed,
            resolution_action: None,
            resolver: Some(resolver.to_string()),
            notes: Some(reason.to_string()),
            at: Utc::now(),
        };
        let esc = self.apply(id, &PENDING, "dismiss", &transition).await?;
        self.emit_resolved(&esc);
        Ok(esc)
    }

    async fn apply(
        &self,
        id: &str,
        from: &[EscalationStatus],
        action: &'static str,
        transition: &EscalationTransition,
    ) -> Result<Escalation, EscalationError> {
        let current = self
            .store
            .get_escalation(id)
            .await?
            .ok_or_else(|| EscalationError::NotFound(id.to_string()))?;
        if !from.contains(&current.status) {
            return Err(EscalationError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                action,
            });
        }

        if !self.store.transition_escalation(id, from, transition).await? {
            // Lost a race; report whatever state the winner left behind.
            let now = self
                .store
                .get_escalation(id)
                .await?
                .map(|e| e.status)
                .unwrap_or(current.status);
            return Err(EscalationError::InvalidTransition {
                id: id.to_string(),
                from: now,
                action,
            });
        }

        let updated = self
            .store
            .get_escalation(id)
            .await?
            .ok_or_else(|| EscalationError::NotFound(id.to_string()))?;
        info!(
            escalation_id = %id,
            status = %updated.status,
            resolver = updated.resolver.as_deref().unwrap_or(""),
            "Escalation {}",
            action
        );
        Ok(updated)
    }

    fn emit_resolved(&self, esc: &Escalation) {
        self.events.emit(
            SchedulerEvent::new(SchedulerEventType::EscalationResolved)
                .goal(&esc.goal_id)
                .work_item(&esc.work_item_id)
                .data(json!({
                    "escalation_id": esc.id,
                    "status": esc.status,
                    "resolution_action": esc.resolution_action,
                    "resolver": esc.resolver,
                })),
        );
    }

    pub async fn get_escalation(&self, id: &str) -> Result<Option<Escalation>, EscalationError> {
        Ok(self.store.get_escalation(id).await?)
    }

    /// Open and acknowledged escalations, most severe first, then oldest.
    pub async fn get_pending_escalations(
        &self,
        goal_id: &str,
    ) -> Result<Vec<Escalation>, EscalationError> {
        let mut pending: Vec<Escalation> = self
            .store
            .get_escalations_by_goal(goal_id)
            .await?
            .into_iter()
            .filter(|e| e.status.is_pending())
            .collect();
        pending.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(pending)
    }

    pub async fn has_blocking_escalations(&self, goal_id: &str) -> Result<bool, EscalationError> {
        Ok(self
            .store
            .get_escalations_by_goal(goal_id)
            .await?
            .iter()
            .any(is_blocking))
    }

    pub async fn get_statistics(
        &self,
        goal_id: Option<&str>,
    ) -> Result<EscalationStatistics, EscalationError> {
        let all = match goal_id {
            Some(goal_id) => self.store.get_escalations_by_goal(goal_id).await?,
            None => self.store.list_escalations().await?,
        };

        let mut stats = EscalationStatistics {
            total: all.len(),
            ..Default::default()
        };
        let mut resolution_total_ms = 0i64;
        let mut resolved = 0i64;
        for esc in &all {
            *stats.by_status.entry(esc.status).or_default() += 1;
            *stats.by_severity.entry(esc.severity).or_default() += 1;
            *stats.by_type.entry(esc.escalation_type).or_default() += 1;
            if esc.status == EscalationStatus::Resolved {
                if let Some(at) = esc.resolved_at {
                    resolution_total_ms += (at - esc.created_at).num_milliseconds();
                    resolved += 1;
                }
            }
        }
        if resolved > 0 {
            stats.mean_resolution_ms = Some(resolution_total_ms as f64 / resolved as f64);
        }
        Ok(stats)
    }

    /// Most recently created escalation for a work item.
    pub async fn latest_for_work_item(
        &self,
        work_item_id: &str,
    ) -> Result<Option<Escalation>, EscalationError> {
        Ok(self
            .store
            .get_escalations_by_work_item(work_item_id)
            .await?
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use crate::traits::EscalationContext;

    fn handler() -> EscalationHandler {
        EscalationHandler::new(Arc::new(MemoryStateStore::new()), EventBus::new(32))
    }

    fn new_esc(goal: &str, t: EscalationType, s: Severity) -> NewEscalation {
        NewEscalation {
            work_item_id: "w1".into(),
            goal_id: goal.into(),
            run_id: None,
            escalation_type: t,
            severity: s,
            title: format!("{t} {s}"),
            description: String::new(),
            context_data: EscalationContext::None,
        }
    }

    #[tokio::test]
    async fn lifecycle_and_illegal_transitions() {
        let h = handler();
        let mut rx = h.events.subscribe();
        let esc = h
            .create_escalation(new_esc("g", EscalationType::Ambiguous, Severity::Medium))
            .await
            .unwrap();
        assert_eq!(esc.status, EscalationStatus::Open);
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            SchedulerEventType::EscalationCreated
        );

        let acked = h.acknowledge_escalation(&esc.id, "alice").await.unwrap();
        assert_eq!(acked.status, EscalationStatus::Acknowledged);
        assert!(acked.acknowledged_at.is_some());

        // Acknowledge is only legal from open.
        assert!(matches!(
            h.acknowledge_escalation(&esc.id, "bob").await,
            Err(EscalationError::InvalidTransition {
                from: EscalationStatus::Acknowledged,
                ..
            })
        ));

        let resolved = h
            .resolve_escalation(&esc.id, ResolutionAction::Retry, "alice", Some("try again"))
            .await
            .unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert_eq!(resolved.resolution_action, Some(ResolutionAction::Retry));
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            SchedulerEventType::EscalationResolved
        );

        // Terminal states are final.
        assert!(h.dismiss_escalation(&esc.id, "bob", "dup").await.is_err());
        assert!(h
            .resolve_escalation(&esc.id, ResolutionAction::Skip, "bob", None)
            .await
            .is_err());
        assert!(matches!(
            h.acknowledge_escalation("nope", "x").await,
            Err(EscalationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dismiss_from_open() {
        let h = handler();
        let esc = h
            .create_escalation(new_esc("g", EscalationType::Risk, Severity::Low))
            .await
            .unwrap();
        let dismissed = h.dismiss_escalation(&esc.id, "ops", "false alarm").await.unwrap();
        assert_eq!(dismissed.status, EscalationStatus::Dismissed);
        assert_eq!(dismissed.resolution_notes.as_deref(), Some("false alarm"));
        assert!(dismissed.resolved_at.is_some());
    }

    #[tokio::test]
    async fn pending_ordering_and_blocking() {
        let h = handler();
        let low = h
            .create_escalation(new_esc("g", EscalationType::Ambiguous, Severity::Low))
            .await
            .unwrap();
        let crit = h
            .create_escalation(new_esc("g", EscalationType::ValidationFailed, Severity::Critical))
            .await
            .unwrap();
        let med1 = h
            .create_escalation(new_esc("g", EscalationType::Ambiguous, Severity::Medium))
            .await
            .unwrap();
        let med2 = h
            .create_escalation(new_esc("g", EscalationType::Ambiguous, Severity::Medium))
            .await
            .unwrap();
        h.create_escalation(new_esc("other", EscalationType::Stuck, Severity::High))
            .await
            .unwrap();

        let ids: Vec<String> = h
            .get_pending_escalations("g")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![crit.id.clone(), med1.id, med2.id, low.id]);

        assert!(h.has_blocking_escalations("g").await.unwrap());
        h.dismiss_escalation(&crit.id, "ops", "handled").await.unwrap();
        // Only medium/low ambiguity left.
        assert!(!h.has_blocking_escalations("g").await.unwrap());
        assert!(h.has_blocking_escalations("other").await.unwrap());
    }

    #[tokio::test]
    async fn statistics_and_latest() {
        let h = handler();
        let a = h
            .create_escalation(new_esc("g", EscalationType::Stuck, Severity::High))
            .await
            .unwrap();
        let b = h
            .create_escalation(new_esc("g", EscalationType::Credential, Severity::High))
            .await
            .unwrap();
        h.resolve_escalation(&a.id, ResolutionAction::Skip, "ops", None)
            .await
            .unwrap();

        let stats = h.get_statistics(Some("g")).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status[&EscalationStatus::Resolved], 1);
        assert_eq!(stats.by_status[&EscalationStatus::Open], 1);
        assert_eq!(stats.by_severity[&Severity::High], 2);
        assert_eq!(stats.by_type[&EscalationType::Credential], 1);
        assert!(stats.mean_resolution_ms.unwrap() >= 0.0);

        let empty = h.get_statistics(Some("none")).await.unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.mean_resolution_ms.is_none());

        let latest = h.latest_for_work_item("w1").await.unwrap().unwrap();
        assert_eq!(latest.id, b.id);
    }
}
