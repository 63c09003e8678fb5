//! Sync cron job rows with the agent registry.
//!
//! Rows are created for new agents, refreshed when an agent's definition
//! drifts, and disabled (never deleted) when an agent disappears. Running it
//! against an unchanged registry writes nothing.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{error, info};

use crate::traits::store_prelude::*;
use crate::traits::{AgentRegistry, CronJob, CronJobDefinition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub disabled: usize,
}

pub async fn reconcile_cron_jobs_from_registry(
    store: &dyn StateStore,
    registry: &dyn AgentRegistry,
    now_ms: i64,
) -> anyhow::Result<ReconcileReport> {
    let existing: HashMap<String, CronJob> = store
        .list_cron_jobs()
        .await?
        .into_iter()
        .map(|job| (job.agent_id.clone(), job))
        .collect();

    let mut report = ReconcileReport::default();
    let mut live = HashSet::new();

    for agent in registry.enabled_agents() {
        live.insert(agent.id.clone());

        let reset_next_run_at_ms = match existing.get(&agent.id) {
            None => Some(None),
            Some(job)
                if job.enabled
                    && job.definition_hash == agent.definition_hash
                    && job.schedule == agent.schedule =>
            {
                report.unchanged += 1;
                continue;
            }
            Some(job) if job.schedule != agent.schedule => {
                let schedule = match agent.schedule.compile() {
                    Ok(s) => s,
                    Err(e) => {
                        error!(agent_id = %agent.id, error = %e, "Agent schedule does not compile, skipping");
                        continue;
                    }
                };
                Some(Some(schedule.next_after_or_retry(now_ms)))
            }
            Some(_) => None,
        };

        let created = reset_next_run_at_ms == Some(None);
        store
            .upsert_cron_job(
                &CronJobDefinition {
                    agent_id: agent.id.clone(),
                    enabled: true,
                    schedule: agent.schedule.clone(),
                    definition_hash: agent.definition_hash.clone(),
                    reset_next_run_at_ms,
                },
                now_ms,
            )
            .await?;

        if created {
            info!(agent_id = %agent.id, "Cron job created");
            report.created += 1;
        } else {
            info!(
                agent_id = %agent.id,
                definition_hash = %agent.definition_hash,
                schedule_reset = reset_next_run_at_ms.is_some(),
                "Cron job updated"
            );
            report.updated += 1;
        }
    }

    for job in existing.values() {
        if job.enabled && !live.contains(&job.agent_id) {
            if store
                .set_cron_job_enabled(&job.agent_id, false, now_ms)
                .await?
            {
                info!(agent_id = %job.agent_id, "Cron job disabled, agent gone or disabled");
                report.disabled += 1;
            }
        }
    }

    Ok(report)
}
