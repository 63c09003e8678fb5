use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::traits::{
    ClaimRequest, CronJob, CronJobDefinition, CronJobOutcome, CronJobRun, Decision, Escalation,
    EscalationContext, EscalationTransition, Goal, NewCronJobRun, NewRun, Run, RunCompletion,
    TaskContext, WorkItem,
};
use crate::types::{CronJobRunStatus, EscalationStatus, GoalStatus, UnknownVariant, WorkItemStatus};

mod cron_jobs;
mod decisions;
mod escalations;
mod goals;
mod migrations;
mod runs;
mod work_items;

#[cfg(test)]
mod tests;

/// Set restrictive file permissions (0600) on the database and WAL files.
#[cfg(unix)]
fn set_db_file_permissions(db_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
        tracing::warn!("Failed to set permissions on {}: {}", db_path, e);
    }
    for suffix in &["-wal", "-shm"] {
        let path = format!("{}{}", db_path, suffix);
        if std::path::Path::new(&path).exists() {
            if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                tracing::warn!("Failed to set permissions on {}: {}", path, e);
            }
        }
    }
}

#[cfg(not(unix))]
fn set_db_file_permissions(_db_path: &str) {}

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn new(db_path: &str, max_connections: u32) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;

        set_db_file_permissions(db_path);

        migrations::migrate_state(&pool).await?;

        tracing::debug!(db_path, "state store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_dt)
}

fn parse_enum<T>(raw: &str) -> anyhow::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    Ok(raw.parse::<T>()?)
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn to_json_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

fn parse_context(raw: &str) -> anyhow::Result<TaskContext> {
    Ok(TaskContext::from_json(raw)?)
}

/// `?, ?, ?` for an `IN (...)` clause.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
