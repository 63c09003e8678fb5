use super::*;

const CLEAR_CLAIM: &str = "claimed_by = NULL, claimed_at_ms = NULL, claim_expires_at_ms = NULL,
     in_flight_run_key = NULL, in_flight_goal_id = NULL, in_flight_started_at_ms = NULL";

fn row_to_cron_job(row: &SqliteRow) -> anyhow::Result<CronJob> {
    let schedule: String = row.try_get("schedule")?;
    Ok(CronJob {
        agent_id: row.try_get("agent_id")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        schedule: serde_json::from_str(&schedule)?,
        definition_hash: row.try_get("definition_hash")?,
        next_run_at_ms: row.try_get("next_run_at_ms")?,
        last_run_at_ms: row.try_get("last_run_at_ms")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at_ms: row.try_get("claimed_at_ms")?,
        claim_expires_at_ms: row.try_get("claim_expires_at_ms")?,
        in_flight_run_key: row.try_get("in_flight_run_key")?,
        in_flight_goal_id: row.try_get("in_flight_goal_id")?,
        in_flight_started_at_ms: row.try_get("in_flight_started_at_ms")?,
        failure_count: row.try_get("failure_count")?,
        backoff_until_ms: row.try_get("backoff_until_ms")?,
        last_error: row.try_get("last_error")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

fn row_to_cron_job_run(row: &SqliteRow) -> anyhow::Result<CronJobRun> {
    let status: String = row.try_get("status")?;
    Ok(CronJobRun {
        run_key: row.try_get("run_key")?,
        agent_id: row.try_get("agent_id")?,
        scheduled_for_ms: row.try_get("scheduled_for_ms")?,
        status: parse_enum(&status)?,
        goal_id: row.try_get("goal_id")?,
        coalesced_count: row.try_get("coalesced_count")?,
        definition_hash: row.try_get("definition_hash")?,
        claimed_by: row.try_get("claimed_by")?,
        error: row.try_get("error")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

/// Never-run jobs first, then earliest due.
fn sort_by_due(jobs: &mut [CronJob]) {
    jobs.sort_by(|a, b| {
        a.next_run_at_ms
            .cmp(&b.next_run_at_ms)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
}

#[async_trait]
impl crate::traits::CronJobStore for SqliteStateStore {
    async fn upsert_cron_job(&self, def: &CronJobDefinition, now_ms: i64) -> anyhow::Result<()> {
        let schedule = serde_json::to_string(&def.schedule)?;
        let reset = def.reset_next_run_at_ms.is_some();
        let next = def.reset_next_run_at_ms.flatten();
        sqlx::query(
            "INSERT INTO cron_jobs (
                agent_id, enabled, schedule, definition_hash, next_run_at_ms,
                created_at_ms, updated_at_ms
             )
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET
                enabled = excluded.enabled,
                schedule = excluded.schedule,
                definition_hash = excluded.definition_hash,
                next_run_at_ms = CASE WHEN ? THEN excluded.next_run_at_ms
                                      ELSE cron_jobs.next_run_at_ms END,
                updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&def.agent_id)
        .bind(def.enabled)
        .bind(&schedule)
        .bind(&def.definition_hash)
        .bind(next)
        .bind(now_ms)
        .bind(now_ms)
        .bind(reset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cron_job(&self, agent_id: &str) -> anyhow::Result<Option<CronJob>> {
        let row = sqlx::query("SELECT * FROM cron_jobs WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_cron_job).transpose()
    }

    async fn list_cron_jobs(&self) -> anyhow::Result<Vec<CronJob>> {
        let rows = sqlx::query("SELECT * FROM cron_jobs ORDER BY agent_id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_cron_job).collect()
    }

    async fn set_cron_job_enabled(
        &self,
        agent_id: &str,
        enabled: bool,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE cron_jobs SET enabled = ?, updated_at_ms = ? WHERE agent_id = ? AND enabled != ?",
        )
        .bind(enabled)
        .bind(now_ms)
        .bind(agent_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_due_cron_jobs(&self, req: ClaimRequest<'_>) -> anyhow::Result<Vec<CronJob>> {
        if req.limit <= 0 {
            return Ok(Vec::new());
        }
        // The write is the first statement, so the lock is held while the
        // predicate is evaluated. Dropping `tx` rolls back.
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE cron_jobs
             SET claimed_by = ?, claimed_at_ms = ?, claim_expires_at_ms = ?, updated_at_ms = ?
             WHERE agent_id IN (
                SELECT agent_id FROM cron_jobs
                WHERE enabled = 1
                  AND (next_run_at_ms IS NULL OR next_run_at_ms <= ?)
                  AND (claimed_by IS NULL OR claim_expires_at_ms IS NULL OR claim_expires_at_ms < ?)
                  AND (backoff_until_ms IS NULL OR backoff_until_ms <= ?)
                ORDER BY next_run_at_ms IS NOT NULL, next_run_at_ms ASC, agent_id ASC
                LIMIT ?
             )
             RETURNING *",
        )
        .bind(req.claimed_by)
        .bind(req.now_ms)
        .bind(req.now_ms.saturating_add(req.claim_ttl_ms))
        .bind(req.now_ms)
        .bind(req.now_ms)
        .bind(req.now_ms)
        .bind(req.now_ms)
        .bind(req.limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut jobs = rows
            .iter()
            .map(row_to_cron_job)
            .collect::<anyhow::Result<Vec<_>>>()?;
        sort_by_due(&mut jobs);
        Ok(jobs)
    }

    async fn release_cron_job_claim(
        &self,
        agent_id: &str,
        claimed_by: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let sql = format!(
            "UPDATE cron_jobs SET {CLEAR_CLAIM}, updated_at_ms = ? WHERE agent_id = ? AND claimed_by = ?"
        );
        let result = sqlx::query(&sql)
            .bind(now_ms)
            .bind(agent_id)
            .bind(claimed_by)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_cron_job_in_flight(
        &self,
        agent_id: &str,
        claimed_by: &str,
        run_key: &str,
        goal_id: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE cron_jobs
             SET in_flight_run_key = ?, in_flight_goal_id = ?, in_flight_started_at_ms = ?,
                 updated_at_ms = ?
             WHERE agent_id = ? AND claimed_by = ?",
        )
        .bind(run_key)
        .bind(goal_id)
        .bind(now_ms)
        .bind(now_ms)
        .bind(agent_id)
        .bind(claimed_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_cron_job_after_outcome(
        &self,
        agent_id: &str,
        claimed_by: &str,
        outcome: &CronJobOutcome,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let result = match outcome {
            CronJobOutcome::Dispatched {
                scheduled_for_ms,
                next_run_at_ms,
            } => {
                let sql = format!(
                    "UPDATE cron_jobs
                     SET next_run_at_ms = ?, last_run_at_ms = ?, failure_count = 0,
                         backoff_until_ms = NULL, last_error = NULL, {CLEAR_CLAIM},
                         updated_at_ms = ?
                     WHERE agent_id = ? AND claimed_by = ?"
                );
                sqlx::query(&sql)
                    .bind(next_run_at_ms)
                    .bind(scheduled_for_ms)
                    .bind(now_ms)
                    .bind(agent_id)
                    .bind(claimed_by)
                    .execute(&self.pool)
                    .await?
            }
            CronJobOutcome::Skipped { next_run_at_ms } => {
                let sql = format!(
                    "UPDATE cron_jobs
                     SET next_run_at_ms = ?, {CLEAR_CLAIM}, updated_at_ms = ?
                     WHERE agent_id = ? AND claimed_by = ?"
                );
                sqlx::query(&sql)
                    .bind(next_run_at_ms)
                    .bind(now_ms)
                    .bind(agent_id)
                    .bind(claimed_by)
                    .execute(&self.pool)
                    .await?
            }
            CronJobOutcome::Failed {
                error,
                backoff_until_ms,
            } => {
                let sql = format!(
                    "UPDATE cron_jobs
                     SET failure_count = failure_count + 1, backoff_until_ms = ?,
                         last_error = ?, {CLEAR_CLAIM}, updated_at_ms = ?
                     WHERE agent_id = ? AND claimed_by = ?"
                );
                sqlx::query(&sql)
                    .bind(backoff_until_ms)
                    .bind(error)
                    .bind(now_ms)
                    .bind(agent_id)
                    .bind(claimed_by)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn get_or_create_cron_job_run(
        &self,
        run: &NewCronJobRun,
    ) -> anyhow::Result<(CronJobRun, bool)> {
        let result = sqlx::query(
            "INSERT INTO cron_job_runs (
                run_key, agent_id, scheduled_for_ms, status, coalesced_count,
                definition_hash, claimed_by, created_at_ms, updated_at_ms
             )
             VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(run.run_key())
        .bind(&run.agent_id)
        .bind(run.scheduled_for_ms)
        .bind(run.coalesced_count)
        .bind(&run.definition_hash)
        .bind(&run.claimed_by)
        .bind(run.now_ms)
        .bind(run.now_ms)
        .execute(&self.pool)
        .await?;
        let created = result.rows_affected() == 1;

        let row = sqlx::query(
            "SELECT * FROM cron_job_runs WHERE agent_id = ? AND scheduled_for_ms = ?",
        )
        .bind(&run.agent_id)
        .bind(run.scheduled_for_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok((row_to_cron_job_run(&row)?, created))
    }

    async fn get_cron_job_run(&self, run_key: &str) -> anyhow::Result<Option<CronJobRun>> {
        let row = sqlx::query("SELECT * FROM cron_job_runs WHERE run_key = ?")
            .bind(run_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_cron_job_run).transpose()
    }

    async fn update_cron_job_run(
        &self,
        run_key: &str,
        status: CronJobRunStatus,
        goal_id: Option<&str>,
        error: Option<&str>,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE cron_job_runs
             SET status = ?, goal_id = COALESCE(?, goal_id), error = ?, updated_at_ms = ?
             WHERE run_key = ?",
        )
        .bind(status.as_str())
        .bind(goal_id)
        .bind(error)
        .bind(now_ms)
        .bind(run_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_cron_job_runs(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<CronJobRun>> {
        let rows = sqlx::query(
            "SELECT * FROM cron_job_runs WHERE agent_id = ?
             ORDER BY scheduled_for_ms DESC LIMIT ?",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_cron_job_run).collect()
    }
}
