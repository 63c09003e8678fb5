use super::*;

fn row_to_run(row: &SqliteRow) -> anyhow::Result<Run> {
    let status: String = row.try_get("status")?;
    let artifacts: String = row.try_get("artifacts")?;
    Ok(Run {
        id: row.try_get("id")?,
        work_item_id: row.try_get("work_item_id")?,
        goal_id: row.try_get("goal_id")?,
        agent_type: row.try_get("agent_type")?,
        run_sequence: row.try_get("run_sequence")?,
        status: parse_enum(&status)?,
        model: row.try_get("model")?,
        lane: row.try_get("lane")?,
        tokens_used: row.try_get("tokens_used")?,
        cost_usd: row.try_get("cost_usd")?,
        time_seconds: row.try_get("time_seconds")?,
        artifacts: parse_json_list(&artifacts),
        error_message: row.try_get("error_message")?,
        execution_log: row.try_get("execution_log")?,
        started_at: parse_dt(row.try_get("started_at")?),
        completed_at: parse_opt_dt(row.try_get("completed_at")?),
    })
}

#[async_trait]
impl crate::traits::RunStore for SqliteStateStore {
    async fn create_run(&self, run: &NewRun) -> anyhow::Result<Run> {
        // Sequence is computed inside the insert so concurrent attempts on
        // one work item cannot pick the same number.
        let row = sqlx::query(
            "INSERT INTO runs (
                id, work_item_id, goal_id, agent_type, run_sequence, status,
                model, lane, started_at
             )
             SELECT ?, ?, ?, ?, COALESCE(MAX(run_sequence), 0) + 1, 'running', ?, ?, ?
             FROM runs WHERE work_item_id = ?
             RETURNING *",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&run.work_item_id)
        .bind(&run.goal_id)
        .bind(&run.agent_type)
        .bind(&run.model)
        .bind(&run.lane)
        .bind(Utc::now().to_rfc3339())
        .bind(&run.work_item_id)
        .fetch_one(&self.pool)
        .await?;
        row_to_run(&row)
    }

    async fn complete_run(
        &self,
        id: &str,
        completion: &RunCompletion,
    ) -> anyhow::Result<Option<Run>> {
        let status = if completion.success {
            crate::types::RunStatus::Completed
        } else {
            crate::types::RunStatus::Failed
        };
        let row = sqlx::query(
            "UPDATE runs
             SET status = ?, tokens_used = ?, cost_usd = ?, time_seconds = ?,
                 artifacts = ?, error_message = ?, execution_log = ?, completed_at = ?
             WHERE id = ? AND status = 'running'
             RETURNING *",
        )
        .bind(status.as_str())
        .bind(completion.tokens_used)
        .bind(completion.cost_usd)
        .bind(completion.time_seconds)
        .bind(to_json_list(&completion.artifacts))
        .bind(&completion.error_message)
        .bind(&completion.execution_log)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn get_run(&self, id: &str) -> anyhow::Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn get_runs_by_work_item(&self, work_item_id: &str) -> anyhow::Result<Vec<Run>> {
        let rows = sqlx::query("SELECT * FROM runs WHERE work_item_id = ? ORDER BY run_sequence ASC")
            .bind(work_item_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn get_latest_run(&self, work_item_id: &str) -> anyhow::Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT * FROM runs WHERE work_item_id = ? ORDER BY run_sequence DESC LIMIT 1",
        )
        .bind(work_item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_run).transpose()
    }
}
