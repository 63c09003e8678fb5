use super::*;

fn row_to_goal(row: &SqliteRow) -> anyhow::Result<Goal> {
    let status: String = row.try_get("status")?;
    let criteria: String = row.try_get("success_criteria")?;
    let context: String = row.try_get("context")?;
    Ok(Goal {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: parse_enum(&status)?,
        priority: row.try_get("priority")?,
        success_criteria: parse_json_list(&criteria),
        budget_tokens: row.try_get("budget_tokens")?,
        budget_time_minutes: row.try_get("budget_time_minutes")?,
        budget_cost_usd: row.try_get("budget_cost_usd")?,
        spent_tokens: row.try_get("spent_tokens")?,
        spent_time_minutes: row.try_get("spent_time_minutes")?,
        spent_cost_usd: row.try_get("spent_cost_usd")?,
        context: parse_context(&context)?,
        created_at: parse_dt(row.try_get("created_at")?),
        updated_at: parse_dt(row.try_get("updated_at")?),
    })
}

#[async_trait]
impl crate::traits::GoalStore for SqliteStateStore {
    async fn create_goal(&self, goal: &Goal) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO goals (
                id, title, description, status, priority, success_criteria,
                budget_tokens, budget_time_minutes, budget_cost_usd,
                spent_tokens, spent_time_minutes, spent_cost_usd,
                context, created_at, updated_at
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&goal.id)
        .bind(&goal.title)
        .bind(&goal.description)
        .bind(goal.status.as_str())
        .bind(goal.priority)
        .bind(to_json_list(&goal.success_criteria))
        .bind(goal.budget_tokens)
        .bind(goal.budget_time_minutes)
        .bind(goal.budget_cost_usd)
        .bind(goal.spent_tokens)
        .bind(goal.spent_time_minutes)
        .bind(goal.spent_cost_usd)
        .bind(goal.context.to_json())
        .bind(goal.created_at.to_rfc3339())
        .bind(goal.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_goal(&self, id: &str) -> anyhow::Result<Option<Goal>> {
        let row = sqlx::query("SELECT * FROM goals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_goal).transpose()
    }

    async fn get_goals_by_status(&self, status: GoalStatus) -> anyhow::Result<Vec<Goal>> {
        let rows = sqlx::query(
            "SELECT * FROM goals WHERE status = ? ORDER BY priority DESC, created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_goal).collect()
    }

    async fn transition_goal_status(
        &self,
        id: &str,
        from: &[GoalStatus],
        to: GoalStatus,
    ) -> anyhow::Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE goals SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_goal_usage(
        &self,
        id: &str,
        tokens: i64,
        time_minutes: f64,
        cost_usd: f64,
    ) -> anyhow::Result<Option<Goal>> {
        let row = sqlx::query(
            "UPDATE goals
             SET spent_tokens = spent_tokens + ?,
                 spent_time_minutes = spent_time_minutes + ?,
                 spent_cost_usd = spent_cost_usd + ?,
                 updated_at = ?
             WHERE id = ?
             RETURNING *",
        )
        .bind(tokens)
        .bind(time_minutes)
        .bind(cost_usd)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_goal).transpose()
    }
}
