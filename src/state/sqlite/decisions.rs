use super::*;

fn row_to_decision(row: &SqliteRow) -> anyhow::Result<Decision> {
    let decision_type: String = row.try_get("decision_type")?;
    let data: String = row.try_get("data")?;
    Ok(Decision {
        id: row.try_get("id")?,
        goal_id: row.try_get("goal_id")?,
        work_item_id: row.try_get("work_item_id")?,
        run_id: row.try_get("run_id")?,
        decision_type: parse_enum(&decision_type)?,
        summary: row.try_get("summary")?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        created_at: parse_dt(row.try_get("created_at")?),
    })
}

#[async_trait]
impl crate::traits::DecisionStore for SqliteStateStore {
    async fn create_decision(&self, decision: &Decision) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO decisions (
                id, goal_id, work_item_id, run_id, decision_type, summary, data, created_at
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id)
        .bind(&decision.goal_id)
        .bind(&decision.work_item_id)
        .bind(&decision.run_id)
        .bind(decision.decision_type.as_str())
        .bind(&decision.summary)
        .bind(decision.data.to_string())
        .bind(decision.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_decisions_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<Decision>> {
        let rows = sqlx::query(
            "SELECT * FROM decisions WHERE goal_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_decision).collect()
    }
}
