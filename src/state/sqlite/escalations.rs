use super::*;

fn row_to_escalation(row: &SqliteRow) -> anyhow::Result<Escalation> {
    let escalation_type: String = row.try_get("escalation_type")?;
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    let context_data: String = row.try_get("context_data")?;
    let action: Option<String> = row.try_get("resolution_action")?;
    Ok(Escalation {
        id: row.try_get("id")?,
        work_item_id: row.try_get("work_item_id")?,
        goal_id: row.try_get("goal_id")?,
        run_id: row.try_get("run_id")?,
        escalation_type: parse_enum(&escalation_type)?,
        severity: parse_enum(&severity)?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        context_data: serde_json::from_str::<EscalationContext>(&context_data)?,
        status: parse_enum(&status)?,
        resolution_action: action
            .as_deref()
            .map(parse_enum::<crate::types::ResolutionAction>)
            .transpose()?,
        resolver: row.try_get("resolver")?,
        resolution_notes: row.try_get("resolution_notes")?,
        created_at: parse_dt(row.try_get("created_at")?),
        acknowledged_at: parse_opt_dt(row.try_get("acknowledged_at")?),
        resolved_at: parse_opt_dt(row.try_get("resolved_at")?),
        updated_at: parse_dt(row.try_get("updated_at")?),
    })
}

#[async_trait]
impl crate::traits::EscalationStore for SqliteStateStore {
    async fn create_escalation(&self, escalation: &Escalation) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO escalations (
                id, work_item_id, goal_id, run_id, escalation_type, severity, title,
                description, context_data, status, resolution_action, resolver,
                resolution_notes, created_at, acknowledged_at, resolved_at, updated_at
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&escalation.id)
        .bind(&escalation.work_item_id)
        .bind(&escalation.goal_id)
        .bind(&escalation.run_id)
        .bind(escalation.escalation_type.as_str())
        .bind(escalation.severity.as_str())
        .bind(&escalation.title)
        .bind(&escalation.description)
        .bind(serde_json::to_string(&escalation.context_data)?)
        .bind(escalation.status.as_str())
        .bind(escalation.resolution_action.map(|a| a.as_str()))
        .bind(&escalation.resolver)
        .bind(&escalation.resolution_notes)
        .bind(escalation.created_at.to_rfc3339())
        .bind(escalation.acknowledged_at.map(|t| t.to_rfc3339()))
        .bind(escalation.resolved_at.map(|t| t.to_rfc3339()))
        .bind(escalation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_escalation(&self, id: &str) -> anyhow::Result<Option<Escalation>> {
        let row = sqlx::query("SELECT * FROM escalations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_escalation).transpose()
    }

    async fn get_escalations_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<Escalation>> {
        let rows = sqlx::query(
            "SELECT * FROM escalations WHERE goal_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_escalation).collect()
    }

    async fn get_escalations_by_work_item(
        &self,
        work_item_id: &str,
    ) -> anyhow::Result<Vec<Escalation>> {
        let rows = sqlx::query(
            "SELECT * FROM escalations WHERE work_item_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_escalation).collect()
    }

    async fn list_escalations(&self) -> anyhow::Result<Vec<Escalation>> {
        let rows = sqlx::query("SELECT * FROM escalations ORDER BY created_at ASC, rowid ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_escalation).collect()
    }

    async fn transition_escalation(
        &self,
        id: &str,
        from: &[EscalationStatus],
        transition: &EscalationTransition,
    ) -> anyhow::Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let at = transition.at.to_rfc3339();
        let acknowledged_at = (transition.to == EscalationStatus::Acknowledged).then(|| at.clone());
        let resolved_at = transition.to.is_terminal().then(|| at.clone());
        let sql = format!(
            "UPDATE escalations
             SET status = ?,
                 resolution_action = COALESCE(?, resolution_action),
                 resolver = COALESCE(?, resolver),
                 resolution_notes = COALESCE(?, resolution_notes),
                 acknowledged_at = COALESCE(?, acknowledged_at),
                 resolved_at = COALESCE(?, resolved_at),
                 updated_at = ?
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(transition.to.as_str())
            .bind(transition.resolution_action.map(|a| a.as_str()))
            .bind(&transition.resolver)
            .bind(&transition.notes)
            .bind(acknowledged_at)
            .bind(resolved_at)
            .bind(&at)
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}
