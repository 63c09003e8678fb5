use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;

use super::*;

fn row_to_work_item(row: &SqliteRow) -> anyhow::Result<WorkItem> {
    let item_type: String = row.try_get("item_type")?;
    let status: String = row.try_get("status")?;
    let effort: String = row.try_get("estimated_effort")?;
    let verification: String = row.try_get("verification_status")?;
    let dependencies: String = row.try_get("dependencies")?;
    let blocks: String = row.try_get("blocks")?;
    let context: String = row.try_get("context")?;
    Ok(WorkItem {
        id: row.try_get("id")?,
        goal_id: row.try_get("goal_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        item_type: parse_enum(&item_type)?,
        status: parse_enum(&status)?,
        priority: row.try_get("priority")?,
        dependencies: parse_json_list(&dependencies),
        blocks: parse_json_list(&blocks),
        estimated_effort: parse_enum(&effort)?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        verification_plan: row.try_get("verification_plan")?,
        verification_status: parse_enum(&verification)?,
        assigned_agent: row.try_get("assigned_agent")?,
        context: parse_context(&context)?,
        created_at: parse_dt(row.try_get("created_at")?),
        updated_at: parse_dt(row.try_get("updated_at")?),
    })
}

fn insert_work_item(item: &WorkItem) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO work_items (
            id, goal_id, title, description, item_type, status, priority,
            dependencies, blocks, estimated_effort, retry_count, max_retries,
            verification_plan, verification_status, assigned_agent, context,
            created_at, updated_at
         )
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&item.id)
    .bind(&item.goal_id)
    .bind(&item.title)
    .bind(&item.description)
    .bind(item.item_type.as_str())
    .bind(item.status.as_str())
    .bind(item.priority)
    .bind(to_json_list(&item.dependencies))
    .bind(to_json_list(&item.blocks))
    .bind(item.estimated_effort.as_str())
    .bind(item.retry_count)
    .bind(item.max_retries)
    .bind(&item.verification_plan)
    .bind(item.verification_status.as_str())
    .bind(&item.assigned_agent)
    .bind(item.context.to_json())
    .bind(item.created_at.to_rfc3339())
    .bind(item.updated_at.to_rfc3339())
}

#[async_trait]
impl crate::traits::WorkItemStore for SqliteStateStore {
    async fn create_work_item(&self, item: &WorkItem) -> anyhow::Result<()> {
        insert_work_item(item).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_work_items(&self, items: &[WorkItem]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            insert_work_item(item).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_work_item(&self, id: &str) -> anyhow::Result<Option<WorkItem>> {
        let row = sqlx::query("SELECT * FROM work_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_work_item).transpose()
    }

    async fn get_work_items_by_goal(&self, goal_id: &str) -> anyhow::Result<Vec<WorkItem>> {
        let rows = sqlx::query(
            "SELECT * FROM work_items WHERE goal_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_work_item).collect()
    }

    async fn update_work_item_status(
        &self,
        id: &str,
        status: WorkItemStatus,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE work_items SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_work_item(&self, item: &WorkItem) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE work_items
             SET status = ?, priority = ?, retry_count = ?, max_retries = ?,
                 verification_status = ?, assigned_agent = ?, blocks = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(item.status.as_str())
        .bind(item.priority)
        .bind(item.retry_count)
        .bind(item.max_retries)
        .bind(item.verification_status.as_str())
        .bind(&item.assigned_agent)
        .bind(to_json_list(&item.blocks))
        .bind(Utc::now().to_rfc3339())
        .bind(&item.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
