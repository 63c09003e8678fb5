use sqlx::SqlitePool;

pub(crate) async fn migrate_state(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS goals (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 50,
            success_criteria TEXT NOT NULL DEFAULT '[]',
            budget_tokens INTEGER,
            budget_time_minutes REAL,
            budget_cost_usd REAL,
            spent_tokens INTEGER NOT NULL DEFAULT 0,
            spent_time_minutes REAL NOT NULL DEFAULT 0,
            spent_cost_usd REAL NOT NULL DEFAULT 0,
            context TEXT NOT NULL DEFAULT '{\"kind\":\"adhoc\"}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_goals_status ON goals(status, priority)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS work_items (
            id TEXT PRIMARY KEY,
            goal_id TEXT NOT NULL REFERENCES goals(id),
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            item_type TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 50,
            dependencies TEXT NOT NULL DEFAULT '[]',
            blocks TEXT NOT NULL DEFAULT '[]',
            estimated_effort TEXT NOT NULL DEFAULT 'M',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            verification_plan TEXT,
            verification_status TEXT NOT NULL DEFAULT 'not_started',
            assigned_agent TEXT,
            context TEXT NOT NULL DEFAULT '{\"kind\":\"adhoc\"}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_items_goal ON work_items(goal_id, created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            work_item_id TEXT NOT NULL REFERENCES work_items(id),
            goal_id TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            run_sequence INTEGER NOT NULL,
            status TEXT NOT NULL,
            model TEXT,
            lane TEXT,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            time_seconds REAL NOT NULL DEFAULT 0,
            artifacts TEXT NOT NULL DEFAULT '[]',
            error_message TEXT,
            execution_log TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            UNIQUE(work_item_id, run_sequence)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cron_jobs (
            agent_id TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            schedule TEXT NOT NULL,
            definition_hash TEXT NOT NULL,
            next_run_at_ms INTEGER,
            last_run_at_ms INTEGER,
            claimed_by TEXT,
            claimed_at_ms INTEGER,
            claim_expires_at_ms INTEGER,
            in_flight_run_key TEXT,
            in_flight_goal_id TEXT,
            in_flight_started_at_ms INTEGER,
            failure_count INTEGER NOT NULL DEFAULT 0,
            backoff_until_ms INTEGER,
            last_error TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cron_jobs_due ON cron_jobs(enabled, next_run_at_ms)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cron_job_runs (
            run_key TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            scheduled_for_ms INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            goal_id TEXT,
            coalesced_count INTEGER NOT NULL DEFAULT 0,
            definition_hash TEXT NOT NULL,
            claimed_by TEXT NOT NULL,
            error TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            UNIQUE(agent_id, scheduled_for_ms)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS escalations (
            id TEXT PRIMARY KEY,
            work_item_id TEXT NOT NULL,
            goal_id TEXT NOT NULL,
            run_id TEXT,
            escalation_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            context_data TEXT NOT NULL DEFAULT '{\"kind\":\"none\"}',
            status TEXT NOT NULL,
            resolution_action TEXT,
            resolver TEXT,
            resolution_notes TEXT,
            created_at TEXT NOT NULL,
            acknowledged_at TEXT,
            resolved_at TEXT,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_escalations_goal ON escalations(goal_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_escalations_work_item ON escalations(work_item_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS decisions (
            id TEXT PRIMARY KEY,
            goal_id TEXT NOT NULL,
            work_item_id TEXT,
            run_id TEXT,
            decision_type TEXT NOT NULL,
            summary TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT 'null',
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_decisions_goal ON decisions(goal_id, created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
