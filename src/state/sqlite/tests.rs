use super::*;
use crate::schedule::ScheduleSpec;
use crate::traits::store_prelude::*;
use crate::traits::{NewEscalation, NewGoal, NewWorkItem};
use crate::types::{
    DecisionType, EscalationType, ResolutionAction, RunStatus, Severity,
};

async fn setup_test_store() -> (SqliteStateStore, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let store = SqliteStateStore::new(db_file.path().to_str().unwrap(), 5)
        .await
        .unwrap();
    (store, db_file)
}

fn make_goal(title: &str) -> Goal {
    Goal::new(NewGoal {
        title: title.to_string(),
        description: format!("{} description", title),
        success_criteria: vec!["it works".into()],
        budget_tokens: Some(1_000),
        ..Default::default()
    })
}

fn cron_def(agent_id: &str, every_ms: i64) -> CronJobDefinition {
    CronJobDefinition {
        agent_id: agent_id.to_string(),
        enabled: true,
        schedule: ScheduleSpec::interval(every_ms).unwrap(),
        definition_hash: "hash-1".into(),
        reset_next_run_at_ms: None,
    }
}

fn claim<'a>(by: &'a str, now_ms: i64) -> ClaimRequest<'a> {
    ClaimRequest {
        now_ms,
        claim_ttl_ms: 60_000,
        claimed_by: by,
        limit: 16,
    }
}

#[tokio::test]
async fn goal_round_trip_and_terminal_stickiness() {
    let (store, _db) = setup_test_store().await;
    let goal = make_goal("ship it");
    store.create_goal(&goal).await.unwrap();

    let loaded = store.get_goal(&goal.id).await.unwrap().unwrap();
    assert_eq!(loaded.title, "ship it");
    assert_eq!(loaded.status, GoalStatus::Queued);
    assert_eq!(loaded.success_criteria, vec!["it works"]);
    assert_eq!(loaded.budget_tokens, Some(1_000));
    assert!(loaded.context.is_adhoc());

    assert!(store
        .transition_goal_status(&goal.id, &[GoalStatus::Queued], GoalStatus::Active)
        .await
        .unwrap());
    // Second claimer of the same transition loses.
    assert!(!store
        .transition_goal_status(&goal.id, &[GoalStatus::Queued], GoalStatus::Active)
        .await
        .unwrap());

    assert!(store
        .update_goal_status(&goal.id, GoalStatus::Completed)
        .await
        .unwrap());
    for next in [GoalStatus::Active, GoalStatus::Failed, GoalStatus::Cancelled] {
        assert!(!store.update_goal_status(&goal.id, next).await.unwrap());
    }
    let active = store.get_goals_by_status(GoalStatus::Completed).await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn usage_is_accumulated_in_place() {
    let (store, _db) = setup_test_store().await;
    let goal = make_goal("count");
    store.create_goal(&goal).await.unwrap();

    store.record_goal_usage(&goal.id, 100, 0.5, 0.01).await.unwrap();
    let updated = store
        .record_goal_usage(&goal.id, 250, 1.5, 0.02)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.spent_tokens, 350);
    assert!((updated.spent_time_minutes - 2.0).abs() < 1e-9);
    assert!((updated.spent_cost_usd - 0.03).abs() < 1e-9);

    assert!(store
        .record_goal_usage("missing", 1, 0.0, 0.0)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn work_items_and_run_sequence() {
    let (store, _db) = setup_test_store().await;
    let goal = make_goal("dag");
    store.create_goal(&goal).await.unwrap();

    let first = WorkItem::new(
        &goal.id,
        NewWorkItem {
            id: Some("first".into()),
            title: "first".into(),
            ..Default::default()
        },
    );
    let second = WorkItem::new(
        &goal.id,
        NewWorkItem {
            id: Some("second".into()),
            title: "second".into(),
            dependencies: vec!["first".into()],
            verification_plan: Some("cargo test".into()),
            ..Default::default()
        },
    );
    store
        .create_work_items(&[first.clone(), second.clone()])
        .await
        .unwrap();

    let items = store.get_work_items_by_goal(&goal.id).await.unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second"]);
    assert_eq!(items[1].status, WorkItemStatus::Blocked);
    assert_eq!(items[1].dependencies, vec!["first"]);
    assert_eq!(items[1].verification_plan.as_deref(), Some("cargo test"));

    assert!(store
        .update_work_item_status("first", WorkItemStatus::Done)
        .await
        .unwrap());
    let mut reloaded = store.get_work_item("second").await.unwrap().unwrap();
    reloaded.retry_count = 2;
    reloaded.status = WorkItemStatus::Ready;
    store.update_work_item(&reloaded).await.unwrap();
    let reloaded = store.get_work_item("second").await.unwrap().unwrap();
    assert_eq!(reloaded.retry_count, 2);
    assert_eq!(reloaded.status, WorkItemStatus::Ready);

    let new_run = NewRun {
        work_item_id: "second".into(),
        goal_id: goal.id.clone(),
        agent_type: "agent".into(),
        model: Some("small-model".into()),
        lane: Some("main".into()),
    };
    let r1 = store.create_run(&new_run).await.unwrap();
    let r2 = store.create_run(&new_run).await.unwrap();
    assert_eq!((r1.run_sequence, r2.run_sequence), (1, 2));
    assert_eq!(r1.status, RunStatus::Running);

    let done = store
        .complete_run(
            &r2.id,
            &RunCompletion {
                success: true,
                tokens_used: 42,
                artifacts: vec!["out.txt".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.completed_at.is_some());
    // A finished run is not completed twice.
    assert!(store
        .complete_run(&r2.id, &RunCompletion::default())
        .await
        .unwrap()
        .is_none());

    let latest = store.get_latest_run("second").await.unwrap().unwrap();
    assert_eq!(latest.id, r2.id);
    assert_eq!(latest.artifacts, vec!["out.txt"]);
    assert_eq!(store.get_runs_by_work_item("second").await.unwrap().len(), 2);
}

#[tokio::test]
async fn claim_is_exclusive_across_store_instances() {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let path = db_file.path().to_str().unwrap().to_string();
    let a = SqliteStateStore::new(&path, 5).await.unwrap();
    let b = SqliteStateStore::new(&path, 5).await.unwrap();

    for i in 0..8 {
        a.upsert_cron_job(&cron_def(&format!("agent-{i}"), 60_000), 0)
            .await
            .unwrap();
    }

    let (ra, rb) = tokio::join!(
        a.claim_due_cron_jobs(claim("instance-a", 1_000)),
        b.claim_due_cron_jobs(claim("instance-b", 1_000)),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.len() + rb.len(), 8);
    for job in &ra {
        assert!(!rb.iter().any(|j| j.agent_id == job.agent_id));
        assert_eq!(job.claimed_by.as_deref(), Some("instance-a"));
        assert_eq!(job.claim_expires_at_ms, Some(61_000));
    }

    // Nothing left to claim until the leases expire.
    assert!(a.claim_due_cron_jobs(claim("instance-c", 2_000)).await.unwrap().is_empty());
    assert!(a.claim_due_cron_jobs(claim("instance-c", 61_000)).await.unwrap().is_empty());
    assert_eq!(
        a.claim_due_cron_jobs(claim("instance-c", 61_001)).await.unwrap().len(),
        8
    );
}

#[tokio::test]
async fn claim_respects_due_time_backoff_and_enabled() {
    let (store, _db) = setup_test_store().await;
    store.upsert_cron_job(&cron_def("later", 60_000), 0).await.unwrap();
    store.upsert_cron_job(&cron_def("backoff", 60_000), 0).await.unwrap();
    store.upsert_cron_job(&cron_def("off", 60_000), 0).await.unwrap();
    store.upsert_cron_job(&cron_def("fresh", 60_000), 0).await.unwrap();

    let mut later = cron_def("later", 60_000);
    later.reset_next_run_at_ms = Some(Some(10_000));
    store.upsert_cron_job(&later, 0).await.unwrap();
    assert!(store.set_cron_job_enabled("off", false, 0).await.unwrap());
    assert!(!store.set_cron_job_enabled("off", false, 0).await.unwrap());

    let claimed = store.claim_due_cron_jobs(claim("me", 1_000)).await.unwrap();
    assert!(claimed.iter().any(|j| j.agent_id == "backoff"));
    let failed = CronJobOutcome::Failed {
        error: "boom".into(),
        backoff_until_ms: 5_000,
    };
    assert!(store
        .update_cron_job_after_outcome("backoff", "me", &failed, 1_000)
        .await
        .unwrap());
    for job in claimed.iter().filter(|j| j.agent_id != "backoff") {
        store.release_cron_job_claim(&job.agent_id, "me", 1_000).await.unwrap();
    }

    let ids = |jobs: Vec<CronJob>| jobs.into_iter().map(|j| j.agent_id).collect::<Vec<_>>();
    assert_eq!(
        ids(store.claim_due_cron_jobs(claim("me", 2_000)).await.unwrap()),
        vec!["fresh"]
    );
    store.release_cron_job_claim("fresh", "me", 2_000).await.unwrap();

    let backoff = store.get_cron_job("backoff").await.unwrap().unwrap();
    assert_eq!(backoff.failure_count, 1);
    assert_eq!(backoff.last_error.as_deref(), Some("boom"));
    assert_eq!(backoff.next_run_at_ms, None);

    let mut due = ids(store.claim_due_cron_jobs(claim("me", 10_000)).await.unwrap());
    due.sort();
    assert_eq!(due, vec!["backoff", "fresh", "later"]);
}

#[tokio::test]
async fn outcome_requires_holding_the_claim() {
    let (store, _db) = setup_test_store().await;
    store.upsert_cron_job(&cron_def("a", 1_000), 0).await.unwrap();
    store.claim_due_cron_jobs(claim("holder", 100)).await.unwrap();

    assert!(store
        .mark_cron_job_in_flight("a", "holder", "a:100", "goal-1", 100)
        .await
        .unwrap());
    let job = store.get_cron_job("a").await.unwrap().unwrap();
    assert_eq!(job.in_flight_run_key.as_deref(), Some("a:100"));

    let dispatched = CronJobOutcome::Dispatched {
        scheduled_for_ms: 100,
        next_run_at_ms: 1_100,
    };
    assert!(!store
        .update_cron_job_after_outcome("a", "intruder", &dispatched, 200)
        .await
        .unwrap());
    assert!(!store.release_cron_job_claim("a", "intruder", 200).await.unwrap());
    assert!(store
        .update_cron_job_after_outcome("a", "holder", &dispatched, 200)
        .await
        .unwrap());

    let job = store.get_cron_job("a").await.unwrap().unwrap();
    assert_eq!(job.next_run_at_ms, Some(1_100));
    assert_eq!(job.last_run_at_ms, Some(100));
    assert!(job.claimed_by.is_none());
    assert!(job.in_flight_run_key.is_none());
    assert_eq!(job.failure_count, 0);
}

#[tokio::test]
async fn upsert_keeps_runtime_state_unless_reset() {
    let (store, _db) = setup_test_store().await;
    let mut def = cron_def("a", 1_000);
    def.reset_next_run_at_ms = Some(Some(5_000));
    store.upsert_cron_job(&def, 0).await.unwrap();

    let mut changed = cron_def("a", 2_000);
    changed.definition_hash = "hash-2".into();
    store.upsert_cron_job(&changed, 10).await.unwrap();
    let job = store.get_cron_job("a").await.unwrap().unwrap();
    assert_eq!(job.next_run_at_ms, Some(5_000));
    assert_eq!(job.definition_hash, "hash-2");
    assert_eq!(job.schedule, ScheduleSpec::interval(2_000).unwrap());
    assert_eq!(job.created_at_ms, 0);
    assert_eq!(job.updated_at_ms, 10);

    changed.reset_next_run_at_ms = Some(None);
    store.upsert_cron_job(&changed, 20).await.unwrap();
    assert_eq!(store.get_cron_job("a").await.unwrap().unwrap().next_run_at_ms, None);
    assert_eq!(store.list_cron_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn occurrence_rows_are_created_once() {
    let (store, _db) = setup_test_store().await;
    let new = NewCronJobRun {
        agent_id: "a".into(),
        scheduled_for_ms: 5_000,
        coalesced_count: 3,
        definition_hash: "h".into(),
        claimed_by: "one".into(),
        now_ms: 5_500,
    };
    let (run, created) = store.get_or_create_cron_job_run(&new).await.unwrap();
    assert!(created);
    assert_eq!(run.run_key, "a:5000");
    assert_eq!(run.status, CronJobRunStatus::Pending);

    assert!(store
        .update_cron_job_run(&run.run_key, CronJobRunStatus::Dispatched, Some("g-1"), None, 5_600)
        .await
        .unwrap());

    let again = NewCronJobRun {
        claimed_by: "two".into(),
        ..new
    };
    let (existing, created) = store.get_or_create_cron_job_run(&again).await.unwrap();
    assert!(!created);
    assert_eq!(existing.status, CronJobRunStatus::Dispatched);
    assert_eq!(existing.goal_id.as_deref(), Some("g-1"));
    assert_eq!(existing.claimed_by, "one");
    assert_eq!(existing.coalesced_count, 3);

    // A status update without a goal id keeps the recorded one.
    store
        .update_cron_job_run("a:5000", CronJobRunStatus::Failed, None, Some("late"), 5_700)
        .await
        .unwrap();
    let fetched = store.get_cron_job_run("a:5000").await.unwrap().unwrap();
    assert_eq!(fetched.goal_id.as_deref(), Some("g-1"));
    assert_eq!(fetched.error.as_deref(), Some("late"));
    assert_eq!(store.list_cron_job_runs("a", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn escalation_transition_is_conditional() {
    let (store, _db) = setup_test_store().await;
    let esc = Escalation::new(NewEscalation {
        work_item_id: "w".into(),
        goal_id: "g".into(),
        run_id: None,
        escalation_type: EscalationType::Credential,
        severity: Severity::High,
        title: "need token".into(),
        description: "GitHub token missing".into(),
        context_data: EscalationContext::Credential {
            required: vec!["GITHUB_TOKEN".into()],
        },
    });
    store.create_escalation(&esc).await.unwrap();

    let resolve = EscalationTransition {
        to: EscalationStatus::Resolved,
        resolution_action: Some(ResolutionAction::ProvideInput),
        resolver: Some("ops".into()),
        notes: Some("added".into()),
        at: Utc::now(),
    };
    let pending = [EscalationStatus::Open, EscalationStatus::Acknowledged];
    assert!(store.transition_escalation(&esc.id, &pending, &resolve).await.unwrap());
    assert!(!store.transition_escalation(&esc.id, &pending, &resolve).await.unwrap());

    let loaded = store.get_escalation(&esc.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, EscalationStatus::Resolved);
    assert_eq!(loaded.resolution_action, Some(ResolutionAction::ProvideInput));
    assert!(loaded.resolved_at.is_some());
    assert!(loaded.acknowledged_at.is_none());
    assert_eq!(loaded.context_data, esc.context_data);
    assert_eq!(store.get_escalations_by_goal("g").await.unwrap().len(), 1);
    assert_eq!(store.get_escalations_by_work_item("w").await.unwrap().len(), 1);
}

#[tokio::test]
async fn decisions_are_listed_per_goal() {
    let (store, _db) = setup_test_store().await;
    let d = Decision::new(
        "g",
        Some("w"),
        DecisionType::ModelSelection,
        "simple tier -> small-model",
        serde_json::json!({"model": "small-model", "score": 20}),
    );
    store.create_decision(&d).await.unwrap();
    let all = store.get_decisions_by_goal("g").await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].decision_type, DecisionType::ModelSelection);
    assert_eq!(all[0].data["score"], 20);
    assert!(store.get_decisions_by_goal("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn reopening_database_keeps_data() {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let path = db_file.path().to_str().unwrap().to_string();
    let goal = make_goal("persist");
    {
        let store = SqliteStateStore::new(&path, 1).await.unwrap();
        store.create_goal(&goal).await.unwrap();
        store.pool().close().await;
    }
    let store = SqliteStateStore::new(&path, 1).await.unwrap();
    assert!(store.get_goal(&goal.id).await.unwrap().is_some());
}
