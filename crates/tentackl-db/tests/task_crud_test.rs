//! Task and step CRUD + transition tests against a real PostgreSQL.

use serde_json::json;
use uuid::Uuid;

use tentackl_db::models::{FailurePolicy, Step, StepStatus, TaskStatus};
use tentackl_db::queries::{steps as step_db, tasks as task_db};
use tentackl_test_utils::{create_test_db, drop_test_db};

fn step_row(task_id: Uuid, id: &str, deps: &[&str], position: i32) -> Step {
    Step {
        task_id,
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        agent_type: "compose".to_string(),
        domain: None,
        inputs: json!({}),
        outputs: json!({}),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        status: StepStatus::Pending,
        parallel_group: None,
        failure_policy: FailurePolicy::AllOrNothing,
        checkpoint_required: false,
        checkpoint_config: None,
        fallback_config: None,
        is_critical: true,
        retry_count: 0,
        max_retries: 3,
        error_message: None,
        started_at: None,
        completed_at: None,
        execution_time_ms: None,
        position,
    }
}

#[tokio::test]
async fn insert_and_fetch_task_with_steps() {
    let (pool, db_name) = create_test_db().await;

    let new = task_db::NewTask::planning("summarize the news", "user_1", Some("org_1"));
    let task = task_db::insert_task(&pool, &new).await.unwrap();
    assert_eq!(task.status, TaskStatus::Planning);
    assert_eq!(task.version, 1);

    let mut tx = pool.begin().await.unwrap();
    step_db::insert_step_tx(&mut tx, &step_row(task.id, "step_1", &[], 0))
        .await
        .unwrap();
    step_db::insert_step_tx(&mut tx, &step_row(task.id, "step_2", &["step_1"], 1))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let fetched = task_db::get_task_with_steps(&pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.steps.len(), 2);
    assert_eq!(fetched.steps[0].id, "step_1");
    assert_eq!(fetched.steps[1].dependencies, vec!["step_1".to_string()]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn optimistic_transition_rejects_stale_status() {
    let (pool, db_name) = create_test_db().await;

    let task = task_db::insert_task(
        &pool,
        &task_db::NewTask::planning("g", "user_1", None),
    )
    .await
    .unwrap();

    let rows = task_db::transition_task_status(&pool, task.id, TaskStatus::Planning, TaskStatus::Ready)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Second writer expecting the old status loses.
    let rows = task_db::transition_task_status(&pool, task.id, TaskStatus::Planning, TaskStatus::Failed)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let current = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Ready);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_transition_stamps_completed_at() {
    let (pool, db_name) = create_test_db().await;

    let task = task_db::insert_task(
        &pool,
        &task_db::NewTask::planning("g", "user_1", None),
    )
    .await
    .unwrap();
    task_db::transition_task_status(&pool, task.id, TaskStatus::Planning, TaskStatus::Failed)
        .await
        .unwrap();

    let current = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert!(current.completed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn superseded_link_is_atomic_and_terminal() {
    let (pool, db_name) = create_test_db().await;

    let original = task_db::insert_task(
        &pool,
        &task_db::NewTask::planning("original", "user_1", None),
    )
    .await
    .unwrap();
    let replacement = task_db::insert_task(
        &pool,
        &task_db::NewTask::planning("replacement", "user_1", None),
    )
    .await
    .unwrap();

    let rows = task_db::set_superseded_by(&pool, original.id, replacement.id)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let current = task_db::get_task(&pool, original.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Superseded);
    assert_eq!(current.superseded_by, Some(replacement.id));

    // A second supersession attempt is a no-op: the task is terminal.
    let rows = task_db::set_superseded_by(&pool, original.id, replacement.id)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn step_retry_and_progress_counts() {
    let (pool, db_name) = create_test_db().await;

    let task = task_db::insert_task(
        &pool,
        &task_db::NewTask::planning("g", "user_1", None),
    )
    .await
    .unwrap();
    let mut tx = pool.begin().await.unwrap();
    step_db::insert_step_tx(&mut tx, &step_row(task.id, "step_1", &[], 0))
        .await
        .unwrap();
    step_db::insert_step_tx(&mut tx, &step_row(task.id, "step_2", &["step_1"], 1))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    step_db::mark_step_running(&pool, task.id, "step_1").await.unwrap();
    step_db::fail_step(&pool, task.id, "step_1", "fetch timeout", Some(12))
        .await
        .unwrap();
    step_db::reset_step_for_retry(&pool, task.id, "step_1", 1, "Retry 1/3: fetch timeout")
        .await
        .unwrap();

    let step = step_db::get_step(&pool, task.id, "step_1").await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.retry_count, 1);
    assert!(step.started_at.is_none());

    step_db::complete_step(&pool, task.id, "step_1", &json!({"out": 1}), Some(40))
        .await
        .unwrap();
    let progress = step_db::get_step_progress(&pool, task.id).await.unwrap();
    assert_eq!(progress.done, 1);
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.total, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stuck_planning_query_filters_by_age() {
    let (pool, db_name) = create_test_db().await;

    let task = task_db::insert_task(
        &pool,
        &task_db::NewTask::planning("g", "user_1", None),
    )
    .await
    .unwrap();

    // Fresh tasks are not stuck.
    let stuck = task_db::get_stuck_planning_tasks(&pool, 5).await.unwrap();
    assert!(stuck.is_empty());

    // Backdate the row past the timeout.
    sqlx::query("UPDATE tasks SET created_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();
    let stuck = task_db::get_stuck_planning_tasks(&pool, 5).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, task.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn metadata_merge_preserves_existing_keys() {
    let (pool, db_name) = create_test_db().await;

    let mut new = task_db::NewTask::planning("g", "user_1", None);
    new.metadata = json!({"a": 1});
    let task = task_db::insert_task(&pool, &new).await.unwrap();

    task_db::merge_metadata(&pool, task.id, &json!({"b": 2})).await.unwrap();
    let current = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.metadata["a"], json!(1));
    assert_eq!(current.metadata["b"], json!(2));

    pool.close().await;
    drop_test_db(&db_name).await;
}
