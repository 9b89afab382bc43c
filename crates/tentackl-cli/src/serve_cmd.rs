//! HTTP adapter: exposes the runtime use-cases over axum.
//!
//! Observe endpoints stream server-sent events (`data: <json>` frames with
//! `: heartbeat` comment lines); the webhook endpoint feeds the external
//! event gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use tentackl_core::trigger::DeliveryOutcome;
use tentackl_core::{CoreError, TaskRuntime};
use tentackl_db::models::{SourceAuthType, TaskStatus};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::Cancelled(_) => StatusCode::CONFLICT,
            CoreError::CheckpointRequired { .. } => StatusCode::CONFLICT,
            CoreError::PlanningFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::UnrecoverableFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::DependencyUnavailable(_) => StatusCode::BAD_GATEWAY,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{err}"),
        }
    }
}

impl AppError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    user_id: String,
    #[serde(default)]
    organization_id: Option<String>,
    goal: String,
    #[serde(default)]
    steps: Option<Vec<tentackl_core::ports::StepDraft>>,
    #[serde(default)]
    constraints: Option<serde_json::Value>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    skip_validation: bool,
}

#[derive(Debug, Deserialize)]
struct UserRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    user_id: String,
    #[serde(default)]
    run_to_completion: bool,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    user_id: String,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default = "default_learn")]
    learn_preference: bool,
}

fn default_learn() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    user_id: String,
    reason: String,
    #[serde(default = "default_learn")]
    learn_preference: bool,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct ObserveQuery {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct RegisterSourceRequest {
    organization_id: String,
    name: String,
    auth_type: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(runtime: Arc<TaskRuntime>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{task_id}", get(get_task))
        .route("/tasks/{task_id}/start", post(start_task))
        .route("/tasks/{task_id}/execute", post(execute_task))
        .route("/tasks/{task_id}/pause", post(pause_task))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
        .route("/tasks/{task_id}/events", get(observe_task))
        .route("/tasks/{task_id}/inbox", get(task_inbox))
        .route("/tasks/{task_id}/checkpoints", get(task_checkpoints))
        .route(
            "/tasks/{task_id}/steps/{step_id}/approve",
            post(approve_checkpoint),
        )
        .route(
            "/tasks/{task_id}/steps/{step_id}/reject",
            post(reject_checkpoint),
        )
        .route(
            "/tasks/{task_id}/steps/{step_id}/replan/approve",
            post(approve_replan),
        )
        .route(
            "/tasks/{task_id}/steps/{step_id}/replan/reject",
            post(reject_replan),
        )
        .route("/checkpoints", get(pending_checkpoints))
        .route("/events/sources", post(register_source))
        .route("/events/webhook/{source_id}", post(receive_webhook))
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

/// Run the HTTP server until interrupted.
pub async fn run_serve(runtime: Arc<TaskRuntime>, bind: &str) -> Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let app = build_router(runtime);

    tracing::info!(addr = %addr, "tentackl server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "tentackl",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_task(
    State(runtime): State<Arc<TaskRuntime>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let task = match request.steps {
        Some(steps) => {
            runtime
                .create_task_with_steps(
                    &request.user_id,
                    request.organization_id.as_deref(),
                    &request.goal,
                    steps,
                    request.constraints,
                    request.metadata,
                )
                .await?
        }
        None => {
            runtime
                .create_task(
                    &request.user_id,
                    request.organization_id.as_deref(),
                    &request.goal,
                    request.constraints,
                    request.metadata,
                    request.skip_validation,
                )
                .await?
        }
    };
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(runtime): State<Arc<TaskRuntime>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let tasks = runtime
        .list_tasks(&query.user_id, status, query.limit)
        .await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = runtime.get_task(task_id).await?;
    Ok(Json(task))
}

async fn start_task(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<UserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let scheduled = runtime.start_task(task_id, &request.user_id).await?;
    Ok(Json(serde_json::json!({
        "status": "started",
        "task_id": task_id,
        "scheduled_steps": scheduled,
    })))
}

async fn execute_task(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let result = runtime
        .execute_task(task_id, &request.user_id, request.run_to_completion)
        .await?;
    Ok(Json(serde_json::json!({
        "task_id": result.task_id,
        "status": result.status,
        "steps_completed": result.steps_completed,
        "steps_total": result.steps_total,
        "checkpoint": result.checkpoint,
        "error": result.error,
    })))
}

async fn pause_task(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<UserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let task = runtime.pause_task(task_id, &request.user_id).await?;
    Ok(Json(task))
}

async fn cancel_task(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<UserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let task = runtime.cancel_task(task_id, &request.user_id).await?;
    Ok(Json(task))
}

/// SSE stream of execution events. Runtime-level heartbeats map to SSE
/// comment lines; everything else is a `data:` frame.
async fn observe_task(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<ObserveQuery>,
) -> Result<impl IntoResponse, AppError> {
    let stream = runtime.observe_execution(task_id, &query.user_id).await?;

    let sse_stream = stream.map(|value| {
        let is_heartbeat = value.get("type").and_then(|t| t.as_str()) == Some("heartbeat");
        if is_heartbeat {
            Ok::<Event, std::convert::Infallible>(Event::default().comment("heartbeat"))
        } else {
            Ok(Event::default().data(value.to_string()))
        }
    });

    Ok(Sse::new(sse_stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(30))
            .text("heartbeat"),
    ))
}

async fn task_inbox(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let page = runtime
        .inbox()
        .list_inbox(task_id, 50, 0)
        .await
        .map_err(|e| AppError::from(CoreError::Internal(e)))?;
    Ok(Json(serde_json::json!({
        "messages": page.messages,
        "total": page.total,
    })))
}

async fn task_checkpoints(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let checkpoints = runtime.list_pending_checkpoints_for_task(task_id).await?;
    Ok(Json(checkpoints))
}

async fn pending_checkpoints(
    State(runtime): State<Arc<TaskRuntime>>,
    Query(query): Query<ObserveQuery>,
) -> Result<impl IntoResponse, AppError> {
    let checkpoints = runtime.list_pending_checkpoints(&query.user_id).await?;
    Ok(Json(checkpoints))
}

async fn approve_checkpoint(
    State(runtime): State<Arc<TaskRuntime>>,
    Path((task_id, step_id)): Path<(Uuid, String)>,
    Json(request): Json<ResolveRequest>,
) -> Result<impl IntoResponse, AppError> {
    let checkpoint = runtime
        .approve_checkpoint(
            task_id,
            &step_id,
            &request.user_id,
            request.feedback.as_deref(),
            request.learn_preference,
        )
        .await?;
    Ok(Json(checkpoint))
}

async fn reject_checkpoint(
    State(runtime): State<Arc<TaskRuntime>>,
    Path((task_id, step_id)): Path<(Uuid, String)>,
    Json(request): Json<RejectRequest>,
) -> Result<impl IntoResponse, AppError> {
    let checkpoint = runtime
        .reject_checkpoint(
            task_id,
            &step_id,
            &request.user_id,
            &request.reason,
            request.learn_preference,
        )
        .await?;
    Ok(Json(checkpoint))
}

async fn approve_replan(
    State(runtime): State<Arc<TaskRuntime>>,
    Path((task_id, step_id)): Path<(Uuid, String)>,
    Json(request): Json<ResolveRequest>,
) -> Result<impl IntoResponse, AppError> {
    let result = runtime
        .approve_replan(task_id, &step_id, &request.user_id, request.feedback.as_deref())
        .await?;
    let payload = match result {
        tentackl_core::orchestrator::CycleResult::ReplanComplete {
            new_task_id,
            new_version,
        } => serde_json::json!({
            "status": "replan_complete",
            "original_task_id": task_id,
            "new_task_id": new_task_id,
            "new_task_version": new_version,
        }),
        other => serde_json::json!({"status": other.tag(), "task_id": task_id}),
    };
    Ok(Json(payload))
}

async fn reject_replan(
    State(runtime): State<Arc<TaskRuntime>>,
    Path((task_id, step_id)): Path<(Uuid, String)>,
    Json(request): Json<RejectRequest>,
) -> Result<impl IntoResponse, AppError> {
    runtime
        .reject_replan(task_id, &step_id, &request.user_id, &request.reason)
        .await?;
    Ok(Json(serde_json::json!({
        "status": "replan_rejected",
        "task_id": task_id,
        "reason": request.reason,
    })))
}

async fn register_source(
    State(runtime): State<Arc<TaskRuntime>>,
    Json(request): Json<RegisterSourceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let auth_type = request
        .auth_type
        .parse::<SourceAuthType>()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let source = runtime
        .gateway()
        .register_source(
            &request.organization_id,
            &request.name,
            auth_type,
            &request.secret,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(source)))
}

/// Receive an external webhook delivery: authenticate, deduplicate, prefix,
/// and route to matching triggers.
async fn receive_webhook(
    State(runtime): State<Arc<TaskRuntime>>,
    Path(source_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let credential = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_owned)
        });
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let source = runtime
        .gateway()
        .authenticate_source(
            source_id,
            credential.as_deref(),
            signature.as_deref(),
            &body,
        )
        .await?;

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid webhook body: {e}")))?;

    let (outcome, event) = runtime
        .gateway()
        .validate_event(
            &source,
            &envelope.event_type,
            &body,
            envelope.data,
            idempotency_key.as_deref(),
        )
        .await?;

    if outcome == DeliveryOutcome::Duplicate {
        return Ok(Json(serde_json::json!({
            "status": "duplicate",
            "event_type": event.event_type,
            "cloned_tasks": [],
        })));
    }

    let cloned = runtime.process_external_event(&event, &source.name).await?;
    Ok(Json(serde_json::json!({
        "status": "accepted",
        "event_type": event.event_type,
        "cloned_tasks": cloned,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use tentackl_core::{RuntimeConfig, RuntimePorts};
    use tentackl_test_utils::{create_test_db, drop_test_db};

    use crate::adapters;

    async fn test_router() -> (Router, sqlx::PgPool, String) {
        let (pool, db_name) = create_test_db().await;
        let ports = RuntimePorts {
            intent_detector: Arc::new(adapters::PassiveIntentDetector),
            fast_path: Arc::new(adapters::DisabledFastPath),
            planner: Arc::new(adapters::UnconfiguredPlanner),
            plugin: Arc::new(adapters::LocalPluginExecutor),
            advisor: None,
            memory: None,
        };
        let runtime = TaskRuntime::new(
            pool.clone(),
            ports,
            RuntimeConfig {
                max_workers: 1,
                auto_start: false,
            },
        );
        (build_router(runtime), pool, db_name)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .expect("failed to read body");
        serde_json::from_slice(&bytes).expect("body should be JSON")
    }

    #[tokio::test]
    async fn index_reports_service() {
        let (app, pool, db_name) = test_router().await;

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["service"], "tentackl");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn create_and_fetch_task_with_steps() {
        let (app, pool, db_name) = test_router().await;

        let payload = serde_json::json!({
            "user_id": "user_1",
            "organization_id": "org_1",
            "goal": "transform some data",
            "steps": [
                {"id": "step_1", "name": "transform it", "agent_type": "transform",
                 "inputs": {"value": 42}}
            ],
        });
        let response = app
            .clone()
            .oneshot(
                Request::post("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "ready");
        let task_id = created["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/tasks/{task_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = body_json(response).await;
        assert_eq!(fetched["steps"][0]["agent_type"], "transform");

        let response = app
            .oneshot(
                Request::get("/tasks?user_id=user_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let (app, pool, db_name) = test_router().await;

        let response = app
            .oneshot(
                Request::get(format!("/tasks/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
