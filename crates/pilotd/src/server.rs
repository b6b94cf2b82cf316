//! HTTP control plane for pilotd.
//!
//! Local-only REST API over the task store and the agent engine, plus an SSE
//! stream of engine log entries. Bound to 127.0.0.1; an optional bearer token
//! guards every route except `/health`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{
    stream::{self, Stream},
    StreamExt,
};
use pilot_core::{
    AgentStatus, Epic, EpicDetail, EpicId, EpicStatus, EpicSummary, EpicUpdate, LogEntry,
    LoopFilter, NewEpic, NewPlan, NewTask, Plan, PlanDetail, PlanId, PlanStatus, PlanUpdate, Task,
    TaskId, TaskStatus, TaskUpdate,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::{Agent, AgentError};
use crate::storage::{Storage, StorageError, TaskFilter, TaskStore};

/// Poll interval for the log SSE stream.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of persisted log lines returned per task.
const DEFAULT_TASK_LOG_LIMIT: u32 = 200;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub agent: Arc<Agent>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/run", post(run_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/logs", get(task_logs))
        .route("/api/agent/status", get(agent_status))
        .route("/api/agent/start", post(start_agent))
        .route("/api/agent/stop", post(stop_agent))
        .route("/api/agent/approve", post(approve))
        .route("/api/agent/reject", post(reject))
        .route("/api/agent/logs", get(stream_logs))
        .route("/api/agent/output", get(agent_output))
        .route("/api/decompose", post(decompose))
        .route("/api/plans", get(list_plans).post(create_plan))
        .route(
            "/api/plans/{id}",
            get(get_plan).patch(update_plan).delete(delete_plan),
        )
        .route("/api/plans/{id}/decompose", post(decompose_plan))
        .route("/api/plans/{id}/approve", post(approve_plan))
        .route("/api/plans/{id}/stop", post(stop_plan))
        .route("/api/plans/{id}/tasks/reorder", post(reorder_plan_tasks))
        .route("/api/epics", get(list_epics).post(create_epic))
        .route(
            "/api/epics/{id}",
            get(get_epic).patch(update_epic).delete(delete_epic),
        )
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::TaskNotFound(_)
        | StorageError::PlanNotFound(_)
        | StorageError::EpicNotFound(_) => api_error(StatusCode::NOT_FOUND, err.to_string()),
        StorageError::NotInPlan { .. } => api_error(StatusCode::BAD_REQUEST, err.to_string()),
        other => {
            error!("storage error: {}", other);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn agent_error(err: AgentError) -> ApiError {
    match err {
        AgentError::Storage(err) => storage_error(err),
        AgentError::NotRunnable { .. } | AgentError::InvalidInput(_) => {
            api_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        AgentError::Decompose(_) => api_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        AgentError::PlanState { .. } => api_error(StatusCode::CONFLICT, err.to_string()),
        AgentError::Runner(_) => {
            warn!("agent run failed: {}", err);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Query params for GET /api/tasks.
#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub epic_id: Option<i64>,
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TaskLogsQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TaskLogsResponse {
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
pub struct RunTaskResponse {
    pub scheduled: bool,
    pub task_id: TaskId,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: AgentStatus,
    pub busy: bool,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub started: bool,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub feedback: String,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct OutputResponse {
    pub task_id: Option<TaskId>,
    pub output: String,
}

/// Query params for GET /api/agent/logs.
#[derive(Debug, Deserialize, Default)]
pub struct StreamLogsQuery {
    /// First log index to send.
    #[serde(default)]
    pub after: Option<u64>,
    /// Keep the stream open for new entries (default true).
    #[serde(default)]
    pub follow: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DecomposeRequest {
    pub goal: String,
    #[serde(default)]
    pub epic_id: Option<i64>,
}

/// Query params for GET /api/plans.
#[derive(Debug, Deserialize, Default)]
pub struct ListPlansQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub epic_id: Option<EpicId>,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan: Plan,
}

#[derive(Debug, Serialize)]
pub struct ListPlansResponse {
    pub plans: Vec<Plan>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub task_ids: Vec<TaskId>,
}

/// Query params for GET /api/epics.
#[derive(Debug, Deserialize, Default)]
pub struct ListEpicsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EpicResponse {
    pub epic: Epic,
}

#[derive(Debug, Serialize)]
pub struct ListEpicsResponse {
    pub epics: Vec<EpicSummary>,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/tasks
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<ListTasksResponse>> {
    check_auth(&state, &headers)?;

    let status = match query.status.as_deref() {
        Some(s) => Some(TaskStatus::parse(s).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown status: {s}"))
        })?),
        None => None,
    };
    let filter = TaskFilter {
        status,
        label: query.label,
        epic_id: query.epic_id,
        plan_id: query.plan_id,
        search: query.search.filter(|s| !s.is_empty()),
    };

    let tasks = state.storage.list_tasks(&filter).await.map_err(storage_error)?;
    Ok(Json(ListTasksResponse { tasks }))
}

/// POST /api/tasks
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<NewTask>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    req.title = req.title.trim().to_string();
    if req.title.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }

    let task = state.storage.create_task(&req).await.map_err(storage_error)?;
    info!(task_id = task.id, "created task: {}", task.title);
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

/// GET /api/tasks/{id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<TaskResponse>> {
    check_auth(&state, &headers)?;
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    Ok(Json(TaskResponse { task }))
}

/// PATCH /api/tasks/{id}
async fn update_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
    Json(update): Json<TaskUpdate>,
) -> ApiResult<Json<TaskResponse>> {
    check_auth(&state, &headers)?;

    if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(api_error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    let task = state
        .storage
        .update_task(id, &update)
        .await
        .map_err(storage_error)?;
    Ok(Json(TaskResponse { task }))
}

/// DELETE /api/tasks/{id}
async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
) -> ApiResult<StatusCode> {
    check_auth(&state, &headers)?;

    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if task.status == TaskStatus::InProgress {
        return Err(api_error(
            StatusCode::CONFLICT,
            "cannot delete a task that is in progress",
        ));
    }
    state.storage.delete_task(id).await.map_err(storage_error)?;
    info!(task_id = id, "deleted task");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/run - start one task in the background.
async fn run_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if !task.status.is_runnable() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("task {id} is {}; only pending or failed tasks can run", task.status.as_str()),
        ));
    }

    if !state.agent.schedule_task(id).await.map_err(agent_error)? {
        return Err(api_error(StatusCode::CONFLICT, "agent is busy"));
    }
    info!(task_id = id, "scheduled task");
    Ok((
        StatusCode::ACCEPTED,
        Json(RunTaskResponse {
            scheduled: true,
            task_id: id,
        }),
    ))
}

/// POST /api/tasks/{id}/retry
async fn retry_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<TaskResponse>> {
    check_auth(&state, &headers)?;

    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if matches!(task.status, TaskStatus::InProgress | TaskStatus::WaitingApproval) {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("task {id} is {}", task.status.as_str()),
        ));
    }
    let task = state.storage.retry_task(id).await.map_err(storage_error)?;
    Ok(Json(TaskResponse { task }))
}

/// GET /api/tasks/{id}/logs - persisted log lines for one task.
async fn task_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
    Query(query): Query<TaskLogsQuery>,
) -> ApiResult<Json<TaskLogsResponse>> {
    check_auth(&state, &headers)?;

    state.storage.get_task(id).await.map_err(storage_error)?;
    let logs = state
        .storage
        .get_task_logs(id, query.limit.unwrap_or(DEFAULT_TASK_LOG_LIMIT))
        .await
        .map_err(storage_error)?;
    Ok(Json(TaskLogsResponse { logs }))
}

/// GET /api/agent/status
async fn agent_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<StatusResponse>> {
    check_auth(&state, &headers)?;
    Ok(Json(StatusResponse {
        status: state.agent.status(),
        busy: state.agent.is_busy(),
    }))
}

/// POST /api/agent/start - body is an optional loop filter.
async fn start_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    filter: Option<Json<LoopFilter>>,
) -> ApiResult<Json<StartResponse>> {
    check_auth(&state, &headers)?;

    let filter = filter.map(|Json(f)| f).unwrap_or_default();
    let started = state.agent.start_loop(filter).await;
    Ok(Json(StartResponse { started }))
}

/// POST /api/agent/stop
async fn stop_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<StatusResponse>> {
    check_auth(&state, &headers)?;

    state.agent.stop_loop().await;
    Ok(Json(StatusResponse {
        status: state.agent.status(),
        busy: state.agent.is_busy(),
    }))
}

/// POST /api/agent/approve
async fn approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<DecisionResponse>> {
    check_auth(&state, &headers)?;

    if !state.agent.approve() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Agent not waiting for approval",
        ));
    }
    Ok(Json(DecisionResponse { ok: true }))
}

/// POST /api/agent/reject
async fn reject(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RejectRequest>,
) -> ApiResult<Json<DecisionResponse>> {
    check_auth(&state, &headers)?;

    if !state.agent.reject(req.feedback.trim()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Agent not waiting for approval",
        ));
    }
    Ok(Json(DecisionResponse { ok: true }))
}

/// GET /api/agent/output - live output of the running task.
async fn agent_output(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<OutputResponse>> {
    check_auth(&state, &headers)?;
    Ok(Json(OutputResponse {
        task_id: state.agent.status().current_task_id,
        output: state.agent.current_output(),
    }))
}

/// GET /api/agent/logs - engine log entries as Server-Sent Events.
///
/// Each event carries one `LogEntry` as JSON with its index as the SSE id,
/// so clients resume with `?after=<last id + 1>`.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamLogsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    check_auth(&state, &headers)?;

    let agent = Arc::clone(&state.agent);
    let after = query.after.unwrap_or(0);
    let follow = query.follow.unwrap_or(true);

    let stream = stream::unfold(
        (agent, after, false),
        move |(agent, next, sent_initial)| async move {
            if sent_initial {
                if !follow {
                    return None;
                }
                tokio::time::sleep(LOG_POLL_INTERVAL).await;
            }

            let entries = agent.logs(next);
            let next = entries.last().map_or(next, |e| e.index + 1);
            let events: Vec<_> = entries
                .iter()
                .map(|entry| {
                    let json = serde_json::to_string(entry).unwrap_or_default();
                    Ok(SseEvent::default()
                        .event("log")
                        .data(json)
                        .id(entry.index.to_string()))
                })
                .collect();

            Some((stream::iter(events), (agent, next, true)))
        },
    )
    .flatten();

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/decompose - break a goal into pending tasks.
async fn decompose(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DecomposeRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let tasks = state
        .agent
        .decompose(&req.goal, req.epic_id)
        .await
        .map_err(agent_error)?;
    info!(count = tasks.len(), "decomposed goal into tasks");
    Ok((StatusCode::CREATED, Json(ListTasksResponse { tasks })))
}

// --- Plans ---

/// 404 unless `epic_id` names an existing epic.
async fn require_epic(state: &AppState, epic_id: Option<EpicId>) -> ApiResult<()> {
    if let Some(id) = epic_id {
        state.storage.get_epic(id).await.map_err(storage_error)?;
    }
    Ok(())
}

async fn plan_detail(state: &AppState, id: PlanId) -> ApiResult<PlanDetail> {
    let plan = state.storage.get_plan(id).await.map_err(storage_error)?;
    let tasks = state.storage.plan_tasks(id).await.map_err(storage_error)?;
    Ok(PlanDetail { plan, tasks })
}

/// GET /api/plans
async fn list_plans(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListPlansQuery>,
) -> ApiResult<Json<ListPlansResponse>> {
    check_auth(&state, &headers)?;

    let status = match query.status.as_deref() {
        Some(s) => Some(PlanStatus::parse(s).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown status: {s}"))
        })?),
        None => None,
    };
    let plans = state
        .storage
        .list_plans(status, query.epic_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListPlansResponse { plans }))
}

/// POST /api/plans
async fn create_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<NewPlan>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    req.title = req.title.trim().to_string();
    if req.title.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    require_epic(&state, req.epic_id).await?;

    let plan = state.storage.create_plan(&req).await.map_err(storage_error)?;
    info!(plan_id = plan.id, "created plan: {}", plan.title);
    Ok((StatusCode::CREATED, Json(PlanResponse { plan })))
}

/// GET /api/plans/{id} - the plan with its tasks in execution order.
async fn get_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PlanId>,
) -> ApiResult<Json<PlanDetail>> {
    check_auth(&state, &headers)?;
    Ok(Json(plan_detail(&state, id).await?))
}

/// PATCH /api/plans/{id}
async fn update_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PlanId>,
    Json(update): Json<PlanUpdate>,
) -> ApiResult<Json<PlanResponse>> {
    check_auth(&state, &headers)?;

    if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(api_error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    require_epic(&state, update.epic_id).await?;
    let plan = state
        .storage
        .update_plan(id, &update)
        .await
        .map_err(storage_error)?;
    Ok(Json(PlanResponse { plan }))
}

/// DELETE /api/plans/{id}
async fn delete_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PlanId>,
) -> ApiResult<StatusCode> {
    check_auth(&state, &headers)?;

    let plan = state.storage.get_plan(id).await.map_err(storage_error)?;
    if plan.status.is_active() || plan.status == PlanStatus::Decomposing {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("cannot delete plan {id} while it is {}", plan.status.as_str()),
        ));
    }
    state.storage.delete_plan(id).await.map_err(storage_error)?;
    info!(plan_id = id, "deleted plan");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/plans/{id}/decompose - generate the plan's tasks in the background.
async fn decompose_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PlanId>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let plan = state
        .agent
        .start_plan_decompose(id)
        .await
        .map_err(agent_error)?;
    info!(plan_id = id, "decomposing plan");
    Ok((StatusCode::ACCEPTED, Json(PlanResponse { plan })))
}

/// POST /api/plans/{id}/approve - run the plan's tasks in order.
async fn approve_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PlanId>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let plan = state.agent.approve_plan(id).await.map_err(agent_error)?;
    info!(plan_id = id, "approved plan");
    Ok((StatusCode::ACCEPTED, Json(PlanResponse { plan })))
}

/// POST /api/plans/{id}/stop - stop after the current task.
async fn stop_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PlanId>,
) -> ApiResult<Json<PlanResponse>> {
    check_auth(&state, &headers)?;

    let plan = state.agent.stop_plan(id).await.map_err(agent_error)?;
    Ok(Json(PlanResponse { plan }))
}

/// POST /api/plans/{id}/tasks/reorder
async fn reorder_plan_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PlanId>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<Json<PlanDetail>> {
    check_auth(&state, &headers)?;

    state
        .storage
        .reorder_plan_tasks(id, &req.task_ids)
        .await
        .map_err(storage_error)?;
    Ok(Json(plan_detail(&state, id).await?))
}

// --- Epics ---

/// GET /api/epics - every epic with its task counts.
async fn list_epics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListEpicsQuery>,
) -> ApiResult<Json<ListEpicsResponse>> {
    check_auth(&state, &headers)?;

    let status = match query.status.as_deref() {
        Some(s) => Some(EpicStatus::parse(s).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown status: {s}"))
        })?),
        None => None,
    };
    let epics = state.storage.list_epics(status).await.map_err(storage_error)?;

    let mut summaries = Vec::with_capacity(epics.len());
    for epic in epics {
        let stats = state.storage.epic_stats(epic.id).await.map_err(storage_error)?;
        summaries.push(EpicSummary { epic, stats });
    }
    Ok(Json(ListEpicsResponse { epics: summaries }))
}

/// POST /api/epics
async fn create_epic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<NewEpic>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    req.title = req.title.trim().to_string();
    if req.title.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    let epic = state.storage.create_epic(&req).await.map_err(storage_error)?;
    info!(epic_id = epic.id, "created epic: {}", epic.title);
    Ok((StatusCode::CREATED, Json(EpicResponse { epic })))
}

/// GET /api/epics/{id} - the epic with its tasks, plans and counts.
async fn get_epic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<EpicId>,
) -> ApiResult<Json<EpicDetail>> {
    check_auth(&state, &headers)?;

    let epic = state.storage.get_epic(id).await.map_err(storage_error)?;
    let filter = TaskFilter {
        epic_id: Some(id),
        ..Default::default()
    };
    let tasks = state.storage.list_tasks(&filter).await.map_err(storage_error)?;
    let plans = state
        .storage
        .list_plans(None, Some(id))
        .await
        .map_err(storage_error)?;
    let stats = state.storage.epic_stats(id).await.map_err(storage_error)?;
    Ok(Json(EpicDetail {
        epic,
        tasks,
        plans,
        stats,
    }))
}

/// PATCH /api/epics/{id}
async fn update_epic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<EpicId>,
    Json(update): Json<EpicUpdate>,
) -> ApiResult<Json<EpicResponse>> {
    check_auth(&state, &headers)?;

    if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(api_error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    let epic = state
        .storage
        .update_epic(id, &update)
        .await
        .map_err(storage_error)?;
    Ok(Json(EpicResponse { epic }))
}

/// DELETE /api/epics/{id} - tasks and plans are kept, detached.
async fn delete_epic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<EpicId>,
) -> ApiResult<StatusCode> {
    check_auth(&state, &headers)?;

    state.storage.delete_epic(id).await.map_err(storage_error)?;
    info!(epic_id = id, "deleted epic");
    Ok(StatusCode::NO_CONTENT)
}
