//! HTTP client for the pilotd daemon.
//!
//! Talks to the daemon's local REST API and follows its log stream.

use pilot_core::{
    AgentStatus, Epic, EpicDetail, EpicId, EpicStatus, EpicSummary, EpicUpdate, LogEntry,
    LoopFilter, NewEpic, NewPlan, NewTask, Plan, PlanDetail, PlanId, PlanStatus, PlanUpdate, Task,
    TaskId, TaskStatus, TaskUpdate,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: pilotd\n  → or set PILOT_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent is busy with another task; try again when it finishes")]
    Busy,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check PILOT_TOKEN env var or --token flag")]
    Unauthorized,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Filters for `list_tasks`.
#[derive(Debug, Default)]
pub struct ListFilter<'a> {
    pub status: Option<TaskStatus>,
    pub label: Option<&'a str>,
    pub epic_id: Option<i64>,
    pub plan_id: Option<PlanId>,
    pub search: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task: Task,
}

#[derive(Debug, Deserialize)]
struct ListTasksResponse {
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct TaskLogsResponse {
    logs: Vec<LogEntry>,
}

/// Engine status as reported by the daemon.
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: AgentStatus,
    pub busy: bool,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    started: bool,
}

#[derive(Debug, Deserialize)]
pub struct OutputResponse {
    pub task_id: Option<TaskId>,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct RejectRequest<'a> {
    feedback: &'a str,
}

#[derive(Debug, Serialize)]
struct DecomposeRequest<'a> {
    goal: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    epic_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    plan: Plan,
}

#[derive(Debug, Deserialize)]
struct ListPlansResponse {
    plans: Vec<Plan>,
}

#[derive(Debug, Serialize)]
struct ReorderRequest<'a> {
    task_ids: &'a [TaskId],
}

#[derive(Debug, Deserialize)]
struct EpicResponse {
    epic: Epic,
}

#[derive(Debug, Deserialize)]
struct ListEpicsResponse {
    epics: Vec<EpicSummary>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP client for pilotd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            404 => ClientError::NotFound(message),
            409 if message.contains("busy") => ClientError::Busy,
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn expect_ok(&self, response: reqwest::Response) -> Result<(), ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// Check if daemon is healthy by calling /health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let response = self.http.get(self.url("/health")).send().await?;
        Ok(response.status().is_success())
    }

    // --- Tasks ---

    /// POST /api/tasks
    pub async fn create_task(&self, req: &NewTask) -> Result<Task, ClientError> {
        let response = self
            .http
            .post(self.url("/api/tasks"))
            .headers(self.headers())
            .json(req)
            .send()
            .await?;
        Ok(self.decode::<TaskResponse>(response).await?.task)
    }

    /// GET /api/tasks?status=...&label=...&epic_id=...&search=...
    pub async fn list_tasks(&self, filter: &ListFilter<'_>) -> Result<Vec<Task>, ClientError> {
        let url = format!("{}{}", self.url("/api/tasks"), list_query(filter));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(self.decode::<ListTasksResponse>(response).await?.tasks)
    }

    /// GET /api/tasks/{id}
    pub async fn get_task(&self, id: TaskId) -> Result<Task, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/tasks/{id}")))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<TaskResponse>(response).await?.task)
    }

    /// PATCH /api/tasks/{id}
    pub async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<Task, ClientError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/tasks/{id}")))
            .headers(self.headers())
            .json(update)
            .send()
            .await?;
        Ok(self.decode::<TaskResponse>(response).await?.task)
    }

    /// DELETE /api/tasks/{id}
    pub async fn delete_task(&self, id: TaskId) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/tasks/{id}")))
            .headers(self.headers())
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// POST /api/tasks/{id}/retry
    pub async fn retry_task(&self, id: TaskId) -> Result<Task, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/api/tasks/{id}/retry")))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<TaskResponse>(response).await?.task)
    }

    /// POST /api/tasks/{id}/run
    pub async fn run_task(&self, id: TaskId) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/api/tasks/{id}/run")))
            .headers(self.headers())
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// GET /api/tasks/{id}/logs
    pub async fn task_logs(&self, id: TaskId, limit: u32) -> Result<Vec<LogEntry>, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/tasks/{id}/logs?limit={limit}")))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<TaskLogsResponse>(response).await?.logs)
    }

    // --- Agent ---

    /// GET /api/agent/status
    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let response = self
            .http
            .get(self.url("/api/agent/status"))
            .headers(self.headers())
            .send()
            .await?;
        self.decode(response).await
    }

    /// POST /api/agent/start. Returns `false` if the loop was already running.
    pub async fn start(&self, filter: &LoopFilter) -> Result<bool, ClientError> {
        let response = self
            .http
            .post(self.url("/api/agent/start"))
            .headers(self.headers())
            .json(filter)
            .send()
            .await?;
        Ok(self.decode::<StartResponse>(response).await?.started)
    }

    /// POST /api/agent/stop
    pub async fn stop(&self) -> Result<StatusResponse, ClientError> {
        let response = self
            .http
            .post(self.url("/api/agent/stop"))
            .headers(self.headers())
            .send()
            .await?;
        self.decode(response).await
    }

    /// POST /api/agent/approve
    pub async fn approve(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/api/agent/approve"))
            .headers(self.headers())
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// POST /api/agent/reject
    pub async fn reject(&self, feedback: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/api/agent/reject"))
            .headers(self.headers())
            .json(&RejectRequest { feedback })
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// GET /api/agent/output
    pub async fn output(&self) -> Result<OutputResponse, ClientError> {
        let response = self
            .http
            .get(self.url("/api/agent/output"))
            .headers(self.headers())
            .send()
            .await?;
        self.decode(response).await
    }

    /// POST /api/decompose
    pub async fn decompose(
        &self,
        goal: &str,
        epic_id: Option<i64>,
    ) -> Result<Vec<Task>, ClientError> {
        let response = self
            .http
            .post(self.url("/api/decompose"))
            .headers(self.headers())
            .json(&DecomposeRequest { goal, epic_id })
            .send()
            .await?;
        Ok(self.decode::<ListTasksResponse>(response).await?.tasks)
    }

    // --- Plans ---

    /// POST /api/plans
    pub async fn create_plan(&self, req: &NewPlan) -> Result<Plan, ClientError> {
        let response = self
            .http
            .post(self.url("/api/plans"))
            .headers(self.headers())
            .json(req)
            .send()
            .await?;
        Ok(self.decode::<PlanResponse>(response).await?.plan)
    }

    /// GET /api/plans?status=...&epic_id=...
    pub async fn list_plans(
        &self,
        status: Option<PlanStatus>,
        epic_id: Option<EpicId>,
    ) -> Result<Vec<Plan>, ClientError> {
        let mut params = vec![];
        if let Some(status) = status {
            params.push(format!("status={}", status.as_str()));
        }
        if let Some(epic) = epic_id {
            params.push(format!("epic_id={epic}"));
        }
        let url = format!("{}{}", self.url("/api/plans"), query_string(&params));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(self.decode::<ListPlansResponse>(response).await?.plans)
    }

    /// GET /api/plans/{id}
    pub async fn get_plan(&self, id: PlanId) -> Result<PlanDetail, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/plans/{id}")))
            .headers(self.headers())
            .send()
            .await?;
        self.decode(response).await
    }

    /// PATCH /api/plans/{id}
    pub async fn update_plan(&self, id: PlanId, update: &PlanUpdate) -> Result<Plan, ClientError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/plans/{id}")))
            .headers(self.headers())
            .json(update)
            .send()
            .await?;
        Ok(self.decode::<PlanResponse>(response).await?.plan)
    }

    /// DELETE /api/plans/{id}
    pub async fn delete_plan(&self, id: PlanId) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/plans/{id}")))
            .headers(self.headers())
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// POST /api/plans/{id}/{action} for decompose, approve and stop.
    async fn plan_action(&self, id: PlanId, action: &str) -> Result<Plan, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/api/plans/{id}/{action}")))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<PlanResponse>(response).await?.plan)
    }

    pub async fn decompose_plan(&self, id: PlanId) -> Result<Plan, ClientError> {
        self.plan_action(id, "decompose").await
    }

    pub async fn approve_plan(&self, id: PlanId) -> Result<Plan, ClientError> {
        self.plan_action(id, "approve").await
    }

    pub async fn stop_plan(&self, id: PlanId) -> Result<Plan, ClientError> {
        self.plan_action(id, "stop").await
    }

    /// POST /api/plans/{id}/tasks/reorder
    pub async fn reorder_plan(
        &self,
        id: PlanId,
        task_ids: &[TaskId],
    ) -> Result<PlanDetail, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/api/plans/{id}/tasks/reorder")))
            .headers(self.headers())
            .json(&ReorderRequest { task_ids })
            .send()
            .await?;
        self.decode(response).await
    }

    // --- Epics ---

    /// POST /api/epics
    pub async fn create_epic(&self, req: &NewEpic) -> Result<Epic, ClientError> {
        let response = self
            .http
            .post(self.url("/api/epics"))
            .headers(self.headers())
            .json(req)
            .send()
            .await?;
        Ok(self.decode::<EpicResponse>(response).await?.epic)
    }

    /// GET /api/epics?status=...
    pub async fn list_epics(
        &self,
        status: Option<EpicStatus>,
    ) -> Result<Vec<EpicSummary>, ClientError> {
        let params: Vec<String> = status
            .map(|s| format!("status={}", s.as_str()))
            .into_iter()
            .collect();
        let url = format!("{}{}", self.url("/api/epics"), query_string(&params));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(self.decode::<ListEpicsResponse>(response).await?.epics)
    }

    /// GET /api/epics/{id}
    pub async fn get_epic(&self, id: EpicId) -> Result<EpicDetail, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/epics/{id}")))
            .headers(self.headers())
            .send()
            .await?;
        self.decode(response).await
    }

    /// PATCH /api/epics/{id}
    pub async fn update_epic(&self, id: EpicId, update: &EpicUpdate) -> Result<Epic, ClientError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/epics/{id}")))
            .headers(self.headers())
            .json(update)
            .send()
            .await?;
        Ok(self.decode::<EpicResponse>(response).await?.epic)
    }

    /// DELETE /api/epics/{id}
    pub async fn delete_epic(&self, id: EpicId) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/epics/{id}")))
            .headers(self.headers())
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// GET /api/agent/logs (SSE)
    ///
    /// Calls `on_entry` for every log entry from index `after`. With `follow`
    /// the stream stays open until the daemon closes it.
    pub async fn stream_logs<F>(
        &self,
        after: u64,
        follow: bool,
        mut on_entry: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&LogEntry),
    {
        use futures::StreamExt;

        let url = self.url(&format!("/api/agent/logs?after={after}&follow={follow}"));
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by a blank line.
            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();

                if let Some(entry) = parse_sse_log_event(&event_str) {
                    on_entry(&entry);
                }
            }
        }

        if let Some(entry) = parse_sse_log_event(&buffer) {
            on_entry(&entry);
        }

        Ok(())
    }
}

fn list_query(filter: &ListFilter<'_>) -> String {
    let mut params = vec![];
    if let Some(status) = filter.status {
        params.push(format!("status={}", status.as_str()));
    }
    if let Some(label) = filter.label {
        params.push(format!("label={}", urlencoding::encode(label)));
    }
    if let Some(epic) = filter.epic_id {
        params.push(format!("epic_id={epic}"));
    }
    if let Some(plan) = filter.plan_id {
        params.push(format!("plan_id={plan}"));
    }
    if let Some(search) = filter.search {
        params.push(format!("search={}", urlencoding::encode(search)));
    }
    query_string(&params)
}

fn query_string(params: &[String]) -> String {
    if params.is_empty() {
        String::new()
    } else {
        format!("?{}", params.join("&"))
    }
}

/// Parse an SSE event string into a log entry if it's a `log` event.
fn parse_sse_log_event(event_str: &str) -> Option<LogEntry> {
    let mut event_type = None;
    let mut data = None;

    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim());
        }
    }

    if event_type == Some("log") {
        if let Some(json_str) = data {
            return serde_json::from_str(json_str).ok();
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::LogLevel;

    #[test]
    fn parse_log_event_valid() {
        let event_str = r#"event: log
id: 3
data: {"index":3,"timestamp":"2026-01-01T00:00:00Z","level":"SYS","message":"Starting task #1: a","task_id":1}"#;

        let entry = parse_sse_log_event(event_str).unwrap();
        assert_eq!(entry.index, 3);
        assert_eq!(entry.level, LogLevel::Sys);
        assert_eq!(entry.message, "Starting task #1: a");
        assert_eq!(entry.task_id, Some(1));
    }

    #[test]
    fn parse_log_event_ignores_other_events() {
        assert!(parse_sse_log_event(":keepalive").is_none());
        assert!(parse_sse_log_event("event: status\ndata: {}").is_none());
        assert!(parse_sse_log_event("event: log").is_none());
        assert!(parse_sse_log_event("event: log\ndata: not json").is_none());
    }

    #[test]
    fn list_query_encodes_filters() {
        assert_eq!(list_query(&ListFilter::default()), "");

        let filter = ListFilter {
            status: Some(TaskStatus::WaitingApproval),
            label: Some("ui work"),
            epic_id: Some(2),
            plan_id: Some(5),
            search: None,
        };
        assert_eq!(
            list_query(&filter),
            "?status=waiting_approval&label=ui%20work&epic_id=2&plan_id=5"
        );
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:9000/", None);
        assert_eq!(client.base_url, "http://localhost:9000");
        assert_eq!(client.addr(), "http://localhost:9000");
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:9000", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");

        let client = Client::new("http://localhost:9000", None);
        assert!(client.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        assert!(client.check_health().await.is_err());
    }

    #[test]
    fn error_messages_point_at_configuration() {
        let err = ClientError::ConnectionFailed {
            addr: "http://127.0.0.1:9000".to_string(),
        };
        assert!(err.to_string().contains("PILOT_ADDR"));
        assert!(ClientError::Unauthorized.to_string().contains("PILOT_TOKEN"));
    }
}
