//! Task executor and agent loop.
//!
//! [`Agent`] owns everything one execution needs: the runner, the approval
//! gate, the execution lock, the log sink and the optional git workflow. All
//! mutable engine state sits behind accessors so status reads never wait on
//! a running task.
//!
//! Entry points:
//! - [`Agent::start_loop`] / [`Agent::stop_loop`]: background loop that drains
//!   the pending queue.
//! - [`Agent::run_task`]: run one task and wait for it.
//! - [`Agent::schedule_task`]: run one task in the background, or report busy.
//! - [`Agent::approve`] / [`Agent::reject`]: resolve a waiting task.
//! - [`Agent::start_plan_decompose`], [`Agent::approve_plan`] and
//!   [`Agent::stop_plan`]: drive a plan through its lifecycle.

use crate::gate::ApprovalGate;
use crate::git::{pr_number, unseen_comments, GitError, GitWorkflow};
use crate::lock::ExecutionLock;
use crate::logs::LogSink;
use crate::runner::{RunOutput, Runner, RunnerConfig, RunnerError};
use crate::sleep_cancellable;
use crate::storage::{StorageError, TaskResult, TaskStore};
use pilot_core::events::{tail_chars, truncate_message, LOG_MESSAGE_LIMIT};
use pilot_core::extract::{extract_as, JsonShape};
use pilot_core::prompt::{
    build_task_prompt, decompose_prompt, review_followup_prompt, ProjectContext,
};
use pilot_core::{
    AgentState, AgentStatus, ApprovalDecision, Config, EpicId, LogEntry, LogLevel, LoopFilter,
    NewTask, Plan, PlanId, PlanStatus, RetryPolicy, Task, TaskId, TaskPriority, TaskStatus,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Characters of agent output stored on a task awaiting approval.
const STORED_OUTPUT_CHARS: usize = 5000;

/// Characters of agent output stored as the error of a failed task.
const STORED_ERROR_CHARS: usize = 2000;

/// Characters of live output kept for `current_output`.
const CURRENT_OUTPUT_CHARS: usize = 50_000;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("task {id} is {status:?}; only pending or failed tasks can run")]
    NotRunnable { id: TaskId, status: TaskStatus },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("decompose failed: {0}")]
    Decompose(String),
    #[error("cannot {action} plan {id} while it is {}", .status.as_str())]
    PlanState {
        id: PlanId,
        status: PlanStatus,
        action: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Default)]
struct EngineState {
    state: AgentState,
    current_task_id: Option<TaskId>,
    current_task_title: Option<String>,
    tasks_completed: u32,
    tasks_failed: u32,
}

/// One item of a decomposition plan as returned by the agent.
#[derive(Debug, Deserialize)]
struct PlannedTask {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<serde_json::Value>,
    #[serde(default)]
    labels: Vec<String>,
}

impl PlannedTask {
    fn priority(&self) -> TaskPriority {
        match &self.priority {
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .and_then(|p| TaskPriority::try_from(p).ok())
                .unwrap_or_default(),
            Some(serde_json::Value::String(s)) => TaskPriority::parse(s).unwrap_or_default(),
            _ => TaskPriority::default(),
        }
    }
}

/// The execution engine.
#[derive(Debug)]
pub struct Agent {
    config: Config,
    store: Arc<dyn TaskStore>,
    runner: Runner,
    retry: RetryPolicy,
    git: Option<GitWorkflow>,
    logs: Arc<LogSink>,
    gate: ApprovalGate,
    lock: ExecutionLock,
    state: Mutex<EngineState>,
    output: Mutex<String>,
    cancel: Mutex<CancellationToken>,
    loop_running: AtomicBool,
    loop_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: Config, store: Arc<dyn TaskStore>, logs: Arc<LogSink>) -> Self {
        let git = config
            .git
            .enabled
            .then(|| GitWorkflow::new(config.target_project.clone(), config.git.clone()));
        Self {
            runner: Runner::new(RunnerConfig::from_config(&config)),
            retry: RetryPolicy::from_config(&config),
            git,
            config,
            store,
            logs,
            gate: ApprovalGate::new(),
            lock: ExecutionLock::new(),
            state: Mutex::new(EngineState::default()),
            output: Mutex::new(String::new()),
            cancel: Mutex::new(CancellationToken::new()),
            loop_running: AtomicBool::new(false),
            loop_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the retry policy derived from the config.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // --- Queries ---

    pub fn status(&self) -> AgentStatus {
        let state = self.engine();
        AgentStatus {
            state: state.state,
            current_task_id: state.current_task_id,
            current_task_title: state.current_task_title.clone(),
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
            loop_running: self.loop_running.load(Ordering::SeqCst),
        }
    }

    pub fn logs(&self, after: u64) -> Vec<LogEntry> {
        self.logs.after(after)
    }

    /// Live output of the task currently executing.
    pub fn current_output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }

    // --- Approval ---

    /// Approve the waiting task. `false` when nothing is waiting.
    pub fn approve(&self) -> bool {
        self.decide(ApprovalDecision::Approved)
    }

    /// Reject the waiting task. `false` when nothing is waiting.
    pub fn reject(&self, feedback: &str) -> bool {
        self.decide(ApprovalDecision::Rejected {
            feedback: feedback.to_string(),
        })
    }

    fn decide(&self, decision: ApprovalDecision) -> bool {
        if self.engine().state != AgentState::WaitingApproval {
            return false;
        }
        self.gate.decide(decision)
    }

    // --- Loop control ---

    /// Start the background loop. Returns `false` if it is already running.
    pub async fn start_loop(self: &Arc<Self>, filter: LoopFilter) -> bool {
        let mut handle = self.loop_handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let token = self.cancel_token();
        self.loop_running.store(true, Ordering::SeqCst);
        {
            let mut state = self.engine();
            if state.current_task_id.is_none() {
                state.state = AgentState::Idle;
            }
        }

        let mut scope = String::new();
        if let Some(min) = filter.min_priority {
            scope.push_str(&format!(" (min priority: {})", min.as_str()));
        }
        if let Some(epic) = filter.epic_id {
            scope.push_str(&format!(" (epic: #{epic})"));
        }
        self.logs.sys(format!("Agent loop started{scope}"), None);

        let agent = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            agent.run_loop(filter, token).await;
        }));
        true
    }

    /// Stop the loop and any running execution, then reset active tasks to
    /// pending.
    pub async fn stop_loop(&self) {
        self.cancel_token().cancel();
        self.gate.release();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "agent loop task ended abnormally");
            }
        }

        // Waits for a scheduled execution to unwind.
        let guard = self.lock.acquire().await;
        match self.store.reset_stuck_tasks().await {
            Ok(0) => {}
            Ok(n) => {
                self.logs.sys(format!("Reset {n} active task(s) to pending"), None);
            }
            Err(err) => {
                self.logs.error(format!("Failed to reset active tasks: {err}"), None);
            }
        }
        match self.store.reset_stuck_plans().await {
            Ok(0) => {}
            Ok(n) => {
                self.logs.sys(format!("Marked {n} active plan(s) as interrupted"), None);
            }
            Err(err) => {
                self.logs.error(format!("Failed to reset active plans: {err}"), None);
            }
        }
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        self.loop_running.store(false, Ordering::SeqCst);
        {
            let mut state = self.engine();
            state.state = AgentState::Stopped;
            state.current_task_id = None;
            state.current_task_title = None;
        }
        drop(guard);

        self.logs.sys("Agent loop stopped", None);
    }

    async fn run_loop(&self, filter: LoopFilter, cancel: CancellationToken) {
        let poll = Duration::from_secs(self.config.poll_interval_sec.max(1));

        while !cancel.is_cancelled() {
            match self.store.pick_next_pending(&filter).await {
                Ok(Some(task)) => {
                    let guard = tokio::select! {
                        guard = self.lock.acquire() => guard,
                        () = cancel.cancelled() => break,
                    };
                    self.execute_task(task.id, &cancel).await;
                    drop(guard);
                }
                Ok(None) => {
                    if !sleep_cancellable(poll, &cancel).await {
                        break;
                    }
                }
                Err(err) => {
                    self.logs.error(format!("Failed to pick next task: {err}"), None);
                    if !sleep_cancellable(poll, &cancel).await {
                        break;
                    }
                }
            }
        }

        self.loop_running.store(false, Ordering::SeqCst);
    }

    // --- Single-task entry points ---

    /// Run one task and wait for it to finish (including approval).
    pub async fn run_task(&self, id: TaskId) -> Result<Task> {
        let task = self.store.get_task(id).await?;
        if !task.status.is_runnable() {
            return Err(AgentError::NotRunnable {
                id,
                status: task.status,
            });
        }

        let guard = self.lock.acquire().await;
        let cancel = self.cancel_token();
        self.execute_task(id, &cancel).await;
        drop(guard);

        Ok(self.store.get_task(id).await?)
    }

    /// Start one task in the background. `Ok(false)` when another execution
    /// holds the lock or the task is not runnable.
    pub async fn schedule_task(self: &Arc<Self>, id: TaskId) -> Result<bool> {
        let task = self.store.get_task(id).await?;
        if !task.status.is_runnable() {
            return Ok(false);
        }
        let Some(guard) = self.lock.try_acquire() else {
            return Ok(false);
        };

        let agent = Arc::clone(self);
        let cancel = self.cancel_token();
        tokio::spawn(async move {
            let _guard = guard;
            agent.execute_task(id, &cancel).await;
        });
        Ok(true)
    }

    /// Ask the agent to break `goal` into tasks and queue them.
    pub async fn decompose(&self, goal: &str, epic_id: Option<EpicId>) -> Result<Vec<Task>> {
        if goal.trim().is_empty() {
            return Err(AgentError::InvalidInput("goal must not be empty".into()));
        }

        let guard = self.lock.acquire().await;
        let cancel = self.cancel_token();
        let goal = goal.trim();
        self.logs.sys(format!("Decomposing goal: {}", truncate_message(goal, 120)), None);
        let label = format!("Decomposing: {}", truncate_message(goal, 60));
        let planned = self.plan_goal(goal, &label, epic_id, &cancel).await;
        drop(guard);

        let mut created = Vec::new();
        for new in planned? {
            created.push(self.store.create_task(&new).await?);
        }
        self.logs.sys(format!("Created {} task(s) from goal", created.len()), None);
        Ok(created)
    }

    /// Run the agent on a decomposition prompt and parse the task list it
    /// prints. The caller holds the execution lock.
    async fn plan_goal(
        &self,
        goal: &str,
        label: &str,
        epic_id: Option<EpicId>,
        cancel: &CancellationToken,
    ) -> Result<Vec<NewTask>> {
        self.begin(None, label);
        let prompt = decompose_prompt(goal, &ProjectContext::load(&self.config));
        let output = self.run_agent(&prompt, None, cancel).await;
        self.settle();
        let output = output?;

        if output.exit_code != 0 {
            return Err(AgentError::Decompose(format!(
                "agent exited with code {}",
                output.exit_code
            )));
        }

        let planned: Vec<PlannedTask> = extract_as(&output.output, JsonShape::Array)
            .ok_or_else(|| AgentError::Decompose("no JSON task list in agent output".into()))?;

        Ok(planned
            .into_iter()
            .filter(|p| !p.title.trim().is_empty())
            .map(|item| NewTask {
                priority: item.priority(),
                title: item.title.trim().to_string(),
                description: item.description.trim().to_string(),
                labels: item.labels,
                epic_id,
            })
            .collect())
    }

    // --- Plans ---

    /// Mark a draft or reviewed plan as decomposing and generate its tasks
    /// in the background.
    pub async fn start_plan_decompose(self: &Arc<Self>, id: PlanId) -> Result<Plan> {
        let plan = self.store.get_plan(id).await?;
        if !plan.status.can_decompose() {
            return Err(AgentError::PlanState {
                id,
                status: plan.status,
                action: "decompose",
            });
        }
        if plan_goal_text(&plan).is_empty() {
            return Err(AgentError::InvalidInput("plan has no title or goal".into()));
        }

        self.store
            .set_plan_status(id, PlanStatus::Decomposing, Some(""))
            .await?;
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.decompose_plan(id).await;
        });
        Ok(self.store.get_plan(id).await?)
    }

    async fn decompose_plan(&self, id: PlanId) {
        match self.generate_plan_tasks(id).await {
            Ok(count) => {
                self.logs.sys(format!("Plan #{id}: {count} task(s) ready for review"), None);
                let reviewing = self.store.set_plan_status(id, PlanStatus::Reviewing, None);
                if let Err(err) = reviewing.await {
                    warn!(plan_id = id, error = %err, "failed to record plan review state");
                }
            }
            Err(err) => {
                let message = truncate_message(&err.to_string(), LOG_MESSAGE_LIMIT);
                self.logs.error(format!("Plan #{id} decompose failed: {message}"), None);
                if let Err(err) = self
                    .store
                    .set_plan_status(id, PlanStatus::Draft, Some(&message))
                    .await
                {
                    warn!(plan_id = id, error = %err, "failed to record plan failure");
                }
            }
        }
    }

    async fn generate_plan_tasks(&self, id: PlanId) -> Result<usize> {
        let plan = self.store.get_plan(id).await?;
        let goal = plan_goal_text(&plan);

        let guard = self.lock.acquire().await;
        let cancel = self.cancel_token();
        self.logs.sys(format!("Planning #{id}: {}", plan.title), None);
        let label = format!("Planning: {}", truncate_message(&plan.title, 60));
        let planned = self.plan_goal(&goal, &label, plan.epic_id, &cancel).await;
        drop(guard);

        let tasks = self.store.replace_plan_tasks(id, &planned?).await?;
        Ok(tasks.len())
    }

    /// Approve a reviewed plan, or resume a failed one, and run its tasks in
    /// order in the background.
    pub async fn approve_plan(self: &Arc<Self>, id: PlanId) -> Result<Plan> {
        let plan = self.store.get_plan(id).await?;
        if !plan.status.can_approve() {
            return Err(AgentError::PlanState {
                id,
                status: plan.status,
                action: "approve",
            });
        }
        if self.store.plan_tasks(id).await?.is_empty() {
            return Err(AgentError::InvalidInput("plan has no tasks".into()));
        }

        self.store
            .set_plan_status(id, PlanStatus::Approved, Some(""))
            .await?;
        self.logs.sys(format!("Plan #{id} approved"), None);

        let agent = Arc::clone(self);
        let cancel = self.cancel_token();
        tokio::spawn(async move {
            agent.run_plan(id, &cancel).await;
        });
        Ok(self.store.get_plan(id).await?)
    }

    /// Stop a plan once its current task finishes.
    pub async fn stop_plan(&self, id: PlanId) -> Result<Plan> {
        let plan = self.store.get_plan(id).await?;
        if !plan.status.is_active() {
            return Err(AgentError::PlanState {
                id,
                status: plan.status,
                action: "stop",
            });
        }

        self.store
            .set_plan_status(id, PlanStatus::Failed, Some("Stopped by user"))
            .await?;
        self.logs.sys(format!("Plan #{id} stopped"), None);
        Ok(self.store.get_plan(id).await?)
    }

    async fn run_plan(&self, id: PlanId, cancel: &CancellationToken) {
        if let Err(err) = self.run_plan_tasks(id, cancel).await {
            let message = truncate_message(&err.to_string(), LOG_MESSAGE_LIMIT);
            self.logs.error(format!("Plan #{id} crashed: {message}"), None);
            if !cancel.is_cancelled() {
                if let Err(err) = self
                    .store
                    .set_plan_status(id, PlanStatus::Failed, Some(&message))
                    .await
                {
                    warn!(plan_id = id, error = %err, "failed to record plan failure");
                }
            }
        }
    }

    /// Execute plan tasks in order until all are done, one fails, or the
    /// plan leaves the running state.
    async fn run_plan_tasks(&self, id: PlanId, cancel: &CancellationToken) -> Result<()> {
        // Stopped before it got going.
        if self.store.get_plan(id).await?.status != PlanStatus::Approved {
            return Ok(());
        }
        self.store.set_plan_status(id, PlanStatus::Running, None).await?;
        self.logs.sys(format!("Plan #{id} running"), None);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.store.get_plan(id).await?.status != PlanStatus::Running {
                return Ok(());
            }

            let tasks = self.store.plan_tasks(id).await?;
            let Some(next) = tasks.into_iter().find(|t| t.status != TaskStatus::Done) else {
                self.store
                    .set_plan_status(id, PlanStatus::Completed, Some(""))
                    .await?;
                self.logs.sys(format!("Plan #{id} completed"), None);
                return Ok(());
            };

            let guard = tokio::select! {
                guard = self.lock.acquire() => guard,
                () = cancel.cancelled() => return Ok(()),
            };
            self.execute_task(next.id, cancel).await;
            drop(guard);
            if cancel.is_cancelled() {
                return Ok(());
            }

            let task = match self.store.get_task(next.id).await {
                Ok(task) => task,
                Err(StorageError::TaskNotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            // Pending again means rejected with feedback: run it once more.
            let message = match task.status {
                TaskStatus::Done | TaskStatus::Pending => continue,
                TaskStatus::Failed => format!("Task #{} failed", task.id),
                other => format!("Task #{} left {}", task.id, other.as_str()),
            };
            self.logs.error(format!("Plan #{id} failed: {message}"), None);
            self.store
                .set_plan_status(id, PlanStatus::Failed, Some(&message))
                .await?;
            return Ok(());
        }
    }

    // --- Execution ---

    /// Execute one task under the already-held execution lock.
    ///
    /// Never fails: unexpected errors are logged and recorded on the task.
    async fn execute_task(&self, id: TaskId, cancel: &CancellationToken) {
        if let Err(err) = self.execute_attempts(id, cancel).await {
            let message = truncate_message(&err.to_string(), LOG_MESSAGE_LIMIT);
            self.logs.error(format!("Task #{id} crashed: {message}"), Some(id));
            if !cancel.is_cancelled() {
                if let Err(err) = self.store.set_task_failed(id, &message, None, None).await {
                    warn!(task_id = id, error = %err, "failed to record task failure");
                }
                self.engine().tasks_failed += 1;
            }
        }

        self.settle();
    }

    async fn execute_attempts(&self, id: TaskId, cancel: &CancellationToken) -> Result<()> {
        let mut first_attempt = true;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let task = match self.store.get_task(id).await {
                Ok(task) => task,
                Err(StorageError::TaskNotFound(_)) => {
                    self.logs.sys(format!("Task #{id} no longer exists; skipping"), None);
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            if first_attempt && !task.status.is_runnable() {
                self.logs.sys(
                    format!("Task #{id} is {}; skipping", task.status.as_str()),
                    Some(id),
                );
                return Ok(());
            }
            first_attempt = false;

            self.begin(Some(task.id), &task.title);
            self.store.set_task_started(id).await?;
            self.logs.sys(format!("Starting task #{id}: {}", task.title), Some(id));

            let branch = match &self.git {
                Some(git) => match git.prepare_branch(&task).await {
                    Ok(branch) => {
                        self.store.set_task_git(id, Some(&branch), None).await?;
                        self.logs.sys(format!("Working on branch {branch}"), Some(id));
                        Some(branch)
                    }
                    Err(err) => {
                        let message = format!("Git branch setup failed: {err}");
                        self.logs.error(message.clone(), Some(id));
                        self.store.set_task_failed(id, &message, None, None).await?;
                        self.engine().tasks_failed += 1;
                        return Ok(());
                    }
                },
                None => None,
            };

            let context = ProjectContext::load(&self.config);
            for missing in &context.missing {
                self.logs.sys(
                    format!("Context file not found: {}", missing.display()),
                    Some(id),
                );
            }
            let prompt = build_task_prompt(&task, &context);

            self.logs.sys(
                format!("Running agent (cwd: {})", self.config.target_project.display()),
                Some(id),
            );
            match self.run_agent(&prompt, Some(id), cancel).await {
                Ok(output) if output.exit_code == 0 => {
                    return self.finish_success(&task, branch, output, cancel).await;
                }
                Ok(output) => {
                    self.discard_branch(branch.as_deref()).await;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    if self.retry.should_retry(task.retry_count) {
                        let attempt = self.store.increment_retry_count(id).await?;
                        let delay = self.retry.backoff(attempt);
                        self.logs.sys(
                            format!(
                                "Task #{id} failed (exit={}); retry {attempt}/{} in {}",
                                output.exit_code,
                                self.retry.max_retries,
                                pilot_core::retry::format_delay(delay)
                            ),
                            Some(id),
                        );
                        if !sleep_cancellable(delay, cancel).await {
                            return Ok(());
                        }
                        continue;
                    }

                    let tail = tail_chars(output.output.trim(), STORED_ERROR_CHARS);
                    let detail = if tail.is_empty() { "Process failed" } else { tail };
                    let error = if task.retry_count > 0 {
                        format!("{detail}\n(gave up after {} retries)", task.retry_count)
                    } else {
                        detail.to_string()
                    };
                    self.store
                        .set_task_failed(id, &error, Some(output.exit_code), output.cost_usd)
                        .await?;
                    self.logs.error(
                        format!("Task #{id} failed (exit={})", output.exit_code),
                        Some(id),
                    );
                    self.engine().tasks_failed += 1;
                    return Ok(());
                }
                Err(RunnerError::Cancelled) => {
                    self.discard_branch(branch.as_deref()).await;
                    self.logs.sys(format!("Task #{id} interrupted"), Some(id));
                    return Ok(());
                }
                Err(err) => {
                    self.discard_branch(branch.as_deref()).await;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    let cost = match &err {
                        RunnerError::Timeout { cost_usd, .. } => *cost_usd,
                        _ => None,
                    };
                    self.logs.error(format!("Task #{id} failed: {err}"), Some(id));
                    self.store
                        .set_task_failed(id, &err.to_string(), None, cost)
                        .await?;
                    self.engine().tasks_failed += 1;
                    return Ok(());
                }
            }
        }
    }

    async fn finish_success(
        &self,
        task: &Task,
        mut branch: Option<String>,
        output: RunOutput,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = task.id;
        let result = TaskResult {
            output: tail_chars(&output.output, STORED_OUTPUT_CHARS).to_string(),
            exit_code: output.exit_code,
            cost_usd: output.cost_usd,
        };

        let pr_url = match &branch {
            Some(branch) => self.publish(task, branch, output.cost_usd).await?,
            None => None,
        };
        if pr_url.is_none() && branch.is_some() {
            self.logs.sys("No pull request opened; returning to the base branch", Some(id));
            self.discard_branch(branch.as_deref()).await;
            self.store.set_task_git(id, None, None).await?;
            branch = None;
        }

        if self.config.auto_approve {
            let merged = self
                .review_and_merge(task, branch.as_deref(), pr_url.as_deref(), cancel)
                .await;
            if !merged {
                return Ok(());
            }
            self.store.set_task_done(id, Some(&result)).await?;
            self.engine().tasks_completed += 1;
            self.logs.sys(format!("Task #{id} completed (auto-approved)"), Some(id));
            return Ok(());
        }

        let pending = self.gate.arm();
        self.store.set_task_waiting(id, &result).await?;
        self.engine().state = AgentState::WaitingApproval;
        self.logs.sys(format!("Task #{id} waiting for approval"), Some(id));

        let decision = pending.wait(cancel).await;
        self.engine().state = AgentState::Running;

        match decision {
            Some(ApprovalDecision::Approved) => {
                self.logs.sys(format!("Task #{id} approved"), Some(id));
                let merged = self
                    .review_and_merge(task, branch.as_deref(), pr_url.as_deref(), cancel)
                    .await;
                if !merged {
                    return Ok(());
                }
                self.store.set_task_done(id, None).await?;
                self.engine().tasks_completed += 1;
            }
            Some(ApprovalDecision::Rejected { feedback }) => {
                self.logs.sys(format!("Task #{id} rejected: {feedback}"), Some(id));
                self.discard_branch(branch.as_deref()).await;
                self.store.set_task_rejected(id, &feedback).await?;
                self.engine().tasks_failed += 1;
            }
            None => {
                self.logs.sys(format!("Approval wait for task #{id} interrupted"), Some(id));
            }
        }
        Ok(())
    }

    /// Commit, push and open a PR. Git failures here are logged, not fatal.
    async fn publish(
        &self,
        task: &Task,
        branch: &str,
        cost_usd: Option<f64>,
    ) -> Result<Option<String>> {
        let Some(git) = &self.git else {
            return Ok(None);
        };
        let id = task.id;

        let stat = match git.commit_and_push(task, branch, None).await {
            Ok(Some(stat)) => stat,
            Ok(None) => {
                self.logs.sys("No changes to commit", Some(id));
                return Ok(None);
            }
            Err(err) => {
                self.logs.error(format!("Commit/push failed: {err}"), Some(id));
                return Ok(None);
            }
        };

        match git.create_pr(task, branch, &stat, cost_usd).await {
            Ok(url) => {
                self.store.set_task_git(id, Some(branch), Some(&url)).await?;
                self.logs.sys(format!("Opened PR: {url}"), Some(id));
                Ok(Some(url))
            }
            Err(err) => {
                self.logs.error(format!("PR creation failed: {err}"), Some(id));
                Ok(None)
            }
        }
    }

    /// Wait for review comments, address them, then merge. Only runs when
    /// auto-merge is on and a PR exists. Returns `false` if cancelled.
    async fn review_and_merge(
        &self,
        task: &Task,
        branch: Option<&str>,
        pr_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> bool {
        let (Some(git), Some(branch), Some(url)) = (&self.git, branch, pr_url) else {
            return true;
        };
        if !git.config().auto_merge {
            return true;
        }
        let id = task.id;
        let pr = match pr_number(url) {
            Ok(pr) => pr,
            Err(err) => {
                self.logs.error(err.to_string(), Some(id));
                return true;
            }
        };

        self.logs.sys(format!("Waiting for review on PR #{pr}"), Some(id));
        let mut comments = match git.wait_for_review(pr, cancel).await {
            Ok(comments) => comments,
            Err(GitError::Cancelled) => return false,
            Err(err) => {
                self.logs.error(format!("Review polling failed: {err}"), Some(id));
                Vec::new()
            }
        };
        let mut seen = comments.clone();

        let max_rounds = git.config().max_review_rounds;
        let mut round = 0;
        while !comments.is_empty() && round < max_rounds {
            round += 1;
            self.logs.sys(
                format!("Addressing {} review comment(s), round {round}", comments.len()),
                Some(id),
            );

            let prompt = review_followup_prompt(task, url, &comments);
            match self.run_agent(&prompt, Some(id), cancel).await {
                Ok(output) if output.exit_code == 0 => {}
                Ok(output) => {
                    self.logs.error(
                        format!("Review follow-up exited with code {}", output.exit_code),
                        Some(id),
                    );
                    break;
                }
                Err(RunnerError::Cancelled) => return false,
                Err(err) => {
                    self.logs.error(format!("Review follow-up failed: {err}"), Some(id));
                    break;
                }
            }

            let message = format!("task #{id}: address review comments");
            match git.commit_and_push(task, branch, Some(&message)).await {
                Ok(Some(_)) => {
                    self.logs.sys("Pushed review fixes", Some(id));
                }
                Ok(None) => {
                    self.logs.sys("Review follow-up made no changes", Some(id));
                }
                Err(err) => {
                    self.logs.error(format!("Pushing review fixes failed: {err}"), Some(id));
                    break;
                }
            }

            if round >= max_rounds {
                break;
            }
            let wait = Duration::from_secs(git.config().review_followup_wait_sec);
            if !sleep_cancellable(wait, cancel).await {
                return false;
            }
            match git.fetch_review_comments(pr).await {
                Ok(latest) if latest.len() > seen.len() => {
                    comments = unseen_comments(&seen, &latest);
                    seen = latest;
                }
                Ok(_) => break,
                Err(err) => {
                    self.logs.error(
                        format!("Re-fetching review comments failed: {err}"),
                        Some(id),
                    );
                    break;
                }
            }
        }

        match git.merge_pr(pr).await {
            Ok(()) => {
                self.logs.sys(format!("Merged PR #{pr}"), Some(id));
            }
            Err(err) => {
                self.logs.error(format!("Merge of PR #{pr} failed: {err}"), Some(id));
            }
        }
        true
    }

    async fn discard_branch(&self, branch: Option<&str>) {
        if let (Some(git), Some(branch)) = (&self.git, branch) {
            git.cleanup_branch(branch).await;
        }
    }

    /// Run the agent, streaming its events into the log sink and the live
    /// output buffer.
    async fn run_agent(
        &self,
        prompt: &str,
        id: Option<TaskId>,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunOutput, RunnerError> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let logs = &self.logs;
        let live = &self.output;
        let result = self
            .runner
            .run(prompt, &self.config.target_project, id, cancel, |event| {
                for (level, message) in event.log_lines() {
                    logs.push(level, message, id);
                }
                let fragments = event.output_fragments();
                if fragments.is_empty() {
                    return;
                }
                let mut out = live.lock().unwrap_or_else(PoisonError::into_inner);
                for fragment in fragments {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(fragment);
                }
                if out.len() > CURRENT_OUTPUT_CHARS * 2 {
                    let keep = tail_chars(&out, CURRENT_OUTPUT_CHARS).to_string();
                    *out = keep;
                }
            })
            .await;

        if let Err(RunnerError::BinaryNotFound(_)) = &result {
            self.logs.push(
                LogLevel::Error,
                format!("Agent command not found: {}", self.runner.config().command),
                id,
            );
        }
        result
    }

    fn begin(&self, id: Option<TaskId>, title: &str) {
        let mut state = self.engine();
        state.state = AgentState::Running;
        state.current_task_id = id;
        state.current_task_title = Some(title.to_string());
    }

    /// Clear the current work and fall back to idle or stopped.
    fn settle(&self) {
        let loop_running = self.loop_running.load(Ordering::SeqCst);
        let mut state = self.engine();
        state.current_task_id = None;
        state.current_task_title = None;
        state.state = if loop_running {
            AgentState::Idle
        } else {
            AgentState::Stopped
        };
    }

    fn engine(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Title and goal joined into the text handed to the decomposer.
fn plan_goal_text(plan: &Plan) -> String {
    [plan.title.trim(), plan.goal.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use pilot_core::NewPlan;
    use std::path::{Path, PathBuf};
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    const SUCCESS_AGENT: &str = r#"cat > /dev/null
echo '{"type":"system","model":"test-model"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"},{"type":"tool_use","name":"Edit"}]}}'
echo '{"type":"result","result":"finished","total_cost_usd":0.1,"duration_ms":10}'"#;

    struct TestAgent {
        agent: Arc<Agent>,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        write_executable(&dir.join("agent.sh"), body)
    }

    fn write_executable(path: &Path, body: &str) -> PathBuf {
        let path = path.to_path_buf();
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    async fn create_test_agent(script: &str, configure: impl FnOnce(&mut Config)) -> TestAgent {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);

        let mut config = Config {
            target_project: dir.path().to_path_buf(),
            agent_command: write_script(dir.path(), script).display().to_string(),
            poll_interval_sec: 1,
            ..Default::default()
        };
        configure(&mut config);

        let logs = Arc::new(LogSink::default());
        let agent = Agent::new(config, Arc::clone(&storage) as Arc<dyn TaskStore>, logs)
            .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(20)));
        TestAgent {
            agent: Arc::new(agent),
            storage,
            _dir: dir,
        }
    }

    async fn wait_for_status(storage: &Storage, id: TaskId, status: TaskStatus) -> Task {
        for _ in 0..300 {
            let task = storage.get_task(id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} never reached {status:?}");
    }

    async fn wait_for_state(agent: &Agent, state: AgentState) {
        for _ in 0..300 {
            if agent.status().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("agent never reached {state:?}");
    }

    async fn wait_for_plan(storage: &Storage, id: PlanId, status: PlanStatus) -> Plan {
        for _ in 0..300 {
            let plan = storage.get_plan(id).await.unwrap();
            if plan.status == status {
                return plan;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("plan {id} never reached {status:?}");
    }

    fn messages(agent: &Agent) -> Vec<String> {
        agent.logs(0).into_iter().map(|e| e.message).collect()
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Git repo on `main` with one commit, created under `parent`.
    fn init_repo(parent: &Path) -> PathBuf {
        let repo = parent.join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init"]);
        git(&repo, &["config", "user.email", "test@test.com"]);
        git(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# Test").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "Initial commit"]);
        git(&repo, &["branch", "-M", "main"]);
        repo
    }

    /// Like [`init_repo`], plus a bare `origin` the repo pushes to.
    fn init_repo_with_origin(parent: &Path) -> PathBuf {
        let repo = init_repo(parent);
        let origin = parent.join("origin.git");
        git(parent, &["init", "--bare", origin.to_str().unwrap()]);
        git(&repo, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git(&repo, &["push", "-u", "origin", "main"]);
        repo
    }

    #[tokio::test]
    async fn auto_approve_completes_without_waiting() {
        let t = create_test_agent(SUCCESS_AGENT, |c| c.auto_approve = true).await;
        let task = t.storage.create_task(&NewTask::new("Add login")).await.unwrap();

        let done = t.agent.run_task(task.id).await.unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.approval_status, "approved");
        assert_eq!(done.output, "working\nfinished");
        assert_eq!(done.cost_usd, Some(0.1));
        let status = t.agent.status();
        assert_eq!(status.tasks_completed, 1);
        assert_eq!(status.state, AgentState::Stopped);
        let logs = messages(&t.agent);
        assert!(logs.contains(&format!("Starting task #{}: Add login", task.id)));
        assert!(logs.contains(&"Tool: Edit".to_string()));
        assert!(logs.contains(&format!("Task #{} completed (auto-approved)", task.id)));
        assert!(!logs.iter().any(|m| m.contains("waiting for approval")));
    }

    #[tokio::test]
    async fn approval_moves_waiting_task_to_done() {
        let t = create_test_agent(SUCCESS_AGENT, |_| {}).await;
        let task = t.storage.create_task(&NewTask::new("Refactor")).await.unwrap();

        assert!(t.agent.schedule_task(task.id).await.unwrap());
        wait_for_state(&t.agent, AgentState::WaitingApproval).await;
        let waiting = t.storage.get_task(task.id).await.unwrap();
        assert_eq!(waiting.status, TaskStatus::WaitingApproval);
        assert_eq!(waiting.exit_code, Some(0));

        assert!(t.agent.approve());
        let done = wait_for_status(&t.storage, task.id, TaskStatus::Done).await;
        assert_eq!(done.approval_status, "approved");
        assert_eq!(done.output, "working\nfinished");
    }

    #[tokio::test]
    async fn rejection_returns_task_to_pending_with_feedback() {
        let t = create_test_agent(SUCCESS_AGENT, |_| {}).await;
        let task = t.storage.create_task(&NewTask::new("Refactor")).await.unwrap();

        assert!(t.agent.schedule_task(task.id).await.unwrap());
        wait_for_state(&t.agent, AgentState::WaitingApproval).await;
        assert!(t.agent.reject("X"));

        let pending = wait_for_status(&t.storage, task.id, TaskStatus::Pending).await;
        assert_eq!(pending.rejection_feedback, "X");
        assert_eq!(pending.approval_status, "rejected");
        wait_for_state(&t.agent, AgentState::Stopped).await;
        assert_eq!(t.agent.status().tasks_failed, 1);
    }

    #[tokio::test]
    async fn decisions_outside_waiting_are_ignored() {
        let t = create_test_agent(SUCCESS_AGENT, |_| {}).await;
        let task = t.storage.create_task(&NewTask::new("Idle")).await.unwrap();

        assert!(!t.agent.approve());
        assert!(!t.agent.reject("nope"));
        let unchanged = t.storage.get_task(task.id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Pending);
        assert_eq!(unchanged.rejection_feedback, "");
    }

    #[tokio::test]
    async fn failures_retry_with_backoff_then_fail() {
        let t = create_test_agent("cat > /dev/null\necho boom\nexit 1", |_| {}).await;
        let task = t.storage.create_task(&NewTask::new("Flaky")).await.unwrap();

        let failed = t.agent.run_task(task.id).await.unwrap();

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.exit_code, Some(1));
        assert!(failed.error.contains("boom"));
        assert!(failed.error.contains("2 retries"));
        let logs = messages(&t.agent);
        assert!(logs.iter().any(|m| m.ends_with("retry 1/2 in 20ms")));
        assert!(logs.iter().any(|m| m.ends_with("retry 2/2 in 40ms")));
        assert!(logs.contains(&format!("Task #{} failed (exit=1)", task.id)));
        assert_eq!(t.agent.status().tasks_failed, 1);
    }

    #[tokio::test]
    async fn failure_then_success_completes() {
        let script = r#"cat > /dev/null
count_file="$(dirname "$0")/count"
count=$(cat "$count_file" 2>/dev/null || echo 0)
count=$((count + 1))
echo $count > "$count_file"
if [ $count -le 1 ]; then
    exit 1
fi
echo '{"type":"result","result":"ok"}'"#;
        let t = create_test_agent(script, |c| c.auto_approve = true).await;
        let task = t.storage.create_task(&NewTask::new("Flaky once")).await.unwrap();

        let done = t.agent.run_task(task.id).await.unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.retry_count, 1);
        let logs = messages(&t.agent);
        assert_eq!(logs.iter().filter(|m| m.contains("retry ")).count(), 1);
        assert!(logs.iter().any(|m| m.ends_with("retry 1/2 in 20ms")));
    }

    #[tokio::test]
    async fn missing_binary_fails_without_retry() {
        let t = create_test_agent("", |c| c.agent_command = "nonexistent_agent_xyz".into()).await;
        let task = t.storage.create_task(&NewTask::new("Nope")).await.unwrap();

        let failed = t.agent.run_task(task.id).await.unwrap();

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.error.contains("nonexistent_agent_xyz"));
        assert!(messages(&t.agent)
            .contains(&"Agent command not found: nonexistent_agent_xyz".to_string()));
    }

    #[tokio::test]
    async fn run_task_rejects_done_tasks() {
        let t = create_test_agent(SUCCESS_AGENT, |c| c.auto_approve = true).await;
        let task = t.storage.create_task(&NewTask::new("Once")).await.unwrap();
        t.agent.run_task(task.id).await.unwrap();

        let err = t.agent.run_task(task.id).await.unwrap_err();
        assert!(matches!(err, AgentError::NotRunnable { status: TaskStatus::Done, .. }));
        assert!(!t.agent.schedule_task(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn schedule_reports_busy_while_running() {
        let t = create_test_agent("cat > /dev/null\nexec sleep 5", |_| {}).await;
        let first = t.storage.create_task(&NewTask::new("Long")).await.unwrap();
        let second = t.storage.create_task(&NewTask::new("Other")).await.unwrap();

        assert!(t.agent.schedule_task(first.id).await.unwrap());
        wait_for_status(&t.storage, first.id, TaskStatus::InProgress).await;
        assert!(!t.agent.schedule_task(second.id).await.unwrap());
        assert!(t.agent.is_busy());

        t.agent.stop_loop().await;
        assert_eq!(
            t.storage.get_task(first.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn stop_resets_in_progress_task() {
        let t = create_test_agent("cat > /dev/null\nexec sleep 5", |_| {}).await;
        let task = t.storage.create_task(&NewTask::new("Long")).await.unwrap();

        assert!(t.agent.start_loop(LoopFilter::default()).await);
        assert!(!t.agent.start_loop(LoopFilter::default()).await);
        wait_for_status(&t.storage, task.id, TaskStatus::InProgress).await;
        assert_eq!(t.agent.status().current_task_id, Some(task.id));

        t.agent.stop_loop().await;

        let reset = t.storage.get_task(task.id).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        let status = t.agent.status();
        assert_eq!(status.state, AgentState::Stopped);
        assert!(!status.loop_running);
        assert_eq!(status.current_task_id, None);
        assert!(messages(&t.agent).contains(&"Agent loop stopped".to_string()));
    }

    #[tokio::test]
    async fn stop_while_waiting_resets_to_pending() {
        let t = create_test_agent(SUCCESS_AGENT, |_| {}).await;
        let task = t.storage.create_task(&NewTask::new("Review me")).await.unwrap();

        assert!(t.agent.start_loop(LoopFilter::default()).await);
        wait_for_state(&t.agent, AgentState::WaitingApproval).await;
        t.agent.stop_loop().await;

        assert_eq!(
            t.storage.get_task(task.id).await.unwrap().status,
            TaskStatus::Pending
        );
        assert!(!t.agent.approve());
    }

    #[tokio::test]
    async fn loop_and_direct_runs_never_overlap() {
        let script = r#"cat > /dev/null
sleep 0.2
echo '{"type":"result","result":"ok"}'"#;
        let t = create_test_agent(script, |c| c.auto_approve = true).await;
        let mut ids = Vec::new();
        for title in ["a", "b", "c"] {
            ids.push(t.storage.create_task(&NewTask::new(title)).await.unwrap().id);
        }

        assert!(t.agent.start_loop(LoopFilter::default()).await);
        let direct = {
            let agent = Arc::clone(&t.agent);
            let id = ids[2];
            tokio::spawn(async move { agent.run_task(id).await })
        };

        let mut max_in_progress = 0;
        for _ in 0..300 {
            let tasks = t
                .storage
                .list_tasks(&crate::storage::TaskFilter::default())
                .await
                .unwrap();
            let in_progress = tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count();
            max_in_progress = max_in_progress.max(in_progress);
            if tasks.iter().all(|t| t.status == TaskStatus::Done) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = direct.await.unwrap();
        t.agent.stop_loop().await;
        assert_eq!(max_in_progress, 1);
        for id in ids {
            assert_eq!(t.storage.get_task(id).await.unwrap().status, TaskStatus::Done);
        }
    }

    #[tokio::test]
    async fn loop_respects_priority_filter() {
        let t = create_test_agent(SUCCESS_AGENT, |c| c.auto_approve = true).await;
        let low = t.storage.create_task(&NewTask::new("low")).await.unwrap();
        let urgent = t
            .storage
            .create_task(&NewTask {
                priority: TaskPriority::Urgent,
                ..NewTask::new("urgent")
            })
            .await
            .unwrap();

        let filter = LoopFilter {
            min_priority: Some(TaskPriority::High),
            epic_id: None,
        };
        assert!(t.agent.start_loop(filter).await);
        wait_for_status(&t.storage, urgent.id, TaskStatus::Done).await;
        t.agent.stop_loop().await;

        assert_eq!(
            t.storage.get_task(low.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn decompose_creates_tasks_from_agent_plan() {
        let script = r##"cat > /dev/null
cat <<'JSON'
{"type":"assistant","message":{"content":[{"type":"text","text":"Plan below"}]}}
{"type":"result","result":"[{\"title\":\"Write docs\",\"priority\":2},{\"title\":\"Add tests\",\"labels\":[\"qa\"],\"priority\":\"urgent\"},{\"title\":\"\"}]"}
JSON"##;
        let t = create_test_agent(script, |_| {}).await;

        let created = t.agent.decompose("Ship v1", Some(9)).await.unwrap();

        assert_eq!(created.len(), 2);
        assert_eq!(created[0].title, "Write docs");
        assert_eq!(created[0].priority, TaskPriority::High);
        assert_eq!(created[1].labels, vec!["qa"]);
        assert_eq!(created[1].priority, TaskPriority::Urgent);
        assert!(created.iter().all(|t| t.epic_id == Some(9)));
        assert!(created.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn decompose_without_json_is_an_error() {
        let t = create_test_agent("cat > /dev/null\necho 'no plan today'", |_| {}).await;
        let err = t.agent.decompose("Ship v1", None).await.unwrap_err();
        assert!(matches!(err, AgentError::Decompose(_)));
        assert!(matches!(
            t.agent.decompose("  ", None).await.unwrap_err(),
            AgentError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn decompose_shows_progress_and_live_output() {
        let script = r##"cat > /dev/null
sleep 0.3
cat <<'JSON'
{"type":"assistant","message":{"content":[{"type":"text","text":"Thinking about steps"}]}}
{"type":"result","result":"[{\"title\":\"Step one\"}]"}
JSON"##;
        let t = create_test_agent(script, |_| {}).await;

        let agent = Arc::clone(&t.agent);
        let handle = tokio::spawn(async move { agent.decompose("Ship v2", None).await });
        wait_for_state(&t.agent, AgentState::Running).await;
        let status = t.agent.status();
        assert_eq!(status.current_task_id, None);
        assert_eq!(status.current_task_title.as_deref(), Some("Decomposing: Ship v2"));

        let created = handle.await.unwrap().unwrap();
        assert_eq!(created.len(), 1);
        let status = t.agent.status();
        assert_eq!(status.state, AgentState::Stopped);
        assert_eq!(status.current_task_title, None);
        assert!(t.agent.current_output().contains("Thinking about steps"));
    }

    #[tokio::test]
    async fn unpublished_branch_is_deleted_after_completion() {
        let script = r#"cat > /dev/null
echo change > new_file.txt
echo '{"type":"result","result":"ok"}'"#;
        // No remote, so the push fails and no PR is opened.
        let t = create_test_agent(script, |c| {
            c.target_project = init_repo(&c.target_project);
            c.git.enabled = true;
            c.auto_approve = true;
        })
        .await;
        let repo = t.agent.config().target_project.clone();
        let task = t.storage.create_task(&NewTask::new("Add file")).await.unwrap();

        let done = t.agent.run_task(task.id).await.unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.branch_name, None);
        assert_eq!(done.pr_url, None);
        assert_eq!(git(&repo, &["branch", "--show-current"]), "main");
        assert!(git(&repo, &["branch", "--list", "pilot/*"]).is_empty());
        assert!(!repo.join("new_file.txt").exists());
        let logs = messages(&t.agent);
        assert!(logs.iter().any(|m| m.starts_with("Commit/push failed")));
        assert!(logs.contains(&"No pull request opened; returning to the base branch".to_string()));
    }

    #[tokio::test]
    async fn empty_diff_leaves_no_task_branch() {
        let t = create_test_agent(SUCCESS_AGENT, |c| {
            c.target_project = init_repo(&c.target_project);
            c.git.enabled = true;
        })
        .await;
        let repo = t.agent.config().target_project.clone();
        let task = t.storage.create_task(&NewTask::new("No-op")).await.unwrap();

        assert!(t.agent.schedule_task(task.id).await.unwrap());
        wait_for_state(&t.agent, AgentState::WaitingApproval).await;
        assert_eq!(git(&repo, &["branch", "--show-current"]), "main");
        assert!(git(&repo, &["branch", "--list", "pilot/*"]).is_empty());

        assert!(t.agent.approve());
        wait_for_status(&t.storage, task.id, TaskStatus::Done).await;
        assert!(messages(&t.agent).contains(&"No changes to commit".to_string()));
    }

    /// Agent that records each prompt and leaves one new file per run.
    const RECORDING_AGENT: &str = r#"dir="$(dirname "$0")"
n=$(cat "$dir/agent_runs" 2>/dev/null || echo 0)
n=$((n + 1))
echo $n > "$dir/agent_runs"
cat > "$dir/prompt_$n"
echo "change $n" > "change_$n.txt"
echo '{"type":"result","result":"ok"}'"#;

    /// `gh` stand-in: PR #7, one inline comment for the first two fetches,
    /// then `later` for every fetch after that.
    fn fake_gh(later: &str) -> String {
        r#"dir="$(dirname "$0")"
echo "$*" >> "$dir/gh_calls"
case "$1" in
pr)
    case "$2" in
    create) echo "Creating pull request"; echo "https://github.com/o/r/pull/7" ;;
    view) echo '{"reviews":[]}' ;;
    esac
    ;;
api)
    n=$(cat "$dir/api_calls" 2>/dev/null || echo 0)
    n=$((n + 1))
    echo $n > "$dir/api_calls"
    if [ $n -le 2 ]; then
        echo '[{"user":{"login":"alice"},"body":"Rename x","path":"a.rs","line":1}]'
    else
        echo 'LATER'
    fi
    ;;
esac"#
            .replace("LATER", later)
    }

    async fn create_review_agent(later: &str) -> TestAgent {
        let gh = fake_gh(later);
        create_test_agent(RECORDING_AGENT, |c| {
            let root = c.target_project.clone();
            c.target_project = init_repo_with_origin(&root);
            c.auto_approve = true;
            c.git.enabled = true;
            c.git.auto_merge = true;
            c.git.gh_command = write_executable(&root.join("gh.sh"), &gh)
                .display()
                .to_string();
            c.git.review_grace_sec = 0;
            c.git.review_followup_wait_sec = 0;
            c.git.review_poll_interval_sec = 1;
            c.git.review_timeout_sec = 5;
            c.git.max_review_rounds = 2;
        })
        .await
    }

    fn read(dir: &Path, name: &str) -> String {
        std::fs::read_to_string(dir.join(name)).unwrap_or_default()
    }

    #[tokio::test]
    async fn second_review_round_addresses_only_new_comments() {
        let later = r#"[{"user":{"login":"alice"},"body":"Rename x","path":"a.rs","line":1},{"user":{"login":"bob"},"body":"Add a test","path":"b.rs","line":2}]"#;
        let t = create_review_agent(later).await;
        let repo = t.agent.config().target_project.clone();
        let root = repo.parent().unwrap().to_path_buf();
        let task = t.storage.create_task(&NewTask::new("Reviewed change")).await.unwrap();

        let done = t.agent.run_task(task.id).await.unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.pr_url.as_deref(), Some("https://github.com/o/r/pull/7"));
        let logs = messages(&t.agent);
        assert!(logs.contains(&"Addressing 1 review comment(s), round 1".to_string()));
        assert!(logs.contains(&"Addressing 1 review comment(s), round 2".to_string()));
        assert!(logs.contains(&"Merged PR #7".to_string()));

        assert!(read(&root, "prompt_2").contains("Rename x"));
        let second_round = read(&root, "prompt_3");
        assert!(second_round.contains("Add a test"));
        assert!(!second_round.contains("Rename x"));

        assert!(read(&root, "gh_calls").contains("pr merge 7 --squash --delete-branch"));
        assert_eq!(git(&repo, &["branch", "--show-current"]), "main");
    }

    #[tokio::test]
    async fn review_stops_when_no_new_comments_arrive() {
        let later = r#"[{"user":{"login":"alice"},"body":"Rename x","path":"a.rs","line":1}]"#;
        let t = create_review_agent(later).await;
        let root = t.agent.config().target_project.parent().unwrap().to_path_buf();
        let task = t.storage.create_task(&NewTask::new("Reviewed once")).await.unwrap();

        let done = t.agent.run_task(task.id).await.unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        let logs = messages(&t.agent);
        assert!(logs.contains(&"Addressing 1 review comment(s), round 1".to_string()));
        assert!(!logs.iter().any(|m| m.ends_with("round 2")));
        assert!(logs.contains(&"Merged PR #7".to_string()));
        assert_eq!(read(&root, "agent_runs").trim(), "2");
    }

    /// Returns two tasks for a decomposition prompt; otherwise records the
    /// task title and fails on "Step B" when `fail_b` is set.
    fn plan_agent(fail_b: bool) -> String {
        r##"dir="$(dirname "$0")"
prompt=$(cat)
case "$prompt" in
*"Break this goal"*)
cat <<'JSON'
{"type":"result","result":"[{\"title\":\"Step A\"},{\"title\":\"Step B\"}]"}
JSON
;;
*)
title=$(printf '%s\n' "$prompt" | head -n 1)
echo "$title" >> "$dir/ran"
sleep 0.4
if [ "$title" = "Step B" ]; then
    FAIL_B
fi
echo '{"type":"result","result":"ok"}'
;;
esac"##
            .replace("FAIL_B", if fail_b { "exit 1" } else { ":" })
    }

    async fn create_plan(storage: &Storage) -> Plan {
        storage
            .create_plan(&NewPlan {
                title: "Billing".into(),
                goal: "Add invoices".into(),
                epic_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn approved_plan_runs_tasks_in_plan_order() {
        let t = create_test_agent(&plan_agent(false), |c| c.auto_approve = true).await;
        let plan = create_plan(&t.storage).await;

        let started = t.agent.start_plan_decompose(plan.id).await.unwrap();
        assert_eq!(started.status, PlanStatus::Decomposing);
        wait_for_plan(&t.storage, plan.id, PlanStatus::Reviewing).await;

        let tasks = t.storage.plan_tasks(plan.id).await.unwrap();
        assert_eq!(
            tasks.iter().map(|t| t.title.as_str()).collect::<Vec<_>>(),
            vec!["Step A", "Step B"]
        );
        t.storage
            .reorder_plan_tasks(plan.id, &[tasks[1].id, tasks[0].id])
            .await
            .unwrap();

        let approved = t.agent.approve_plan(plan.id).await.unwrap();
        assert_eq!(approved.status, PlanStatus::Approved);
        wait_for_plan(&t.storage, plan.id, PlanStatus::Completed).await;

        let root = t.agent.config().target_project.clone();
        assert_eq!(read(&root, "ran"), "Step B\nStep A\n");
        for task in tasks {
            assert_eq!(t.storage.get_task(task.id).await.unwrap().status, TaskStatus::Done);
        }
        assert!(messages(&t.agent).contains(&format!("Plan #{} completed", plan.id)));
    }

    #[tokio::test]
    async fn failed_task_fails_the_plan() {
        let t = create_test_agent(&plan_agent(true), |c| c.auto_approve = true).await;
        let plan = create_plan(&t.storage).await;
        t.agent.start_plan_decompose(plan.id).await.unwrap();
        wait_for_plan(&t.storage, plan.id, PlanStatus::Reviewing).await;
        let tasks = t.storage.plan_tasks(plan.id).await.unwrap();

        t.agent.approve_plan(plan.id).await.unwrap();
        let failed = wait_for_plan(&t.storage, plan.id, PlanStatus::Failed).await;

        assert_eq!(failed.error, format!("Task #{} failed", tasks[1].id));
        assert_eq!(
            t.storage.get_task(tasks[0].id).await.unwrap().status,
            TaskStatus::Done
        );
        assert!(PlanStatus::Failed.can_approve());
    }

    #[tokio::test]
    async fn plan_decompose_failure_returns_to_draft() {
        let t = create_test_agent("cat > /dev/null\necho 'no plan today'", |_| {}).await;
        let plan = create_plan(&t.storage).await;

        t.agent.start_plan_decompose(plan.id).await.unwrap();

        let draft = wait_for_plan(&t.storage, plan.id, PlanStatus::Draft).await;
        assert!(draft.error.contains("no JSON task list"));
        assert!(t.storage.plan_tasks(plan.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_transitions_are_checked() {
        let t = create_test_agent(SUCCESS_AGENT, |_| {}).await;
        let plan = create_plan(&t.storage).await;

        let err = t.agent.approve_plan(plan.id).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::PlanState { status: PlanStatus::Draft, action: "approve", .. }
        ));
        let err = t.agent.stop_plan(plan.id).await.unwrap_err();
        assert!(matches!(err, AgentError::PlanState { action: "stop", .. }));

        t.storage
            .set_plan_status(plan.id, PlanStatus::Reviewing, None)
            .await
            .unwrap();
        let err = t.agent.approve_plan(plan.id).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));

        t.storage
            .set_plan_status(plan.id, PlanStatus::Running, None)
            .await
            .unwrap();
        let err = t.agent.start_plan_decompose(plan.id).await.unwrap_err();
        assert!(matches!(err, AgentError::PlanState { action: "decompose", .. }));
    }

    #[tokio::test]
    async fn stopped_plan_finishes_current_task_only() {
        let t = create_test_agent(&plan_agent(false), |c| c.auto_approve = true).await;
        let plan = create_plan(&t.storage).await;
        t.agent.start_plan_decompose(plan.id).await.unwrap();
        wait_for_plan(&t.storage, plan.id, PlanStatus::Reviewing).await;
        let tasks = t.storage.plan_tasks(plan.id).await.unwrap();

        t.agent.approve_plan(plan.id).await.unwrap();
        wait_for_status(&t.storage, tasks[0].id, TaskStatus::InProgress).await;
        let stopped = t.agent.stop_plan(plan.id).await.unwrap();
        assert_eq!(stopped.status, PlanStatus::Failed);
        assert_eq!(stopped.error, "Stopped by user");

        wait_for_status(&t.storage, tasks[0].id, TaskStatus::Done).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            t.storage.get_task(tasks[1].id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn stop_loop_interrupts_running_plan() {
        let t = create_test_agent(&plan_agent(false), |c| c.auto_approve = true).await;
        let plan = create_plan(&t.storage).await;
        t.agent.start_plan_decompose(plan.id).await.unwrap();
        wait_for_plan(&t.storage, plan.id, PlanStatus::Reviewing).await;
        let tasks = t.storage.plan_tasks(plan.id).await.unwrap();

        t.agent.approve_plan(plan.id).await.unwrap();
        wait_for_status(&t.storage, tasks[0].id, TaskStatus::InProgress).await;
        t.agent.stop_loop().await;

        let plan = t.storage.get_plan(plan.id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.error, "interrupted");
    }
}
