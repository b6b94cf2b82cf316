//! Core types for the task pilot.
//!
//! Tasks are owned by the store; the engine reads what it needs to build a
//! prompt and writes status/result fields back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned task identifier.
pub type TaskId = i64;

pub type EpicId = i64;

pub type PlanId = i64;

// --- Enumerations ---

/// Task priority. Serialized as its integer value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Parse either the integer form ("2") or the name ("high").
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "low" => Some(Self::Low),
            "1" | "medium" => Some(Self::Medium),
            "2" | "high" => Some(Self::High),
            "3" | "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl TryFrom<i64> for TaskPriority {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Medium),
            2 => Ok(Self::High),
            3 => Ok(Self::Urgent),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

impl From<TaskPriority> for i64 {
    fn from(priority: TaskPriority) -> Self {
        priority.as_i64()
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    WaitingApproval,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::WaitingApproval => "waiting_approval",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "waiting_approval" => Some(Self::WaitingApproval),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the engine may start an attempt from this status.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// Engine-wide state. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Stopped,
    Idle,
    Running,
    WaitingApproval,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
        }
    }
}

/// Severity/category of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Sys,
    Agent,
    Tool,
    Result,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sys => "SYS",
            Self::Agent => "AGENT",
            Self::Tool => "TOOL",
            Self::Result => "RESULT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SYS" => Some(Self::Sys),
            "AGENT" => Some(Self::Agent),
            "TOOL" => Some(Self::Tool),
            "RESULT" => Some(Self::Result),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// PR merge method passed to the hosting CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    /// The `gh pr merge` flag for this strategy.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Squash => "--squash",
            Self::Merge => "--merge",
            Self::Rebase => "--rebase",
        }
    }
}

/// Epic lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    #[default]
    Open,
    Closed,
}

impl EpicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Plan lifecycle.
///
/// ```text
/// draft -> decomposing -> reviewing -> approved -> running -> completed
///              |              ^                      |
///              v              |                      v
///            draft        (re-decompose)          failed -> approved (resume)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Decomposing,
    Reviewing,
    Approved,
    Running,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Decomposing => "decomposing",
            Self::Reviewing => "reviewing",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "decomposing" => Some(Self::Decomposing),
            "reviewing" => Some(Self::Reviewing),
            "approved" => Some(Self::Approved),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the agent may (re)generate the plan's tasks.
    pub fn can_decompose(&self) -> bool {
        matches!(self, Self::Draft | Self::Reviewing)
    }

    /// Whether the plan may be approved and run.
    pub fn can_approve(&self) -> bool {
        matches!(self, Self::Reviewing | Self::Failed)
    }

    /// Approved or running: its tasks are being executed.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Approved | Self::Running)
    }
}

// --- Records ---

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub epic_id: Option<EpicId>,
    /// Set for tasks generated from a plan; such tasks run only as part of it.
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    /// Position within the plan.
    #[serde(default)]
    pub plan_order: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// "", "approved" or "rejected".
    #[serde(default)]
    pub approval_status: String,
    #[serde(default)]
    pub rejection_feedback: String,
}

/// Payload for creating a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<i64>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Partial update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<i64>,
}

/// Filters applied when the loop dequeues the next task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopFilter {
    #[serde(default)]
    pub min_priority: Option<TaskPriority>,
    #[serde(default)]
    pub epic_id: Option<i64>,
}

/// Snapshot of the engine, returned by status queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub current_task_id: Option<TaskId>,
    pub current_task_title: Option<String>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub loop_running: bool,
}

/// One line in the engine's log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

/// A group of related tasks and plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub id: EpicId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: EpicStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEpic {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EpicStatus>,
}

/// Task counts per status within an epic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicStats {
    pub total: u32,
    pub pending: u32,
    pub in_progress: u32,
    pub waiting_approval: u32,
    pub done: u32,
    pub failed: u32,
}

impl EpicStats {
    pub fn add(&mut self, status: TaskStatus, count: u32) {
        self.total += count;
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::WaitingApproval => self.waiting_approval += count,
            TaskStatus::Done => self.done += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    /// Whole-number share of done tasks, 0 for an empty epic.
    pub fn percent_done(&self) -> u32 {
        if self.total == 0 {
            0
        } else {
            self.done * 100 / self.total
        }
    }
}

/// Epic with its task counts, as listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicSummary {
    #[serde(flatten)]
    pub epic: Epic,
    pub stats: EpicStats,
}

/// Epic with everything attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicDetail {
    #[serde(flatten)]
    pub epic: Epic,
    pub tasks: Vec<Task>,
    pub plans: Vec<Plan>,
    pub stats: EpicStats,
}

/// A goal the agent breaks into ordered tasks, reviewed before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default)]
    pub epic_id: Option<EpicId>,
    /// Why the last decomposition or run stopped, if it did.
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPlan {
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<EpicId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<EpicId>,
}

/// Plan with its tasks in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDetail {
    #[serde(flatten)]
    pub plan: Plan,
    pub tasks: Vec<Task>,
}

/// A human decision posted to the approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected { feedback: String },
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// An actionable comment left on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub author: String,
    pub body: String,
    /// File path for inline comments; `None` for review summaries.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&TaskPriority::High).unwrap(), "2");
        let parsed: TaskPriority = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, TaskPriority::Urgent);
        assert!(serde_json::from_str::<TaskPriority>("7").is_err());
    }

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::High < TaskPriority::Urgent);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn priority_parses_names_and_numbers() {
        assert_eq!(TaskPriority::parse("high"), Some(TaskPriority::High));
        assert_eq!(TaskPriority::parse("0"), Some(TaskPriority::Low));
        assert_eq!(TaskPriority::parse("URGENT"), Some(TaskPriority::Urgent));
        assert_eq!(TaskPriority::parse("soon"), None);
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::WaitingApproval,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_string(&TaskStatus::WaitingApproval).unwrap(),
            "\"waiting_approval\""
        );
    }

    #[test]
    fn only_pending_and_failed_are_runnable() {
        assert!(TaskStatus::Pending.is_runnable());
        assert!(TaskStatus::Failed.is_runnable());
        assert!(!TaskStatus::InProgress.is_runnable());
        assert!(!TaskStatus::WaitingApproval.is_runnable());
        assert!(!TaskStatus::Done.is_runnable());
    }

    #[test]
    fn log_level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&LogLevel::Sys).unwrap(), "\"SYS\"");
        assert_eq!(LogLevel::parse("TOOL"), Some(LogLevel::Tool));
    }

    #[test]
    fn agent_state_default_is_stopped() {
        assert_eq!(AgentState::default(), AgentState::Stopped);
        assert_eq!(
            serde_json::to_string(&AgentState::WaitingApproval).unwrap(),
            "\"waiting_approval\""
        );
    }

    #[test]
    fn merge_strategy_flags() {
        assert_eq!(MergeStrategy::default().flag(), "--squash");
        assert_eq!(MergeStrategy::Rebase.flag(), "--rebase");
    }

    #[test]
    fn approval_decision_is_tagged() {
        let json = serde_json::to_value(ApprovalDecision::Rejected {
            feedback: "needs tests".into(),
        })
        .unwrap();
        assert_eq!(json["decision"], "rejected");
        assert_eq!(json["feedback"], "needs tests");
        assert!(ApprovalDecision::Approved.is_approved());
    }

    #[test]
    fn plan_status_transitions() {
        assert!(PlanStatus::Draft.can_decompose());
        assert!(PlanStatus::Reviewing.can_decompose());
        assert!(!PlanStatus::Running.can_decompose());
        assert!(PlanStatus::Reviewing.can_approve());
        assert!(PlanStatus::Failed.can_approve());
        assert!(!PlanStatus::Draft.can_approve());
        assert!(PlanStatus::Approved.is_active());
        assert!(!PlanStatus::Completed.is_active());
        assert_eq!(PlanStatus::parse("decomposing"), Some(PlanStatus::Decomposing));
        assert_eq!(EpicStatus::parse(EpicStatus::Closed.as_str()), Some(EpicStatus::Closed));
    }

    #[test]
    fn epic_stats_count_by_status() {
        let mut stats = EpicStats::default();
        assert_eq!(stats.percent_done(), 0);
        stats.add(TaskStatus::Done, 3);
        stats.add(TaskStatus::Pending, 1);
        stats.add(TaskStatus::Failed, 2);
        assert_eq!(stats.total, 6);
        assert_eq!(stats.done, 3);
        assert_eq!(stats.percent_done(), 50);
    }

    #[test]
    fn plan_detail_flattens_plan_fields() {
        let now = Utc::now();
        let detail = PlanDetail {
            plan: Plan {
                id: 4,
                title: "Auth".into(),
                goal: "Add login".into(),
                status: PlanStatus::Reviewing,
                epic_id: None,
                error: String::new(),
                created_at: now,
                updated_at: now,
            },
            tasks: Vec::new(),
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["status"], "reviewing");
        assert!(json["tasks"].as_array().unwrap().is_empty());

        let back: PlanDetail = serde_json::from_value(json).unwrap();
        assert_eq!(back, detail);
    }
}
