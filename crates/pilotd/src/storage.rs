//! SQLite storage for the task queue.
//!
//! [`TaskStore`] is the narrow interface the execution engine consumes;
//! [`Storage`] implements it and adds the CRUD used by the HTTP layer.
//! Most operations are a single statement; the few multi-statement ones
//! (plan task replacement, reordering, deletes) run in a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pilot_core::{
    Epic, EpicId, EpicStats, EpicStatus, EpicUpdate, LogEntry, LogLevel, LoopFilter, NewEpic,
    NewPlan, NewTask, Plan, PlanId, PlanStatus, PlanUpdate, Task, TaskId, TaskPriority, TaskStatus,
    TaskUpdate,
};
use sqlx::{
    sqlite::{SqlitePoolOptions, SqliteQueryResult},
    Pool, Sqlite,
};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for task queries.
const TASK_COLUMNS: &str = "id, title, description, priority, status, labels_json, epic_id, \
    plan_id, plan_order, retry_count, branch_name, pr_url, created_at, updated_at, started_at, \
    completed_at, output, error, exit_code, cost_usd, approval_status, rejection_feedback";

const PLAN_COLUMNS: &str = "id, title, goal, status, epic_id, error, created_at, updated_at";

const EPIC_COLUMNS: &str = "id, title, description, status, created_at, updated_at";

/// Active work first, then the queue, then finished tasks.
const LIST_ORDER: &str = "ORDER BY CASE status \
    WHEN 'in_progress' THEN 0 \
    WHEN 'waiting_approval' THEN 1 \
    WHEN 'pending' THEN 2 \
    WHEN 'failed' THEN 3 \
    ELSE 4 END, priority DESC, created_at ASC, id ASC";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("plan not found: {0}")]
    PlanNotFound(PlanId),
    #[error("epic not found: {0}")]
    EpicNotFound(EpicId),
    #[error("task {task_id} does not belong to plan {plan_id}")]
    NotInPlan { plan_id: PlanId, task_id: TaskId },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Result fields written when an attempt finishes successfully.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResult {
    pub output: String,
    pub exit_code: i32,
    pub cost_usd: Option<f64>,
}

/// Store operations consumed by the execution engine.
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    async fn create_task(&self, new: &NewTask) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Highest priority pending task, oldest first within a priority.
    /// Plan tasks are never picked here; they run through their plan.
    async fn pick_next_pending(&self, filter: &LoopFilter) -> Result<Option<Task>>;

    async fn set_task_started(&self, id: TaskId) -> Result<()>;

    async fn set_task_git(&self, id: TaskId, branch: Option<&str>, pr_url: Option<&str>)
        -> Result<()>;

    async fn set_task_waiting(&self, id: TaskId, result: &TaskResult) -> Result<()>;

    /// Mark done. `result` is `None` when it was already stored by
    /// [`TaskStore::set_task_waiting`].
    async fn set_task_done(&self, id: TaskId, result: Option<&TaskResult>) -> Result<()>;

    async fn set_task_failed(
        &self,
        id: TaskId,
        error: &str,
        exit_code: Option<i32>,
        cost_usd: Option<f64>,
    ) -> Result<()>;

    /// Back to pending with the reviewer's feedback attached.
    async fn set_task_rejected(&self, id: TaskId, feedback: &str) -> Result<()>;

    /// Returns the new count.
    async fn increment_retry_count(&self, id: TaskId) -> Result<u32>;

    /// Move `in_progress` and `waiting_approval` tasks back to `pending`.
    async fn reset_stuck_tasks(&self) -> Result<u64>;

    async fn append_log(&self, task_id: TaskId, entry: &LogEntry) -> Result<()>;

    async fn get_plan(&self, id: PlanId) -> Result<Plan>;

    /// Set the plan status. `error` replaces the stored error when given.
    async fn set_plan_status(&self, id: PlanId, status: PlanStatus, error: Option<&str>)
        -> Result<()>;

    /// The plan's tasks in execution order.
    async fn plan_tasks(&self, plan_id: PlanId) -> Result<Vec<Task>>;

    /// Drop the plan's unstarted tasks and insert `tasks` in order.
    async fn replace_plan_tasks(&self, plan_id: PlanId, tasks: &[NewTask]) -> Result<Vec<Task>>;

    /// Fail running plans and return decomposing plans to draft.
    async fn reset_stuck_plans(&self) -> Result<u64>;
}

/// Filters for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub label: Option<String>,
    pub epic_id: Option<EpicId>,
    pub plan_id: Option<PlanId>,
    /// Case-insensitive substring of title or description.
    pub search: Option<String>,
}

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run the embedded schema. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/0001_init.sql"),
            include_str!("../../../migrations/0002_epics_plans.sql"),
        ];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Task queries used by the control plane ---

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE (?1 IS NULL OR status = ?1) \
               AND (?2 IS NULL OR epic_id = ?2) \
               AND (?3 IS NULL OR title LIKE ?3 OR description LIKE ?3) \
               AND (?4 IS NULL OR plan_id = ?4) \
             {LIST_ORDER}"
        );
        let search = filter.search.as_ref().map(|s| format!("%{s}%"));
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.epic_id)
            .bind(search)
            .bind(filter.plan_id)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>>>()?;

        // Labels live in a JSON column; match them after decoding.
        if let Some(label) = &filter.label {
            tasks.retain(|t| t.labels.iter().any(|l| l.eq_ignore_ascii_case(label)));
        }

        Ok(tasks)
    }

    pub async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<Task> {
        let labels_json = update
            .labels
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r"
            UPDATE tasks SET
                title = COALESCE(?1, title),
                description = COALESCE(?2, description),
                priority = COALESCE(?3, priority),
                status = COALESCE(?4, status),
                labels_json = COALESCE(?5, labels_json),
                epic_id = COALESCE(?6, epic_id),
                updated_at = ?7
            WHERE id = ?8
            ",
        )
        .bind(update.title.as_deref())
        .bind(update.description.as_deref())
        .bind(update.priority.map(TaskPriority::as_i64))
        .bind(update.status.map(|s| s.as_str()))
        .bind(labels_json)
        .bind(update.epic_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        expect_affected(id, &result)?;
        self.fetch_task(id).await
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        expect_affected(id, &result)?;

        sqlx::query("DELETE FROM task_logs WHERE task_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reset a task to pending and clear its previous result and retry count.
    pub async fn retry_task(&self, id: TaskId) -> Result<Task> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r"
            UPDATE tasks SET status = 'pending', error = '', exit_code = NULL,
                started_at = NULL, completed_at = NULL, output = '', cost_usd = NULL,
                retry_count = 0, approval_status = '', updated_at = ?1
            WHERE id = ?2
            ",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        expect_affected(id, &result)?;
        self.fetch_task(id).await
    }

    /// Persisted log lines for a task, oldest first.
    pub async fn get_task_logs(&self, task_id: TaskId, limit: u32) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, task_id, ts, level, message FROM \
             (SELECT * FROM task_logs WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2) \
             ORDER BY id ASC",
        )
        .bind(task_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LogRow::into_entry).collect())
    }

    // --- Epics ---

    pub async fn create_epic(&self, new: &NewEpic) -> Result<Epic> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO epics (title, description, status, created_at, updated_at) \
             VALUES (?1, ?2, 'open', ?3, ?3)",
        )
        .bind(&new.title)
        .bind(&new.description)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_epic(result.last_insert_rowid()).await
    }

    pub async fn get_epic(&self, id: EpicId) -> Result<Epic> {
        let query = format!("SELECT {EPIC_COLUMNS} FROM epics WHERE id = ?1");
        sqlx::query_as::<_, EpicRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(EpicRow::into_epic)
            .ok_or(StorageError::EpicNotFound(id))
    }

    /// Open epics first, newest first within a status.
    pub async fn list_epics(&self, status: Option<EpicStatus>) -> Result<Vec<Epic>> {
        let query = format!(
            "SELECT {EPIC_COLUMNS} FROM epics WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY CASE status WHEN 'open' THEN 0 ELSE 1 END, created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, EpicRow>(&query)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EpicRow::into_epic).collect())
    }

    pub async fn update_epic(&self, id: EpicId, update: &EpicUpdate) -> Result<Epic> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r"
            UPDATE epics SET
                title = COALESCE(?1, title),
                description = COALESCE(?2, description),
                status = COALESCE(?3, status),
                updated_at = ?4
            WHERE id = ?5
            ",
        )
        .bind(update.title.as_deref())
        .bind(update.description.as_deref())
        .bind(update.status.map(|s| s.as_str()))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EpicNotFound(id));
        }
        self.get_epic(id).await
    }

    /// Delete an epic. Its tasks and plans are kept and detached.
    pub async fn delete_epic(&self, id: EpicId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM epics WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::EpicNotFound(id));
        }

        sqlx::query("UPDATE tasks SET epic_id = NULL WHERE epic_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE plans SET epic_id = NULL WHERE epic_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Task counts per status for one epic.
    pub async fn epic_stats(&self, id: EpicId) -> Result<EpicStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks WHERE epic_id = ?1 GROUP BY status")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let mut stats = EpicStats::default();
        for (status, count) in rows {
            if let Some(status) = TaskStatus::parse(&status) {
                stats.add(status, count.max(0) as u32);
            }
        }
        Ok(stats)
    }

    // --- Plans ---

    pub async fn create_plan(&self, new: &NewPlan) -> Result<Plan> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO plans (title, goal, status, epic_id, created_at, updated_at) \
             VALUES (?1, ?2, 'draft', ?3, ?4, ?4)",
        )
        .bind(&new.title)
        .bind(&new.goal)
        .bind(new.epic_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_plan(result.last_insert_rowid()).await
    }

    /// Newest first.
    pub async fn list_plans(
        &self,
        status: Option<PlanStatus>,
        epic_id: Option<EpicId>,
    ) -> Result<Vec<Plan>> {
        let query = format!(
            "SELECT {PLAN_COLUMNS} FROM plans \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR epic_id = ?2) \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, PlanRow>(&query)
            .bind(status.map(|s| s.as_str()))
            .bind(epic_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PlanRow::into_plan).collect())
    }

    pub async fn update_plan(&self, id: PlanId, update: &PlanUpdate) -> Result<Plan> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r"
            UPDATE plans SET
                title = COALESCE(?1, title),
                goal = COALESCE(?2, goal),
                epic_id = COALESCE(?3, epic_id),
                updated_at = ?4
            WHERE id = ?5
            ",
        )
        .bind(update.title.as_deref())
        .bind(update.goal.as_deref())
        .bind(update.epic_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::PlanNotFound(id));
        }
        self.get_plan(id).await
    }

    /// Delete a plan and its unstarted tasks. Finished tasks are kept and
    /// detached from the plan.
    pub async fn delete_plan(&self, id: PlanId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM plans WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::PlanNotFound(id));
        }

        sqlx::query(
            "DELETE FROM task_logs WHERE task_id IN \
             (SELECT id FROM tasks WHERE plan_id = ?1 AND status IN ('pending', 'failed'))",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM tasks WHERE plan_id = ?1 AND status IN ('pending', 'failed')")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE tasks SET plan_id = NULL, plan_order = NULL WHERE plan_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Give `task_ids` positions 0.. in the given order. Every id must
    /// belong to the plan; unlisted tasks keep their position.
    pub async fn reorder_plan_tasks(&self, plan_id: PlanId, task_ids: &[TaskId]) -> Result<()> {
        self.get_plan(plan_id).await?;

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for (order, &task_id) in task_ids.iter().enumerate() {
            let result = sqlx::query(
                "UPDATE tasks SET plan_order = ?1, updated_at = ?2 WHERE id = ?3 AND plan_id = ?4",
            )
            .bind(order as i64)
            .bind(now)
            .bind(task_id)
            .bind(plan_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StorageError::NotInPlan { plan_id, task_id });
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_task(&self, id: TaskId) -> Result<Task> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::TaskNotFound(id))?;

        row.into_task()
    }
}

fn expect_affected(id: TaskId, result: &SqliteQueryResult) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(StorageError::TaskNotFound(id));
    }
    Ok(())
}

#[async_trait]
impl TaskStore for Storage {
    async fn create_task(&self, new: &NewTask) -> Result<Task> {
        let now = Utc::now().timestamp_millis();
        let labels_json = serde_json::to_string(&new.labels)?;

        let result = sqlx::query(
            r"
            INSERT INTO tasks (title, description, priority, status, labels_json, epic_id,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)
            ",
        )
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.priority.as_i64())
        .bind(labels_json)
        .bind(new.epic_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.fetch_task(result.last_insert_rowid()).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.fetch_task(id).await
    }

    async fn pick_next_pending(&self, filter: &LoopFilter) -> Result<Option<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'pending' AND plan_id IS NULL AND priority >= ?1 \
               AND (?2 IS NULL OR epic_id = ?2) \
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1"
        );
        let min_priority = filter.min_priority.unwrap_or(TaskPriority::Low);
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(min_priority.as_i64())
            .bind(filter.epic_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TaskRow::into_task).transpose()
    }

    async fn set_task_started(&self, id: TaskId) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'in_progress', started_at = ?1, completed_at = NULL, \
             updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_affected(id, &result)
    }

    async fn set_task_git(
        &self,
        id: TaskId,
        branch: Option<&str>,
        pr_url: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tasks SET branch_name = ?1, pr_url = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(branch)
        .bind(pr_url)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_affected(id, &result)
    }

    async fn set_task_waiting(&self, id: TaskId, result: &TaskResult) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let res = sqlx::query(
            "UPDATE tasks SET status = 'waiting_approval', output = ?1, exit_code = ?2, \
             cost_usd = ?3, error = '', updated_at = ?4 WHERE id = ?5",
        )
        .bind(&result.output)
        .bind(result.exit_code)
        .bind(result.cost_usd)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_affected(id, &res)
    }

    async fn set_task_done(&self, id: TaskId, result: Option<&TaskResult>) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let res = match result {
            Some(result) => {
                sqlx::query(
                    "UPDATE tasks SET status = 'done', approval_status = 'approved', \
                     output = ?1, exit_code = ?2, cost_usd = ?3, error = '', \
                     completed_at = ?4, updated_at = ?4 WHERE id = ?5",
                )
                .bind(&result.output)
                .bind(result.exit_code)
                .bind(result.cost_usd)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE tasks SET status = 'done', approval_status = 'approved', \
                     completed_at = ?1, updated_at = ?1 WHERE id = ?2",
                )
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };
        expect_affected(id, &res)
    }

    async fn set_task_failed(
        &self,
        id: TaskId,
        error: &str,
        exit_code: Option<i32>,
        cost_usd: Option<f64>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error = ?1, exit_code = ?2, \
             cost_usd = COALESCE(?3, cost_usd), completed_at = ?4, updated_at = ?4 WHERE id = ?5",
        )
        .bind(error)
        .bind(exit_code)
        .bind(cost_usd)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_affected(id, &result)
    }

    async fn set_task_rejected(&self, id: TaskId, feedback: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', approval_status = 'rejected', \
             rejection_feedback = ?1, branch_name = NULL, pr_url = NULL, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(feedback)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_affected(id, &result)
    }

    async fn increment_retry_count(&self, id: TaskId) -> Result<u32> {
        let now = Utc::now().timestamp_millis();
        let count: Option<(i64,)> = sqlx::query_as(
            "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2 \
             RETURNING retry_count",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|(c,)| c as u32)
            .ok_or(StorageError::TaskNotFound(id))
    }

    async fn reset_stuck_tasks(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', updated_at = ?1 \
             WHERE status IN ('in_progress', 'waiting_approval')",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_log(&self, task_id: TaskId, entry: &LogEntry) -> Result<()> {
        sqlx::query("INSERT INTO task_logs (task_id, ts, level, message) VALUES (?1, ?2, ?3, ?4)")
            .bind(task_id)
            .bind(entry.timestamp.timestamp_millis())
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> Result<Plan> {
        let query = format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = ?1");
        sqlx::query_as::<_, PlanRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PlanRow::into_plan)
            .ok_or(StorageError::PlanNotFound(id))
    }

    async fn set_plan_status(
        &self,
        id: PlanId,
        status: PlanStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE plans SET status = ?1, error = COALESCE(?2, error), updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::PlanNotFound(id));
        }
        Ok(())
    }

    async fn plan_tasks(&self, plan_id: PlanId) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE plan_id = ?1 \
             ORDER BY plan_order ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn replace_plan_tasks(&self, plan_id: PlanId, tasks: &[NewTask]) -> Result<Vec<Task>> {
        let plan = self.get_plan(plan_id).await?;
        let now = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM task_logs WHERE task_id IN \
             (SELECT id FROM tasks WHERE plan_id = ?1 AND status IN ('pending', 'failed'))",
        )
        .bind(plan_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM tasks WHERE plan_id = ?1 AND status IN ('pending', 'failed')")
            .bind(plan_id)
            .execute(&mut *tx)
            .await?;

        for (order, new) in tasks.iter().enumerate() {
            let labels_json = serde_json::to_string(&new.labels)?;
            sqlx::query(
                r"
                INSERT INTO tasks (title, description, priority, status, labels_json, epic_id,
                                   plan_id, plan_order, created_at, updated_at)
                VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?8)
                ",
            )
            .bind(&new.title)
            .bind(&new.description)
            .bind(new.priority.as_i64())
            .bind(labels_json)
            .bind(new.epic_id.or(plan.epic_id))
            .bind(plan_id)
            .bind(order as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.plan_tasks(plan_id).await
    }

    async fn reset_stuck_plans(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE plans SET \
                status = CASE status WHEN 'decomposing' THEN 'draft' ELSE 'failed' END, \
                error = 'interrupted', updated_at = ?1 \
             WHERE status IN ('decomposing', 'approved', 'running')",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    title: String,
    description: String,
    priority: i64,
    status: String,
    labels_json: String,
    epic_id: Option<i64>,
    plan_id: Option<i64>,
    plan_order: Option<i64>,
    retry_count: i64,
    branch_name: Option<String>,
    pr_url: Option<String>,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    output: String,
    error: String,
    exit_code: Option<i32>,
    cost_usd: Option<f64>,
    approval_status: String,
    rejection_feedback: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            title: self.title,
            description: self.description,
            priority: TaskPriority::try_from(self.priority).unwrap_or_default(),
            status: TaskStatus::parse(&self.status).unwrap_or(TaskStatus::Failed),
            labels: serde_json::from_str(&self.labels_json)?,
            epic_id: self.epic_id,
            plan_id: self.plan_id,
            plan_order: self.plan_order,
            retry_count: self.retry_count.max(0) as u32,
            branch_name: self.branch_name,
            pr_url: self.pr_url,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            output: self.output,
            error: self.error,
            exit_code: self.exit_code,
            cost_usd: self.cost_usd,
            approval_status: self.approval_status,
            rejection_feedback: self.rejection_feedback,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: i64,
    title: String,
    goal: String,
    status: String,
    epic_id: Option<i64>,
    error: String,
    created_at: i64,
    updated_at: i64,
}

impl PlanRow {
    fn into_plan(self) -> Plan {
        Plan {
            id: self.id,
            title: self.title,
            goal: self.goal,
            status: PlanStatus::parse(&self.status).unwrap_or_default(),
            epic_id: self.epic_id,
            error: self.error,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EpicRow {
    id: i64,
    title: String,
    description: String,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl EpicRow {
    fn into_epic(self) -> Epic {
        Epic {
            id: self.id,
            title: self.title,
            description: self.description,
            status: EpicStatus::parse(&self.status).unwrap_or_default(),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    task_id: i64,
    ts: i64,
    level: String,
    message: String,
}

impl LogRow {
    fn into_entry(self) -> LogEntry {
        LogEntry {
            index: self.id as u64,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            level: LogLevel::parse(&self.level).unwrap_or(LogLevel::Sys),
            message: self.message,
            task_id: Some(self.task_id),
        }
    }
}
