//! Output rendering for pilotctl.
//!
//! Formats tasks, plans, epics, engine status and log lines for terminal
//! display.

use crate::client::StatusResponse;
use pilot_core::{EpicDetail, EpicStats, EpicSummary, LogEntry, Plan, PlanDetail, Task, TaskStatus};

/// Print confirmation after creating a task.
pub fn print_task_created(task: &Task) {
    println!("Created task #{}: {}", task.id, task.title);
    println!("  Priority: {}", task.priority.as_str());
    if !task.labels.is_empty() {
        println!("  Labels:   {}", task.labels.join(", "));
    }
    if let Some(epic) = task.epic_id {
        println!("  Epic:     #{epic}");
    }
}

/// Print a list of tasks in tabular format.
pub fn print_task_list(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!(
        "{:<6}  {:<40}  {:<8}  {:<16}  {:<20}",
        "ID", "TITLE", "PRIORITY", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(98));

    for task in tasks {
        println!(
            "{:<6}  {:<40}  {:<8}  {:<16}  {:<20}",
            task.id,
            truncate(&task.title, 40),
            task.priority.as_str(),
            format_status(task.status),
            format_time(&task.created_at),
        );
    }

    println!();
    println!("{} task(s)", tasks.len());
}

/// Print detailed information about a task.
pub fn print_task_details(task: &Task) {
    println!("Task #{}: {}", task.id, task.title);
    println!();
    println!("  Status:      {}", format_status(task.status));
    println!("  Priority:    {}", task.priority.as_str());
    if !task.labels.is_empty() {
        println!("  Labels:      {}", task.labels.join(", "));
    }
    if let Some(epic) = task.epic_id {
        println!("  Epic:        #{epic}");
    }
    println!("  Retries:     {}", task.retry_count);
    if let Some(code) = task.exit_code {
        println!("  Exit code:   {code}");
    }
    if let Some(cost) = task.cost_usd {
        println!("  Cost:        ${cost:.4}");
    }
    if let Some(branch) = &task.branch_name {
        println!("  Branch:      {branch}");
    }
    if let Some(pr) = &task.pr_url {
        println!("  PR:          {pr}");
    }
    if !task.approval_status.is_empty() {
        println!("  Approval:    {}", task.approval_status);
    }

    println!();
    println!("  Created:     {}", format_time(&task.created_at));
    if let Some(started) = &task.started_at {
        println!("  Started:     {}", format_time(started));
    }
    if let Some(completed) = &task.completed_at {
        println!("  Completed:   {}", format_time(completed));
    }

    if !task.description.is_empty() {
        println!();
        println!("  Description:");
        print_indented(&task.description);
    }
    if !task.rejection_feedback.is_empty() {
        println!();
        println!("  Reviewer feedback:");
        print_indented(&task.rejection_feedback);
    }
    if !task.error.is_empty() {
        println!();
        println!("  Error:");
        print_indented(&task.error);
    }
    if !task.output.is_empty() {
        println!();
        println!("  Output:");
        print_indented(&task.output);
    }
}

pub fn print_plan_list(plans: &[Plan]) {
    if plans.is_empty() {
        println!("No plans found.");
        return;
    }

    println!("{:<6}  {:<40}  {:<12}  {:<6}  {:<20}", "ID", "TITLE", "STATUS", "EPIC", "CREATED");
    println!("{}", "-".repeat(92));

    for plan in plans {
        println!(
            "{:<6}  {:<40}  {:<12}  {:<6}  {:<20}",
            plan.id,
            truncate(&plan.title, 40),
            plan.status.as_str(),
            plan.epic_id.map(|id| format!("#{id}")).unwrap_or_default(),
            format_time(&plan.created_at),
        );
    }

    println!();
    println!("{} plan(s)", plans.len());
}

/// Print a plan and its tasks in execution order.
pub fn print_plan_details(detail: &PlanDetail) {
    let plan = &detail.plan;
    println!("Plan #{}: {}", plan.id, plan.title);
    println!();
    println!("  Status:      {}", plan.status.as_str());
    if let Some(epic) = plan.epic_id {
        println!("  Epic:        #{epic}");
    }
    println!("  Created:     {}", format_time(&plan.created_at));
    println!("  Updated:     {}", format_time(&plan.updated_at));
    if !plan.goal.is_empty() {
        println!();
        println!("  Goal:");
        print_indented(&plan.goal);
    }
    if !plan.error.is_empty() {
        println!();
        println!("  Error:");
        print_indented(&plan.error);
    }

    println!();
    if detail.tasks.is_empty() {
        println!("  No tasks yet.");
        return;
    }
    println!("  Tasks:");
    for (position, task) in detail.tasks.iter().enumerate() {
        println!("{}", format_plan_step(position, task));
    }
}

pub fn print_epic_list(epics: &[EpicSummary]) {
    if epics.is_empty() {
        println!("No epics found.");
        return;
    }

    println!("{:<6}  {:<40}  {:<8}  {:<20}", "ID", "TITLE", "STATUS", "PROGRESS");
    println!("{}", "-".repeat(80));

    for summary in epics {
        println!(
            "{:<6}  {:<40}  {:<8}  {:<20}",
            summary.epic.id,
            truncate(&summary.epic.title, 40),
            summary.epic.status.as_str(),
            format_progress(&summary.stats),
        );
    }

    println!();
    println!("{} epic(s)", epics.len());
}

pub fn print_epic_details(detail: &EpicDetail) {
    let epic = &detail.epic;
    println!("Epic #{}: {}", epic.id, epic.title);
    println!();
    println!("  Status:      {}", epic.status.as_str());
    println!("  Progress:    {}", format_progress(&detail.stats));
    let stats = &detail.stats;
    println!(
        "  Breakdown:   {} pending, {} in progress, {} waiting, {} failed",
        stats.pending, stats.in_progress, stats.waiting_approval, stats.failed
    );
    println!("  Created:     {}", format_time(&epic.created_at));
    if !epic.description.is_empty() {
        println!();
        println!("  Description:");
        print_indented(&epic.description);
    }

    if !detail.plans.is_empty() {
        println!();
        println!("  Plans:");
        for plan in &detail.plans {
            println!("    #{} {} ({})", plan.id, plan.title, plan.status.as_str());
        }
    }
    if !detail.tasks.is_empty() {
        println!();
        println!("  Tasks:");
        for task in &detail.tasks {
            println!("    #{} {} ({})", task.id, task.title, format_status(task.status));
        }
    }
}

pub fn print_status(status: &StatusResponse) {
    let s = &status.status;
    println!("State:      {}", s.state.as_str());
    println!("Loop:       {}", if s.loop_running { "running" } else { "stopped" });
    match (s.current_task_id, &s.current_task_title) {
        (Some(id), Some(title)) => println!("Task:       #{id} {title}"),
        (Some(id), None) => println!("Task:       #{id}"),
        _ => println!("Task:       -"),
    }
    println!("Completed:  {}", s.tasks_completed);
    println!("Failed:     {}", s.tasks_failed);
    if status.busy && !s.loop_running {
        println!("Busy:       a single task run is in progress");
    }
}

/// One log line: `HH:MM:SS LEVEL  [#id] message`.
pub fn format_log_entry(entry: &LogEntry) -> String {
    let task = entry
        .task_id
        .map(|id| format!("[#{id}] "))
        .unwrap_or_default();
    format!(
        "{} {:<6} {}{}",
        entry.timestamp.format("%H:%M:%S"),
        entry.level.as_str(),
        task,
        entry.message
    )
}

/// `done/total done (N%)`.
fn format_progress(stats: &EpicStats) -> String {
    format!("{}/{} done ({}%)", stats.done, stats.total, stats.percent_done())
}

fn format_plan_step(position: usize, task: &Task) -> String {
    format!(
        "    {:>2}. [{}] #{} {}",
        position + 1,
        format_status(task.status),
        task.id,
        task.title
    )
}

fn print_indented(text: &str) {
    for line in text.lines() {
        println!("    {line}");
    }
}

fn format_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "PENDING",
        TaskStatus::InProgress => "IN_PROGRESS",
        TaskStatus::WaitingApproval => "WAITING_APPROVAL",
        TaskStatus::Done => "DONE",
        TaskStatus::Failed => "FAILED",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars - 3).collect();
        format!("{head}...")
    }
}
