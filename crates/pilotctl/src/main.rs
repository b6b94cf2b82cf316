//! pilotctl - CLI client for pilotd
//!
//! Queue tasks, drive the agent loop and answer approval requests. Plans
//! and epics have their own subcommand groups.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, ListFilter};
use pilot_core::{
    EpicId, EpicStatus, EpicUpdate, LoopFilter, NewEpic, NewPlan, NewTask, PlanId, PlanStatus,
    PlanUpdate, TaskId, TaskPriority, TaskStatus, TaskUpdate,
};

/// CLI client for the pilotd task daemon.
#[derive(Parser)]
#[command(name = "pilotctl")]
#[command(about = "Control plane for the pilotd task daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:9000)
    #[arg(long, global = true, env = "PILOT_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "PILOT_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a new task
    Add {
        /// Task title
        title: String,

        /// Longer description passed to the agent
        #[arg(short, long, default_value = "")]
        description: String,

        /// Priority: low, medium, high, urgent (or 0-3)
        #[arg(short, long, value_parser = parse_priority, default_value = "medium")]
        priority: TaskPriority,

        /// Label (repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,

        /// Epic id
        #[arg(long)]
        epic: Option<i64>,
    },

    /// List tasks
    List {
        /// Filter by status (pending, in_progress, waiting_approval, done, failed)
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,

        /// Filter by label
        #[arg(long)]
        label: Option<String>,

        /// Filter by epic id
        #[arg(long)]
        epic: Option<i64>,

        /// Only tasks belonging to this plan
        #[arg(long)]
        plan: Option<PlanId>,

        /// Substring of title or description
        #[arg(long)]
        search: Option<String>,
    },

    /// Show detailed information about a task
    Show {
        /// Task id
        id: TaskId,
    },

    /// Edit a task's fields
    Edit {
        /// Task id
        id: TaskId,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, value_parser = parse_priority)]
        priority: Option<TaskPriority>,

        /// Replace labels (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// Delete a task
    Rm {
        /// Task id
        id: TaskId,
    },

    /// Reset a task to pending and clear its previous result
    Retry {
        /// Task id
        id: TaskId,
    },

    /// Run one task now (fails if the agent is busy)
    Run {
        /// Task id
        id: TaskId,
    },

    /// Show the engine status
    Status,

    /// Start the agent loop
    Start {
        /// Only pick tasks at or above this priority
        #[arg(long, value_parser = parse_priority)]
        min_priority: Option<TaskPriority>,

        /// Only pick tasks from this epic
        #[arg(long)]
        epic: Option<i64>,
    },

    /// Stop the agent loop and any running task
    Stop,

    /// Approve the task waiting for approval
    Approve,

    /// Reject the task waiting for approval; it returns to the queue
    Reject {
        /// Feedback for the next attempt
        feedback: String,
    },

    /// Show engine logs
    Logs {
        /// Keep streaming new entries
        #[arg(short, long)]
        follow: bool,

        /// Start from this log index
        #[arg(long, default_value = "0")]
        after: u64,

        /// Show the persisted log of one task instead
        #[arg(long, conflicts_with_all = ["follow", "after"])]
        task: Option<TaskId>,
    },

    /// Print the live output of the running task
    Output,

    /// Break a goal into tasks using the agent
    Decompose {
        /// What to achieve
        goal: String,

        /// Attach created tasks to this epic
        #[arg(long)]
        epic: Option<i64>,
    },

    /// Manage plans: goals decomposed into reviewed, ordered tasks
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },

    /// Manage epics
    Epic {
        #[command(subcommand)]
        command: EpicCommand,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Create a draft plan
    Create {
        /// Plan title
        title: String,

        /// Goal handed to the agent when decomposing
        #[arg(short, long, default_value = "")]
        goal: String,

        /// Epic id
        #[arg(long)]
        epic: Option<EpicId>,
    },

    /// List plans
    List {
        /// Filter by status (draft, decomposing, reviewing, approved, running, completed, failed)
        #[arg(long, value_parser = parse_plan_status)]
        status: Option<PlanStatus>,

        /// Filter by epic id
        #[arg(long)]
        epic: Option<EpicId>,
    },

    /// Show a plan and its tasks
    Show {
        /// Plan id
        id: PlanId,
    },

    /// Edit a plan's title, goal or epic
    Edit {
        /// Plan id
        id: PlanId,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        goal: Option<String>,

        #[arg(long)]
        epic: Option<EpicId>,
    },

    /// Delete a plan and its unstarted tasks
    Rm {
        /// Plan id
        id: PlanId,
    },

    /// Ask the agent to break the plan's goal into tasks
    Decompose {
        /// Plan id
        id: PlanId,
    },

    /// Approve the plan's tasks and start running them in order
    Approve {
        /// Plan id
        id: PlanId,
    },

    /// Stop a running plan after its current task
    Stop {
        /// Plan id
        id: PlanId,
    },

    /// Set the execution order of the plan's tasks
    Reorder {
        /// Plan id
        id: PlanId,

        /// Task ids in their new order
        #[arg(required = true, num_args = 1..)]
        task_ids: Vec<TaskId>,
    },
}

#[derive(Subcommand)]
enum EpicCommand {
    /// Create an epic
    Create {
        /// Epic title
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List epics with their progress
    List {
        /// Filter by status (open, closed)
        #[arg(long, value_parser = parse_epic_status)]
        status: Option<EpicStatus>,
    },

    /// Show an epic with its tasks and plans
    Show {
        /// Epic id
        id: EpicId,
    },

    /// Edit an epic
    Edit {
        /// Epic id
        id: EpicId,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, value_parser = parse_epic_status)]
        status: Option<EpicStatus>,
    },

    /// Delete an epic; its tasks and plans are kept
    Rm {
        /// Epic id
        id: EpicId,
    },
}

fn parse_priority(s: &str) -> Result<TaskPriority, String> {
    TaskPriority::parse(s).ok_or_else(|| {
        format!("invalid priority '{s}', expected: low, medium, high, urgent (or 0-3)")
    })
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(&s.to_ascii_lowercase()).ok_or_else(|| {
        format!("invalid status '{s}', expected: pending, in_progress, waiting_approval, done, failed")
    })
}

fn parse_plan_status(s: &str) -> Result<PlanStatus, String> {
    PlanStatus::parse(&s.to_ascii_lowercase()).ok_or_else(|| format!("invalid plan status '{s}'"))
}

fn parse_epic_status(s: &str) -> Result<EpicStatus, String> {
    EpicStatus::parse(&s.to_ascii_lowercase())
        .ok_or_else(|| format!("invalid epic status '{s}', expected: open, closed"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:9000".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    match client.check_health().await {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("error: daemon at {} is not healthy", client.addr());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Command::Add {
            title,
            description,
            priority,
            labels,
            epic,
        } => {
            let req = NewTask {
                title,
                description,
                priority,
                labels,
                epic_id: epic,
            };
            run_add(&client, &req).await
        }
        Command::List {
            status,
            label,
            epic,
            plan,
            search,
        } => {
            let filter = ListFilter {
                status,
                label: label.as_deref(),
                epic_id: epic,
                plan_id: plan,
                search: search.as_deref(),
            };
            run_list(&client, &filter).await
        }
        Command::Show { id } => run_show(&client, id).await,
        Command::Edit {
            id,
            title,
            description,
            priority,
            labels,
        } => {
            let update = TaskUpdate {
                title,
                description,
                priority,
                labels: (!labels.is_empty()).then_some(labels),
                ..Default::default()
            };
            run_edit(&client, id, &update).await
        }
        Command::Rm { id } => run_rm(&client, id).await,
        Command::Retry { id } => run_retry(&client, id).await,
        Command::Run { id } => run_run(&client, id).await,
        Command::Status => run_status(&client).await,
        Command::Start { min_priority, epic } => {
            let filter = LoopFilter {
                min_priority,
                epic_id: epic,
            };
            run_start(&client, &filter).await
        }
        Command::Stop => run_stop(&client).await,
        Command::Approve => run_approve(&client).await,
        Command::Reject { feedback } => run_reject(&client, &feedback).await,
        Command::Logs {
            follow,
            after,
            task,
        } => run_logs(&client, follow, after, task).await,
        Command::Output => run_output(&client).await,
        Command::Decompose { goal, epic } => run_decompose(&client, &goal, epic).await,
        Command::Plan { command } => run_plan(&client, command).await,
        Command::Epic { command } => run_epic(&client, command).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_add(client: &Client, req: &NewTask) -> Result<(), ClientError> {
    let task = client.create_task(req).await?;
    render::print_task_created(&task);
    Ok(())
}

async fn run_list(client: &Client, filter: &ListFilter<'_>) -> Result<(), ClientError> {
    let tasks = client.list_tasks(filter).await?;
    render::print_task_list(&tasks);
    Ok(())
}

async fn run_show(client: &Client, id: TaskId) -> Result<(), ClientError> {
    let task = client.get_task(id).await?;
    render::print_task_details(&task);
    Ok(())
}

async fn run_edit(client: &Client, id: TaskId, update: &TaskUpdate) -> Result<(), ClientError> {
    let task = client.update_task(id, update).await?;
    println!("Updated task #{}", task.id);
    render::print_task_details(&task);
    Ok(())
}

async fn run_rm(client: &Client, id: TaskId) -> Result<(), ClientError> {
    client.delete_task(id).await?;
    println!("Deleted task #{id}");
    Ok(())
}

async fn run_retry(client: &Client, id: TaskId) -> Result<(), ClientError> {
    let task = client.retry_task(id).await?;
    println!("Task #{} reset to pending", task.id);
    Ok(())
}

async fn run_run(client: &Client, id: TaskId) -> Result<(), ClientError> {
    client.run_task(id).await?;
    println!("Task #{id} started");
    println!("  → follow with: pilotctl logs --follow");
    Ok(())
}

async fn run_status(client: &Client) -> Result<(), ClientError> {
    let status = client.status().await?;
    render::print_status(&status);
    Ok(())
}

async fn run_start(client: &Client, filter: &LoopFilter) -> Result<(), ClientError> {
    if client.start(filter).await? {
        println!("Agent loop started");
    } else {
        println!("Agent loop already running");
    }
    Ok(())
}

async fn run_stop(client: &Client) -> Result<(), ClientError> {
    let status = client.stop().await?;
    println!("Agent loop stopped");
    render::print_status(&status);
    Ok(())
}

async fn run_approve(client: &Client) -> Result<(), ClientError> {
    client.approve().await?;
    println!("Approved");
    Ok(())
}

async fn run_reject(client: &Client, feedback: &str) -> Result<(), ClientError> {
    client.reject(feedback).await?;
    println!("Rejected; task returned to the queue");
    Ok(())
}

async fn run_logs(
    client: &Client,
    follow: bool,
    after: u64,
    task: Option<TaskId>,
) -> Result<(), ClientError> {
    if let Some(id) = task {
        for entry in client.task_logs(id, 500).await? {
            println!("{}", render::format_log_entry(&entry));
        }
        return Ok(());
    }

    client
        .stream_logs(after, follow, |entry| {
            println!("{}", render::format_log_entry(entry));
        })
        .await
}

async fn run_output(client: &Client) -> Result<(), ClientError> {
    let output = client.output().await?;
    match output.task_id {
        Some(id) => println!("Output of task #{id}:"),
        None => println!("No task running; last output:"),
    }
    println!("{}", output.output);
    Ok(())
}

async fn run_decompose(client: &Client, goal: &str, epic: Option<i64>) -> Result<(), ClientError> {
    let tasks = client.decompose(goal, epic).await?;
    println!("Created {} task(s)", tasks.len());
    render::print_task_list(&tasks);
    Ok(())
}

async fn run_plan(client: &Client, command: PlanCommand) -> Result<(), ClientError> {
    match command {
        PlanCommand::Create { title, goal, epic } => {
            let req = NewPlan {
                title,
                goal,
                epic_id: epic,
            };
            let plan = client.create_plan(&req).await?;
            println!("Created plan #{}: {}", plan.id, plan.title);
            println!("  → decompose with: pilotctl plan decompose {}", plan.id);
        }
        PlanCommand::List { status, epic } => {
            let plans = client.list_plans(status, epic).await?;
            render::print_plan_list(&plans);
        }
        PlanCommand::Show { id } => {
            let detail = client.get_plan(id).await?;
            render::print_plan_details(&detail);
        }
        PlanCommand::Edit {
            id,
            title,
            goal,
            epic,
        } => {
            let update = PlanUpdate {
                title,
                goal,
                epic_id: epic,
            };
            let plan = client.update_plan(id, &update).await?;
            println!("Updated plan #{}", plan.id);
        }
        PlanCommand::Rm { id } => {
            client.delete_plan(id).await?;
            println!("Deleted plan #{id}");
        }
        PlanCommand::Decompose { id } => {
            let plan = client.decompose_plan(id).await?;
            println!("Plan #{} is {}", plan.id, plan.status.as_str());
            println!("  → follow with: pilotctl logs --follow");
        }
        PlanCommand::Approve { id } => {
            let plan = client.approve_plan(id).await?;
            println!("Plan #{} approved; its tasks will run in order", plan.id);
        }
        PlanCommand::Stop { id } => {
            let plan = client.stop_plan(id).await?;
            println!("Plan #{} stopped", plan.id);
        }
        PlanCommand::Reorder { id, task_ids } => {
            let detail = client.reorder_plan(id, &task_ids).await?;
            render::print_plan_details(&detail);
        }
    }
    Ok(())
}

async fn run_epic(client: &Client, command: EpicCommand) -> Result<(), ClientError> {
    match command {
        EpicCommand::Create { title, description } => {
            let epic = client.create_epic(&NewEpic { title, description }).await?;
            println!("Created epic #{}: {}", epic.id, epic.title);
        }
        EpicCommand::List { status } => {
            let epics = client.list_epics(status).await?;
            render::print_epic_list(&epics);
        }
        EpicCommand::Show { id } => {
            let detail = client.get_epic(id).await?;
            render::print_epic_details(&detail);
        }
        EpicCommand::Edit {
            id,
            title,
            description,
            status,
        } => {
            let update = EpicUpdate {
                title,
                description,
                status,
            };
            let epic = client.update_epic(id, &update).await?;
            println!("Updated epic #{} ({})", epic.id, epic.status.as_str());
        }
        EpicCommand::Rm { id } => {
            client.delete_epic(id).await?;
            println!("Deleted epic #{id}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_priority_accepts_names_and_numbers() {
        assert_eq!(parse_priority("high").unwrap(), TaskPriority::High);
        assert_eq!(parse_priority("0").unwrap(), TaskPriority::Low);
        assert!(parse_priority("critical").is_err());
    }

    #[test]
    fn parse_status_is_case_insensitive() {
        assert_eq!(parse_status("DONE").unwrap(), TaskStatus::Done);
        assert_eq!(
            parse_status("waiting_approval").unwrap(),
            TaskStatus::WaitingApproval
        );
        assert!(parse_status("paused").is_err());
    }

    #[test]
    fn add_collects_repeated_labels() {
        let cli = Cli::try_parse_from([
            "pilotctl", "add", "Fix login", "-l", "auth", "-l", "bug", "-p", "urgent",
        ])
        .unwrap();
        match cli.command {
            Command::Add {
                title,
                labels,
                priority,
                ..
            } => {
                assert_eq!(title, "Fix login");
                assert_eq!(labels, vec!["auth", "bug"]);
                assert_eq!(priority, TaskPriority::Urgent);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn plan_reorder_takes_task_ids_in_order() {
        let cli = Cli::try_parse_from(["pilotctl", "plan", "reorder", "3", "9", "4", "7"]).unwrap();
        match cli.command {
            Command::Plan {
                command: PlanCommand::Reorder { id, task_ids },
            } => {
                assert_eq!(id, 3);
                assert_eq!(task_ids, vec![9, 4, 7]);
            }
            _ => panic!("expected plan reorder"),
        }

        assert!(Cli::try_parse_from(["pilotctl", "plan", "reorder", "3"]).is_err());
    }

    #[test]
    fn plan_list_filters_by_status_and_epic() {
        let cli = Cli::try_parse_from([
            "pilotctl", "plan", "list", "--status", "Reviewing", "--epic", "2",
        ])
        .unwrap();
        match cli.command {
            Command::Plan {
                command: PlanCommand::List { status, epic },
            } => {
                assert_eq!(status, Some(PlanStatus::Reviewing));
                assert_eq!(epic, Some(2));
            }
            _ => panic!("expected plan list"),
        }

        assert!(Cli::try_parse_from(["pilotctl", "plan", "list", "--status", "paused"]).is_err());
    }

    #[test]
    fn epic_edit_can_close_an_epic() {
        let cli =
            Cli::try_parse_from(["pilotctl", "epic", "edit", "5", "--status", "closed"]).unwrap();
        match cli.command {
            Command::Epic {
                command:
                    EpicCommand::Edit {
                        id, status, title, ..
                    },
            } => {
                assert_eq!(id, 5);
                assert_eq!(status, Some(EpicStatus::Closed));
                assert_eq!(title, None);
            }
            _ => panic!("expected epic edit"),
        }
    }

    #[test]
    fn list_accepts_plan_filter() {
        let cli = Cli::try_parse_from(["pilotctl", "list", "--plan", "8"]).unwrap();
        match cli.command {
            Command::List { plan, .. } => assert_eq!(plan, Some(8)),
            _ => panic!("expected list"),
        }
    }
}
