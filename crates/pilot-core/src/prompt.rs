//! Prompt and PR-text assembly.
//!
//! Everything here is pure string building; reading context files is the
//! only I/O.

use crate::config::Config;
use crate::types::{ReviewComment, Task};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Maximum length of the slug part of a branch name.
pub const BRANCH_SLUG_MAX: usize = 40;

/// Project context prepended to every task prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectContext {
    pub text: String,
    /// Configured files that could not be read.
    pub missing: Vec<PathBuf>,
    pub truncated: bool,
}

impl ProjectContext {
    /// Read `context_files`, each headed by its path, capped at
    /// `context_max_chars` with a truncation notice.
    pub fn load(config: &Config) -> Self {
        let mut context = Self::default();
        let mut body = String::new();

        for file in &config.context_files {
            let path = config.resolve_context_file(file);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    let _ = write!(body, "### {}\n\n{}\n\n", file.display(), content.trim_end());
                }
                Err(_) => context.missing.push(path),
            }
        }

        if body.chars().count() > config.context_max_chars {
            body = crate::events::truncate_message(&body, config.context_max_chars);
            let _ = write!(
                body,
                "\n\n[... project context truncated to {} characters ...]\n\n",
                config.context_max_chars
            );
            context.truncated = true;
        }

        context.text = body;
        context
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Prompt for one task attempt.
///
/// Layout: optional project context, title, description, and the reviewer's
/// feedback when the task was previously rejected.
pub fn build_task_prompt(task: &Task, context: &ProjectContext) -> String {
    let mut prompt = String::new();

    if !context.is_empty() {
        prompt.push_str("# Project context\n\n");
        prompt.push_str(&context.text);
        prompt.push_str("# Task\n\n");
    }

    prompt.push_str(&task.title);
    if !task.description.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(task.description.trim());
    }

    if !task.rejection_feedback.trim().is_empty() {
        let _ = write!(
            prompt,
            "\n\nA previous attempt was rejected by the reviewer. Address this feedback:\n{}",
            task.rejection_feedback.trim()
        );
    }

    prompt
}

/// Lowercase slug: non-alphanumeric runs collapse to one hyphen, capped at
/// `max_len` and trimmed of hyphens.
pub fn slugify(title: &str, max_len: usize) -> String {
    let collapsed = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let capped: String = collapsed.chars().take(max_len).collect();
    capped.trim_matches('-').to_string()
}

/// `<prefix><id>-<slug>`, or `<prefix><id>` when the title has no usable
/// characters.
pub fn branch_name(prefix: &str, task: &Task) -> String {
    let slug = slugify(&task.title, BRANCH_SLUG_MAX);
    if slug.is_empty() {
        format!("{prefix}{}", task.id)
    } else {
        format!("{prefix}{}-{slug}", task.id)
    }
}

pub fn commit_message(task: &Task) -> String {
    format!("task #{}: {}", task.id, task.title)
}

pub fn pr_title(task: &Task) -> String {
    format!("[#{}] {}", task.id, task.title)
}

/// PR body: description, diff-stat, metadata table and branch name.
pub fn pr_body(task: &Task, diff_stat: &str, branch: &str, cost_usd: Option<f64>) -> String {
    let mut body = String::new();

    body.push_str("## Summary\n\n");
    if task.description.trim().is_empty() {
        body.push_str(&task.title);
    } else {
        body.push_str(task.description.trim());
    }
    body.push_str("\n\n");

    if !diff_stat.trim().is_empty() {
        let _ = write!(body, "## Changes\n\n```\n{}\n```\n\n", diff_stat.trim_end());
    }

    body.push_str("## Task\n\n| Field | Value |\n|---|---|\n");
    let _ = writeln!(body, "| Task | #{} |", task.id);
    let _ = writeln!(body, "| Priority | {} |", task.priority.as_str());
    let labels = if task.labels.is_empty() {
        "-".to_string()
    } else {
        task.labels.join(", ")
    };
    let _ = writeln!(body, "| Labels | {labels} |");
    let epic = task
        .epic_id
        .map_or_else(|| "-".to_string(), |id| format!("#{id}"));
    let _ = writeln!(body, "| Epic | {epic} |");
    let cost = cost_usd.map_or_else(|| "-".to_string(), |c| format!("${c:.4}"));
    let _ = writeln!(body, "| Cost | {cost} |");

    let _ = write!(body, "\nBranch: `{branch}`\n");
    body
}

/// Follow-up prompt asking the agent to address review comments.
pub fn review_followup_prompt(task: &Task, pr_url: &str, comments: &[ReviewComment]) -> String {
    let mut prompt = format!(
        "You previously worked on task #{}: {}\n\
         The pull request {pr_url} received the review comments below.\n\n",
        task.id, task.title
    );

    for (i, comment) in comments.iter().enumerate() {
        let location = match (&comment.path, comment.line) {
            (Some(path), Some(line)) => format!(" ({path}:{line})"),
            (Some(path), None) => format!(" ({path})"),
            _ => String::new(),
        };
        let _ = write!(
            prompt,
            "{}. @{}{location}:\n{}\n\n",
            i + 1,
            comment.author,
            comment.body.trim()
        );
    }

    prompt.push_str(
        "Triage each comment:\n\
         - Fix real bugs and correctness issues.\n\
         - Apply easy nits and style suggestions.\n\
         - Add tests the reviewer says are missing.\n\
         - Ignore questions, praise, and suggestions that conflict with the task.\n\
         Make the changes directly in the working tree. Do not create commits.",
    );
    prompt
}

/// Prompt asking the agent to break a goal into tasks, answered as JSON.
pub fn decompose_prompt(goal: &str, context: &ProjectContext) -> String {
    let mut prompt = String::new();
    if !context.is_empty() {
        prompt.push_str("# Project context\n\n");
        prompt.push_str(&context.text);
    }
    let _ = write!(
        prompt,
        "# Goal\n\n{}\n\n\
         Break this goal into small, independently verifiable tasks. Do not modify any files.\n\
         Reply with a JSON array only, one object per task:\n\
         [{{\"title\": \"...\", \"description\": \"...\", \"priority\": 0-3, \"labels\": [\"...\"]}}]",
        goal.trim()
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskStatus};
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;

    fn create_test_task(title: &str, description: &str) -> Task {
        let now = Utc::now();
        Task {
            id: 42,
            title: title.to_string(),
            description: description.to_string(),
            priority: TaskPriority::High,
            status: TaskStatus::Pending,
            labels: vec!["backend".into(), "api".into()],
            epic_id: Some(7),
            plan_id: None,
            plan_order: None,
            retry_count: 0,
            branch_name: None,
            pr_url: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            output: String::new(),
            error: String::new(),
            exit_code: None,
            cost_usd: None,
            approval_status: String::new(),
            rejection_feedback: String::new(),
        }
    }

    #[test]
    fn prompt_joins_title_and_description() {
        let task = create_test_task("Add login", "Use OAuth.");
        assert_eq!(
            build_task_prompt(&task, &ProjectContext::default()),
            "Add login\n\nUse OAuth."
        );
        let bare = create_test_task("Add login", "");
        assert_eq!(build_task_prompt(&bare, &ProjectContext::default()), "Add login");
    }

    #[test]
    fn prompt_includes_rejection_feedback() {
        let mut task = create_test_task("Add login", "");
        task.rejection_feedback = "missing tests".into();
        let prompt = build_task_prompt(&task, &ProjectContext::default());
        assert!(prompt.starts_with("Add login"));
        assert!(prompt.ends_with("missing tests"));
    }

    #[test]
    fn context_files_are_prepended_with_headers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("NOTES.md"), "Use tabs.\n").unwrap();
        let config = Config {
            target_project: dir.path().to_path_buf(),
            context_files: vec!["NOTES.md".into(), "missing.md".into()],
            ..Default::default()
        };
        let context = ProjectContext::load(&config);
        assert!(context.text.contains("### NOTES.md\n\nUse tabs."));
        assert_eq!(context.missing, vec![dir.path().join("missing.md")]);
        assert!(!context.truncated);

        let prompt = build_task_prompt(&create_test_task("Fix", ""), &context);
        assert!(prompt.starts_with("# Project context"));
        assert!(prompt.ends_with("# Task\n\nFix"));
    }

    #[test]
    fn oversized_context_is_truncated_with_notice() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.md"), "x".repeat(500)).unwrap();
        let config = Config {
            target_project: dir.path().to_path_buf(),
            context_files: vec![Path::new("big.md").to_path_buf()],
            context_max_chars: 100,
            ..Default::default()
        };
        let context = ProjectContext::load(&config);
        assert!(context.truncated);
        assert!(context.text.contains("truncated to 100 characters"));
        assert!(context.text.chars().count() < 200);
    }

    #[test]
    fn slugify_collapses_and_caps() {
        assert_eq!(slugify("Fix Bug #123", 40), "fix-bug-123");
        assert_eq!(slugify("  spaces  ", 40), "spaces");
        assert_eq!(slugify("Add *** new -- thing!", 40), "add-new-thing");
        assert_eq!(slugify("abcdef ghij", 7), "abcdef");
        assert_eq!(slugify("日本語", 40), "");
    }

    #[test]
    fn branch_name_uses_prefix_id_and_slug() {
        let task = create_test_task("Add OAuth login flow", "");
        assert_eq!(branch_name("pilot/", &task), "pilot/42-add-oauth-login-flow");
        let unnamed = create_test_task("???", "");
        assert_eq!(branch_name("pilot/", &unnamed), "pilot/42");
        let long = create_test_task(&"word ".repeat(30), "");
        let name = branch_name("p/", &long);
        assert!(name.len() <= "p/42-".len() + BRANCH_SLUG_MAX);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn pr_body_has_metadata_table() {
        let task = create_test_task("Add login", "Use OAuth.");
        let body = pr_body(&task, " src/auth.rs | 10 ++++\n", "pilot/42-add-login", Some(0.5));
        assert!(body.contains("Use OAuth."));
        assert!(body.contains("src/auth.rs | 10"));
        assert!(body.contains("| Priority | high |"));
        assert!(body.contains("| Labels | backend, api |"));
        assert!(body.contains("| Epic | #7 |"));
        assert!(body.contains("| Cost | $0.5000 |"));
        assert!(body.contains("Branch: `pilot/42-add-login`"));
    }

    #[test]
    fn followup_prompt_lists_comments() {
        let task = create_test_task("Add login", "");
        let comments = vec![
            ReviewComment {
                author: "alice".into(),
                body: "Handle the error here.".into(),
                path: Some("src/auth.rs".into()),
                line: Some(12),
            },
            ReviewComment {
                author: "bob".into(),
                body: "Needs a test.".into(),
                path: None,
                line: None,
            },
        ];
        let prompt = review_followup_prompt(&task, "https://example.test/pr/1", &comments);
        assert!(prompt.contains("1. @alice (src/auth.rs:12):\nHandle the error here."));
        assert!(prompt.contains("2. @bob:\nNeeds a test."));
        assert!(prompt.contains("Ignore questions"));
    }

    #[test]
    fn decompose_prompt_requests_json_array() {
        let prompt = decompose_prompt("Ship v2", &ProjectContext::default());
        assert!(prompt.contains("Ship v2"));
        assert!(prompt.contains("JSON array"));
    }
}
