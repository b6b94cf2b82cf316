//! Branch, pull request and review workflow around a task execution.
//!
//! Every operation shells out to `git` or `gh` with the target project as
//! the working directory. Commands are async so a slow push or `gh` call
//! never blocks the runtime.

use crate::sleep_cancellable;
use pilot_core::prompt::{branch_name, commit_message, pr_body, pr_title};
use pilot_core::{GitConfig, ReviewComment, Task};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("{0}")]
    CommandFailed(String),
    #[error("failed to execute {program}: {source}")]
    Execution {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected gh output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cannot determine PR number from {0}")]
    InvalidPrUrl(String),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Exit code and output of one shell-out.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    /// stdout followed by stderr.
    pub combined: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Git and GitHub operations for one target project.
#[derive(Debug, Clone)]
pub struct GitWorkflow {
    root: PathBuf,
    config: GitConfig,
}

impl GitWorkflow {
    pub fn new(root: impl Into<PathBuf>, config: GitConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        debug!(program, ?args, "running command");
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|source| GitError::Execution {
                program: program.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.trim().is_empty() {
            stdout.clone()
        } else {
            format!("{stdout}{stderr}")
        };
        Ok(CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout,
            combined,
        })
    }

    /// Run a command and fail on non-zero exit.
    async fn require(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = self.exec(program, args).await?;
        if !output.success() {
            return Err(GitError::CommandFailed(format!(
                "{program} {}: {}",
                args.first().copied().unwrap_or_default(),
                output.combined.trim()
            )));
        }
        Ok(output)
    }

    fn gh(&self) -> &str {
        self.config.gh_command.as_str()
    }

    async fn has_remote(&self) -> bool {
        self.exec("git", &["remote", "get-url", self.config.remote.as_str()])
            .await
            .is_ok_and(|o| o.success())
    }

    async fn sync_base(&self) -> Result<()> {
        self.require("git", &["checkout", self.config.base_branch.as_str()])
            .await?;
        if self.has_remote().await {
            let pull = [
                "pull",
                "--ff-only",
                self.config.remote.as_str(),
                self.config.base_branch.as_str(),
            ];
            self.require("git", &pull).await?;
        }
        Ok(())
    }

    /// Check out an up-to-date base and create a fresh task branch.
    ///
    /// A branch left over from an earlier attempt is deleted first.
    pub async fn prepare_branch(&self, task: &Task) -> Result<String> {
        let branch = branch_name(&self.config.branch_prefix, task);
        self.sync_base().await?;

        let _ = self.exec("git", &["branch", "-D", branch.as_str()]).await?;
        self.require("git", &["checkout", "-b", branch.as_str()]).await?;

        info!(task_id = task.id, branch = %branch, "created task branch");
        Ok(branch)
    }

    /// Stage everything and, if anything changed, commit and push it.
    ///
    /// Returns the diff-stat, or `None` when the tree was unchanged.
    pub async fn commit_and_push(
        &self,
        task: &Task,
        branch: &str,
        message: Option<&str>,
    ) -> Result<Option<String>> {
        self.require("git", &["add", "-A"]).await?;

        let diff = self.exec("git", &["diff", "--cached", "--quiet"]).await?;
        if diff.success() {
            info!(task_id = task.id, "no changes to commit");
            return Ok(None);
        }

        let stat = self
            .require("git", &["diff", "--cached", "--stat"])
            .await?
            .stdout;
        let message = message.map_or_else(|| commit_message(task), str::to_string);
        self.require("git", &["commit", "-m", message.as_str()]).await?;
        self.require("git", &["push", "-u", self.config.remote.as_str(), branch])
            .await?;

        info!(task_id = task.id, branch = %branch, "pushed task branch");
        Ok(Some(stat))
    }

    /// Open a pull request and return its URL.
    pub async fn create_pr(
        &self,
        task: &Task,
        branch: &str,
        diff_stat: &str,
        cost_usd: Option<f64>,
    ) -> Result<String> {
        let title = pr_title(task);
        let body = pr_body(task, diff_stat, branch, cost_usd);
        let output = self
            .require(
                self.gh(),
                &[
                    "pr",
                    "create",
                    "--base",
                    self.config.base_branch.as_str(),
                    "--head",
                    branch,
                    "--title",
                    title.as_str(),
                    "--body",
                    body.as_str(),
                ],
            )
            .await?;

        let url = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();
        info!(task_id = task.id, pr_url = %url, "opened pull request");
        Ok(url)
    }

    /// Inline comments and review summaries, minus bot boilerplate.
    pub async fn fetch_review_comments(&self, pr: u64) -> Result<Vec<ReviewComment>> {
        let endpoint = format!("repos/{{owner}}/{{repo}}/pulls/{pr}/comments");
        let inline = self.require(self.gh(), &["api", endpoint.as_str()]).await?;
        let mut comments = parse_inline_comments(&inline.stdout)?;

        let pr_arg = pr.to_string();
        let reviews = self
            .require(self.gh(), &["pr", "view", pr_arg.as_str(), "--json", "reviews"])
            .await?;
        comments.extend(parse_review_summaries(&reviews.stdout)?);

        Ok(filter_actionable(comments, &self.config.review_skip_patterns))
    }

    /// Poll for review comments until some arrive or the budget runs out.
    ///
    /// On the first actionable result, waits the grace period and fetches
    /// once more so late comments from the same review are included.
    pub async fn wait_for_review(
        &self,
        pr: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReviewComment>> {
        let poll = Duration::from_secs(self.config.review_poll_interval_sec.max(1));
        let budget = Duration::from_secs(self.config.review_timeout_sec);
        let started = Instant::now();

        loop {
            match self.fetch_review_comments(pr).await {
                Ok(comments) if !comments.is_empty() => {
                    info!(pr, count = comments.len(), "review comments received");
                    let grace = Duration::from_secs(self.config.review_grace_sec);
                    if !sleep_cancellable(grace, cancel).await {
                        return Err(GitError::Cancelled);
                    }
                    return match self.fetch_review_comments(pr).await {
                        Ok(again) if again.len() >= comments.len() => Ok(again),
                        Ok(_) => Ok(comments),
                        Err(err) => {
                            warn!(pr, error = %err, "re-fetch of review comments failed");
                            Ok(comments)
                        }
                    };
                }
                Ok(_) => {}
                Err(err) => warn!(pr, error = %err, "failed to fetch review comments"),
            }

            if started.elapsed() + poll > budget {
                let waited_sec = started.elapsed().as_secs();
                info!(pr, waited_sec, "no review comments within budget");
                return Ok(Vec::new());
            }
            if !sleep_cancellable(poll, cancel).await {
                return Err(GitError::Cancelled);
            }
        }
    }

    /// Merge the PR on GitHub and bring the local base up to date.
    pub async fn merge_pr(&self, pr: u64) -> Result<()> {
        let pr_arg = pr.to_string();
        self.require(
            self.gh(),
            &[
                "pr",
                "merge",
                pr_arg.as_str(),
                self.config.merge_strategy.flag(),
                "--delete-branch",
            ],
        )
        .await?;
        self.sync_base().await?;
        info!(pr, "merged pull request");
        Ok(())
    }

    /// Discard local changes, including untracked files, and delete the task
    /// branch. Best effort.
    pub async fn cleanup_branch(&self, branch: &str) {
        let steps: [&[&str]; 4] = [
            &["reset", "--hard"],
            &["clean", "-fd"],
            &["checkout", self.config.base_branch.as_str()],
            &["branch", "-D", branch],
        ];
        for args in steps {
            match self.exec("git", args).await {
                Ok(output) if !output.success() => {
                    let output = output.combined.trim();
                    warn!(branch, ?args, output, "git cleanup step failed");
                }
                Err(err) => warn!(branch, ?args, error = %err, "git cleanup step failed"),
                Ok(_) => {}
            }
        }
    }
}

/// Trailing number of a PR URL such as `https://github.com/o/r/pull/12`.
pub fn pr_number(url: &str) -> Result<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| GitError::InvalidPrUrl(url.to_string()))
}

/// Comments in `latest` that are not in `seen`, compared by author,
/// location and body. Duplicates are matched one to one.
pub fn unseen_comments(seen: &[ReviewComment], latest: &[ReviewComment]) -> Vec<ReviewComment> {
    let mut remaining: Vec<&ReviewComment> = seen.iter().collect();
    latest
        .iter()
        .filter(|comment| {
            let matched = remaining.iter().position(|s| *s == *comment);
            if let Some(pos) = matched {
                remaining.swap_remove(pos);
            }
            matched.is_none()
        })
        .cloned()
        .collect()
}

/// Drop empty bodies and bodies matching any skip pattern.
pub fn filter_actionable(
    comments: Vec<ReviewComment>,
    skip_patterns: &[String],
) -> Vec<ReviewComment> {
    comments
        .into_iter()
        .filter(|c| !c.body.trim().is_empty())
        .filter(|c| !skip_patterns.iter().any(|p| c.body.contains(p.as_str())))
        .collect()
}

#[derive(Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Deserialize)]
struct GhInlineComment {
    user: Option<GhUser>,
    #[serde(default)]
    body: String,
    path: Option<String>,
    line: Option<u64>,
}

#[derive(Deserialize)]
struct GhReviews {
    #[serde(default)]
    reviews: Vec<GhReview>,
}

#[derive(Deserialize)]
struct GhReview {
    author: Option<GhUser>,
    #[serde(default)]
    body: String,
}

fn login(user: Option<GhUser>) -> String {
    user.map_or_else(|| "unknown".to_string(), |u| u.login)
}

fn parse_inline_comments(json: &str) -> Result<Vec<ReviewComment>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<GhInlineComment> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|c| ReviewComment {
            author: login(c.user),
            body: c.body,
            path: c.path,
            line: c.line,
        })
        .collect())
}

fn parse_review_summaries(json: &str) -> Result<Vec<ReviewComment>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: GhReviews = serde_json::from_str(json)?;
    Ok(raw
        .reviews
        .into_iter()
        .map(|r| ReviewComment {
            author: login(r.author),
            body: r.body,
            path: None,
            line: None,
        })
        .collect())
}
