//! Configuration parsing for the task pilot.
//!
//! Reads a YAML file; every key is optional and falls back to its default.
//! Precedence: CLI flags > config file > defaults.

use crate::types::MergeStrategy;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Boilerplate that review bots post on every PR. Comments containing any of
/// these substrings are not treated as actionable.
pub const DEFAULT_REVIEW_SKIP_PATTERNS: &[&str] = &[
    "<!-- walkthrough_start -->",
    "## Walkthrough",
    "Currently processing new changes",
    "review in progress",
    "No actionable comments were generated",
    "Actionable comments posted: 0",
    "auto-generated comment",
    "AI-generated code review",
];

/// Engine and daemon configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Project
    pub target_project: PathBuf,
    /// Files whose contents are prepended to every prompt, relative to the
    /// target project.
    pub context_files: Vec<PathBuf>,
    pub context_max_chars: usize,

    // Agent subprocess
    pub agent_command: String,
    pub agent_model: Option<String>,
    pub agent_max_budget_usd: Option<f64>,
    pub agent_extra_args: Vec<String>,
    /// Environment variables removed before spawning the agent.
    pub scrub_env: Vec<String>,
    pub task_timeout_sec: u64,
    pub max_line_bytes: usize,

    // Loop behavior
    pub auto_approve: bool,
    pub poll_interval_sec: u64,
    pub max_retries: u32,
    pub retry_backoff_sec: u64,

    // Daemon
    pub db_path: PathBuf,
    pub port: u16,
    pub auth_token: Option<String>,

    pub git: GitConfig,
}

/// Branch/PR/review workflow settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub enabled: bool,
    pub branch_prefix: String,
    pub base_branch: String,
    pub remote: String,
    /// GitHub CLI used for pull requests and reviews.
    pub gh_command: String,
    /// Wait for review comments, address them, then merge the PR.
    pub auto_merge: bool,
    pub merge_strategy: MergeStrategy,
    pub review_poll_interval_sec: u64,
    pub review_timeout_sec: u64,
    pub review_grace_sec: u64,
    pub review_followup_wait_sec: u64,
    pub max_review_rounds: u32,
    pub review_skip_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_project: PathBuf::from("."),
            context_files: Vec::new(),
            context_max_chars: 20_000,
            agent_command: "claude".to_string(),
            agent_model: None,
            agent_max_budget_usd: None,
            agent_extra_args: Vec::new(),
            scrub_env: vec!["CLAUDECODE".to_string()],
            task_timeout_sec: 600,
            max_line_bytes: 8 * 1024 * 1024,
            auto_approve: false,
            poll_interval_sec: 5,
            max_retries: 2,
            retry_backoff_sec: 5,
            db_path: PathBuf::from("data/tasks.db"),
            port: 9000,
            auth_token: None,
            git: GitConfig::default(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            branch_prefix: "pilot/".to_string(),
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            gh_command: "gh".to_string(),
            auto_merge: false,
            merge_strategy: MergeStrategy::Squash,
            review_poll_interval_sec: 30,
            review_timeout_sec: 600,
            review_grace_sec: 60,
            review_followup_wait_sec: 120,
            max_review_rounds: 2,
            review_skip_patterns: DEFAULT_REVIEW_SKIP_PATTERNS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        Ok(config)
    }

    /// Load config from a file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse YAML content. An empty document yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_command.trim().is_empty() {
            return Err(invalid("agent_command", "must not be empty"));
        }
        if self.task_timeout_sec == 0 {
            return Err(invalid("task_timeout_sec", "must be greater than zero"));
        }
        if self.max_line_bytes < 1024 {
            return Err(invalid("max_line_bytes", "must be at least 1024"));
        }
        if let Some(budget) = self.agent_max_budget_usd {
            if budget <= 0.0 {
                return Err(invalid("agent_max_budget_usd", "must be positive"));
            }
        }
        if self.git.enabled && self.git.base_branch.trim().is_empty() {
            return Err(invalid("git.base_branch", "must not be empty"));
        }
        if self.git.enabled && self.git.gh_command.trim().is_empty() {
            return Err(invalid("git.gh_command", "must not be empty"));
        }
        Ok(())
    }

    /// Resolve a context file path against the target project.
    pub fn resolve_context_file(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.target_project.join(path)
        }
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.agent_command, "claude");
        assert_eq!(config.task_timeout_sec, 600);
        assert_eq!(config.poll_interval_sec, 5);
        assert_eq!(config.retry_backoff_sec, 5);
        assert_eq!(config.scrub_env, vec!["CLAUDECODE"]);
        assert!(!config.auto_approve);
        assert!(!config.git.enabled);
        assert_eq!(config.git.merge_strategy, MergeStrategy::Squash);
        assert!(!config.git.review_skip_patterns.is_empty());
    }

    #[test]
    fn parse_partial_yaml_keeps_defaults() {
        let yaml = r"
target_project: /srv/app
auto_approve: true
max_retries: 4
git:
  enabled: true
  base_branch: develop
";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.target_project, PathBuf::from("/srv/app"));
        assert!(config.auto_approve);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.agent_command, "claude");
        assert!(config.git.enabled);
        assert_eq!(config.git.base_branch, "develop");
        assert_eq!(config.git.branch_prefix, "pilot/");
        assert_eq!(config.git.gh_command, "gh");
    }

    #[test]
    fn rejects_empty_gh_command_when_git_enabled() {
        let err = Config::from_yaml("git:\n  enabled: true\n  gh_command: \"\"\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "git.gh_command"
        ));

        let config = Config::from_yaml("git:\n  gh_command: \"\"\n").unwrap();
        assert!(!config.git.enabled);
    }

    #[test]
    fn custom_skip_patterns_replace_defaults() {
        let yaml = "git:\n  review_skip_patterns: [\"LGTM bot\"]\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.git.review_skip_patterns, vec!["LGTM bot"]);
    }

    #[test]
    fn empty_document_is_default() {
        let config = Config::from_yaml("   \n").unwrap();
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn rejects_empty_agent_command() {
        let err = Config::from_yaml("agent_command: \"\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "agent_command"));
    }

    #[test]
    fn rejects_zero_timeout() {
        assert!(Config::from_yaml("task_timeout_sec: 0").is_err());
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = Config::from_yaml("max_retries: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn from_file_reads_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "agent_model: sonnet\npoll_interval_sec: 1").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.agent_model.as_deref(), Some("sonnet"));
        assert_eq!(config.poll_interval_sec, 1);
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn relative_context_files_resolve_under_project() {
        let config = Config {
            target_project: PathBuf::from("/srv/app"),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_context_file(Path::new("CLAUDE.md")),
            PathBuf::from("/srv/app/CLAUDE.md")
        );
        assert_eq!(
            config.resolve_context_file(Path::new("/etc/notes.md")),
            PathBuf::from("/etc/notes.md")
        );
    }
}
