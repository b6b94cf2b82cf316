//! pilotd - task pilot daemon
//!
//! Library components for the daemon process: the task store, the agent
//! runner, the execution engine and the HTTP control plane.

pub mod agent;
pub mod gate;
pub mod git;
pub mod lock;
pub mod logs;
pub mod runner;
pub mod server;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent::Agent;
use logs::{LogSink, LOG_CAPACITY};
use pilot_core::config::ConfigError;
use pilot_core::Config;
use storage::{Storage, StorageError, TaskStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Environment variable that overrides `auth_token` from the config file.
pub const AUTH_TOKEN_ENV: &str = "PILOT_AUTH_TOKEN";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

/// Config file used when none is given: `./config.yaml` if present, else
/// `<config dir>/pilot/config.yaml`.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("config.yaml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("pilot").join("config.yaml"))
        .unwrap_or(local)
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    agent: Arc<Agent>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Open the store, recover interrupted tasks and build the engine.
    pub async fn new(mut config: Config) -> Result<Self> {
        config.validate()?;
        if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
            if !token.is_empty() {
                config.auth_token = Some(token);
            }
        }

        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let reset = storage.reset_stuck_tasks().await?;
        if reset > 0 {
            info!(count = reset, "reset interrupted tasks to pending");
        }
        let plans = storage.reset_stuck_plans().await?;
        if plans > 0 {
            info!(count = plans, "marked interrupted plans");
        }

        let store = Arc::clone(&storage) as Arc<dyn TaskStore>;
        let logs = Arc::new(LogSink::with_store(LOG_CAPACITY, Arc::clone(&store)));
        let agent = Arc::new(Agent::new(config.clone(), store, logs));

        Ok(Self {
            config,
            storage,
            agent,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Serve the control plane until [`Daemon::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(port = self.config.port, "pilotd starting");
        info!(db = %self.config.db_path.display(), "database");
        info!(
            target_project = %self.config.target_project.display(),
            auto_approve = self.config.auto_approve,
            git = self.config.git.enabled,
            "engine configured"
        );
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let state = Arc::new(server::AppState {
            storage: Arc::clone(&self.storage),
            agent: Arc::clone(&self.agent),
            auth_token: self.config.auth_token.clone(),
        });
        server::start_server(state, self.config.port, self.shutdown.clone()).await?;
        Ok(())
    }

    /// Stop the engine and the HTTP server.
    pub async fn shutdown(&self) {
        info!("shutdown requested");
        self.agent.stop_loop().await;
        self.shutdown.cancel();
        if self.agent.is_busy() {
            warn!("execution still holds the lock at shutdown");
        }
    }
}
