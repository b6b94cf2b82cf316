//! Runner module for executing the coding agent as a subprocess.
//!
//! Key responsibilities:
//! - Spawn the agent CLI with the stream-json output format
//! - Feed the prompt on stdin, then close it
//! - Merge stdout and stderr into one ordered line stream
//! - Decode each line into an [`AgentEvent`] and hand it to the caller
//! - Enforce a wall-clock timeout, a per-line size limit and cancellation
//!
//! A non-zero exit is not an error here: it is returned in [`RunOutput`] so
//! the caller can apply its retry policy.

use pilot_core::events::{parse_line, AgentEvent};
use pilot_core::{Config, TaskId};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while the agent is quiet.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Lines buffered between the pipe readers and the event loop.
const LINE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent command not found: {0}")]
    BinaryNotFound(String),
    #[error("agent timed out after {timeout_sec} seconds")]
    Timeout {
        timeout_sec: u64,
        /// Cost reported before the timeout, if any.
        cost_usd: Option<f64>,
    },
    #[error("agent output line exceeded {max_line_bytes} bytes")]
    StreamOverflow { max_line_bytes: usize },
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Result of one agent invocation that ran to exit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub exit_code: i32,
    /// Text fragments joined with newlines.
    pub output: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub command: String,
    pub model: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub extra_args: Vec<String>,
    /// Environment variables removed from the child's environment.
    pub scrub_env: Vec<String>,
    pub timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.agent_command.clone(),
            model: config.agent_model.clone(),
            max_budget_usd: config.agent_max_budget_usd,
            extra_args: config.agent_extra_args.clone(),
            scrub_env: config.scrub_env.clone(),
            timeout: Duration::from_secs(config.task_timeout_sec),
            max_line_bytes: config.max_line_bytes,
        }
    }
}

/// One unit from a pipe reader.
#[derive(Debug)]
enum StreamLine {
    Line(Vec<u8>),
    Overflow,
}

/// How the read loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    Overflow,
}

/// Runner for the agent CLI.
#[derive(Debug)]
pub struct Runner {
    config: RunnerConfig,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Arguments passed to the agent command.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(budget) = self.config.max_budget_usd {
            args.push("--max-budget-usd".to_string());
            args.push(budget.to_string());
        }
        args.push("--dangerously-skip-permissions".to_string());
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Run the agent once with `prompt` in `working_dir`.
    ///
    /// `on_event` is called for every decoded line, in arrival order.
    pub async fn run<F>(
        &self,
        prompt: &str,
        working_dir: &Path,
        task_id: Option<TaskId>,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<RunOutput>
    where
        F: FnMut(&AgentEvent) + Send,
    {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.build_args())
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in &self.config.scrub_env {
            cmd.env_remove(var);
        }

        info!(
            task_id,
            command = %self.config.command,
            working_dir = %working_dir.display(),
            "spawning agent process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::BinaryNotFound(self.config.command.clone())
            } else {
                RunnerError::Io(e)
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&prompt).await {
                    debug!(error = %err, "agent closed stdin early");
                }
                // stdin drops here, closing the pipe.
            });
        }

        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let max_line_bytes = self.config.max_line_bytes;
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, max_line_bytes, tx.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, max_line_bytes, tx.clone(), "stderr"));
        }
        drop(tx);

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        let mut fragments: Vec<String> = Vec::new();
        let mut cost_usd: Option<f64> = None;
        let mut streams_open = true;

        let outcome = loop {
            tokio::select! {
                line = rx.recv(), if streams_open => match line {
                    Some(StreamLine::Line(bytes)) => {
                        if let Some(event) = parse_line(&bytes) {
                            fragments.extend(
                                event.output_fragments().into_iter().map(String::from),
                            );
                            if let Some(cost) = event.cost_usd() {
                                cost_usd = Some(cost);
                            }
                            on_event(&event);
                        }
                    }
                    Some(StreamLine::Overflow) => break ProcessOutcome::Overflow,
                    None => streams_open = false,
                },
                status = child.wait(), if !streams_open => {
                    break ProcessOutcome::Completed(status?);
                }
                () = cancel.cancelled() => break ProcessOutcome::Cancelled,
                () = tokio::time::sleep_until(deadline) => break ProcessOutcome::TimedOut,
                _ = heartbeat.tick() => {
                    info!(
                        task_id,
                        elapsed_sec = started.elapsed().as_secs(),
                        timeout_sec = self.config.timeout.as_secs(),
                        "agent still running"
                    );
                }
            }
        };

        if !matches!(outcome, ProcessOutcome::Completed(_)) {
            kill_child(&mut child, task_id).await;
        }
        for reader in readers {
            reader.abort();
        }

        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            ProcessOutcome::Completed(status) => {
                let exit_code = status.code().unwrap_or(-1);
                info!(task_id, exit_code, duration_ms, "agent process exited");
                Ok(RunOutput {
                    exit_code,
                    output: fragments.join("\n"),
                    cost_usd,
                    duration_ms,
                })
            }
            ProcessOutcome::TimedOut => {
                warn!(
                    task_id,
                    timeout_sec = self.config.timeout.as_secs(),
                    "agent timed out; killed"
                );
                Err(RunnerError::Timeout {
                    timeout_sec: self.config.timeout.as_secs(),
                    cost_usd,
                })
            }
            ProcessOutcome::Cancelled => {
                info!(task_id, duration_ms, "agent cancelled; killed");
                Err(RunnerError::Cancelled)
            }
            ProcessOutcome::Overflow => {
                warn!(task_id, max_line_bytes, "agent output line too long; killed");
                Err(RunnerError::StreamOverflow { max_line_bytes })
            }
        }
    }
}

async fn kill_child(child: &mut Child, task_id: Option<TaskId>) {
    if let Err(err) = child.kill().await {
        warn!(task_id, error = %err, "failed to kill agent process");
    }
    let _ = child.wait().await;
}

fn spawn_reader<R>(
    reader: R,
    max_line_bytes: usize,
    tx: mpsc::Sender<StreamLine>,
    stream: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = read_lines(reader, max_line_bytes, &tx).await {
            debug!(stream, error = %err, "agent pipe read failed");
        }
    })
}

/// Split `reader` into lines of at most `max_line_bytes`.
///
/// On an oversized line an [`StreamLine::Overflow`] is sent and the rest of
/// the stream is drained so the writer never blocks on a full pipe.
async fn read_lines<R: AsyncRead + Unpin>(
    reader: R,
    max_line_bytes: usize,
    tx: &mpsc::Sender<StreamLine>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(8192);

    loop {
        let (complete, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if !line.is_empty() {
                    let _ = tx.send(StreamLine::Line(line)).await;
                }
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if line.len() > max_line_bytes {
            let _ = tx.send(StreamLine::Overflow).await;
            tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
            return Ok(());
        }

        if complete && tx.send(StreamLine::Line(std::mem::take(&mut line))).await.is_err() {
            // Event loop has gone away.
            return Ok(());
        }
    }
}
