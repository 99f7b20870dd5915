//! Subprocess driver for the Claude Code CLI.
//!
//! One instance per request: spawns the CLI in non-interactive stream-json
//! mode, frames stdout into classified [`AgentEvent`]s on an unbounded
//! channel, and owns the timeout and kill semantics. `Closed` is always the
//! last event delivered.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::events::{classify_line, AgentEvent};
use crate::prompt::ModelAlias;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(
        "Claude Code CLI not found at `{bin}`. Install it with \
         `npm install -g @anthropic-ai/claude-code` and make sure it is on PATH."
    )]
    NotInstalled { bin: String },
    #[error("failed to spawn `{bin}`: {source}")]
    Io {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture subprocess {0}")]
    MissingPipe(&'static str),
}

#[derive(Debug, Clone)]
pub struct CliOptions {
    pub model: ModelAlias,
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            model: ModelAlias::Opus,
            session_id: None,
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Handle to one running CLI invocation. Dropping the handle kills the
/// subprocess, which is how client disconnects reap it.
pub struct CliProcess {
    events: mpsc::UnboundedReceiver<AgentEvent>,
    kill_tx: watch::Sender<bool>,
    killed: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl CliProcess {
    /// Spawn the CLI with the fixed non-interactive argument set. The prompt
    /// is passed as an argument vector entry, never through a shell; stdin is
    /// closed at spawn.
    pub fn spawn(bin: &Path, prompt: &str, options: CliOptions) -> Result<Self, SpawnError> {
        let mut command = Command::new(bin);
        command
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--model")
            .arg(options.model.as_str())
            .arg("--no-session-persistence");
        if let Some(session_id) = &options.session_id {
            command.arg("--session-id").arg(session_id);
        }
        command.arg(prompt);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let bin_display = bin.display().to_string();
        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                SpawnError::NotInstalled {
                    bin: bin_display.clone(),
                }
            } else {
                SpawnError::Io {
                    bin: bin_display.clone(),
                    source: err,
                }
            }
        })?;

        let pid = child.id();
        tracing::info!(
            pid = pid,
            model = options.model.as_str(),
            session_id = options.session_id.as_deref().unwrap_or(""),
            "claude process spawned"
        );

        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let killed = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        // Stderr carries CLI diagnostics. Logged, never promoted to errors.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(pid = pid, "claude stderr: {line}");
            }
        });

        {
            let events_tx = events_tx.clone();
            let closed = closed.clone();
            let mut kill_rx = kill_rx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                let _ = events_tx.send(classify_line(trimmed));
                            }
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!(pid = pid, error = %err, "claude stdout read failed");
                                break;
                            }
                        },
                        // A kill request terminates the child and stops
                        // framing; whatever is left in the pipe is dropped.
                        _ = kill_rx.changed() => {
                            let _ = child.start_kill();
                            break;
                        }
                    }
                }

                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(err) => {
                        tracing::warn!(pid = pid, error = %err, "failed to reap claude process");
                        None
                    }
                };
                tracing::info!(pid = pid, code = code, "claude process closed");
                closed.store(true, Ordering::SeqCst);
                let _ = events_tx.send(AgentEvent::Closed { code });
                let _ = done_tx.send(true);
            });
        }

        // Watchdog: a single timer armed at spawn, disarmed at close. On
        // expiry the driver marks itself killed and the later `Closed` is
        // normal cleanup for consumers.
        {
            let events_tx = events_tx.clone();
            let kill_tx = kill_tx.clone();
            let killed = killed.clone();
            let timeout = options.timeout;
            let mut done_rx = done_rx;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!(pid = pid, timeout_secs = timeout.as_secs(), "claude process timed out");
                        killed.store(true, Ordering::SeqCst);
                        let _ = events_tx.send(AgentEvent::Error {
                            message: format!(
                                "Claude CLI produced no result within {}s",
                                timeout.as_secs()
                            ),
                        });
                        let _ = kill_tx.send(true);
                    }
                    _ = done_rx.changed() => {}
                }
            });
        }

        Ok(Self {
            events: events_rx,
            kill_tx,
            killed,
            closed,
            pid,
        })
    }

    /// Next classified event; `None` only after `Closed` has been delivered
    /// and all internal senders are gone.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Idempotent terminate. Safe to call after exit.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(pid = self.pid, "killing claude process");
        let _ = self.kill_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for CliProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill();
        }
    }
}
