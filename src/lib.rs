//! OpenAI-compatible HTTP adapter for the Claude Code CLI.
//!
//! Each chat-completions request is translated into one non-interactive CLI
//! invocation; the CLI's line-delimited JSON event stream is synthesized back
//! into OpenAI-shaped responses, streamed or buffered.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::session::SessionStore;

pub mod app;
pub mod dispatch;
pub mod events;
pub mod openai;
pub mod process;
pub mod prompt;
pub mod response;
pub mod session;
pub mod tools;

pub const DEFAULT_PORT: u16 = 3100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path or name of the Claude Code CLI binary.
    pub claude_bin: PathBuf,
    /// Per-request subprocess timeout.
    pub timeout: Duration,
    /// Session-mapping file override; `None` means `$HOME`.
    pub session_file: Option<PathBuf>,
    /// Adds an HTTP trace layer (the `DEBUG` env var in the launcher).
    pub request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            claude_bin: PathBuf::from("claude"),
            timeout: process::DEFAULT_TIMEOUT,
            session_file: None,
            request_logging: false,
        }
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub sessions: SessionStore,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid bind address {host}:{port}")]
    InvalidAddr { host: String, port: u16 },
    #[error("port {port} is already in use; stop the other process or pick another port")]
    AddrInUse { port: u16 },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A running adapter instance: explicit init/teardown, no ambient globals.
pub struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    serve_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
}

impl Server {
    pub async fn start(config: ServerConfig) -> Result<Self, ServeError> {
        let sessions = match &config.session_file {
            Some(path) => SessionStore::at_path(path.clone()),
            None => SessionStore::at_default_path(),
        };
        let state = Arc::new(AppState {
            config: config.clone(),
            sessions,
        });

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|_| ServeError::InvalidAddr {
                host: config.host.clone(),
                port: config.port,
            })?;
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                ServeError::AddrInUse { port: config.port }
            } else {
                ServeError::Bind { addr, source: err }
            }
        })?;
        let addr = listener.local_addr().map_err(|err| ServeError::Bind {
            addr,
            source: err,
        })?;

        let cleanup_task = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(session::CLEANUP_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    state.sessions.cleanup().await;
                }
            })
        };

        let router = app::build_router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(error = %err, "server task failed");
            }
        });

        tracing::info!(addr = %addr, "claude-openai-adapter listening");
        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            serve_task,
            cleanup_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(mut self) {
        self.cleanup_task.abort();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.serve_task.await;
        tracing::info!("claude-openai-adapter stopped");
    }
}

/// Serve until ctrl-c. The launcher's entry point.
pub async fn run_server(config: ServerConfig) -> Result<(), ServeError> {
    let server = Server::start(config).await?;
    let _ = tokio::signal::ctrl_c().await;
    server.stop().await;
    Ok(())
}
