use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use claude_openai_adapter::{run_server, ServerConfig, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "claude-openai-adapter")]
#[command(about = "OpenAI-compatible HTTP adapter for the Claude Code CLI", version)]
struct Cli {
    /// Bind address; loopback unless you know what you are doing.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Claude Code CLI binary.
    #[arg(long, default_value = "claude")]
    claude_bin: PathBuf,

    /// Per-request subprocess timeout in seconds.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    let debug = std::env::var("DEBUG").is_ok_and(|value| !value.is_empty() && value != "0");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" })
            }),
        )
        .compact()
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        claude_bin: cli.claude_bin,
        timeout: Duration::from_secs(cli.timeout_secs),
        session_file: None,
        request_logging: debug,
    };

    if let Err(err) = run_server(config).await {
        tracing::error!(error = %err, "claude-openai-adapter failed");
        std::process::exit(1);
    }
}
