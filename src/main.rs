#![forbid(unsafe_code)]

//! `mcp-sse-client`: command-line driver for the MCP/SSE client transport.
//!
//! Connects to the configured server, performs the initialize handshake,
//! then runs one subcommand. Results are printed to stdout as JSON; logs go
//! to stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_sse_client::jsonrpc::Message;
use mcp_sse_client::{AppError, McpClient, Result, TransportConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-sse-client", about = "MCP client over HTTP/SSE", version, long_about = None)]
struct Cli {
    /// Path to the TOML transport configuration.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call a method and print its result.
    Call {
        /// JSON-RPC method name (e.g. `tools/list`).
        method: String,
        /// Parameters as a JSON document.
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Send `ping` and report success.
    Ping,
    /// Print server notifications until interrupted.
    Listen,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = TransportConfig::load_from_path(&args.config)?;
    info!(base_url = %config.base_url, "configuration loaded");

    let (client, mut notifications) = McpClient::connect(config)?;
    let client = &client;

    let outcome = async move {
        client
            .initialize(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
            .await?;

        match args.command {
            Command::Call { method, params } => {
                drop(notifications);
                let params: Value = serde_json::from_str(&params)?;
                let result = client.call(&method, params).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Command::Ping => {
                drop(notifications);
                client.ping().await?;
                println!("pong");
            }
            Command::Listen => {
                let shutdown = shutdown_signal();
                tokio::pin!(shutdown);
                loop {
                    tokio::select! {
                        () = &mut shutdown => break,
                        message = notifications.recv() => match message {
                            Some(message) => print_message(&message)?,
                            None => break,
                        },
                    }
                }
            }
        }
        Ok::<(), AppError>(())
    }
    .await;

    client.stop().await;

    if let Err(ref err) = outcome {
        error!(%err, "command failed");
    }
    outcome
}

fn print_message(message: &Message) -> Result<()> {
    let wire = mcp_sse_client::jsonrpc::encode(message)?;
    println!("{wire}");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "ctrl-c signal handler failed");
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
