#![forbid(unsafe_code)]

//! `acp-harness`: drive an ACP agent over stdio and report what it does.
//!
//! Loads configuration (file plus command-line overrides), performs one
//! run, and prints the report on stdout. Tracing goes to stderr.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use acp_harness::acp::prompt::PromptShape;
use acp_harness::mode::RunMode;
use acp_harness::{AppError, Harness, HarnessConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-harness", about = "Drive an ACP agent over stdio JSON-RPC", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent program; overrides `agent.program`.
    #[arg(long)]
    agent: Option<PathBuf>,

    /// Agent argument (repeatable); replaces `agent.args`.
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Working directory for the agent and `session/new`.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Prompt text (repeatable); replaces `prompts`.
    #[arg(long = "prompt")]
    prompts: Vec<String>,

    /// Prompt submission strategy.
    #[arg(long, value_enum)]
    mode: Option<RunMode>,

    /// Payload shape of sequential prompts.
    #[arg(long, value_enum)]
    shape: Option<PromptShape>,

    /// Lines read per request before giving up.
    #[arg(long)]
    max_messages: Option<usize>,

    /// Maximum wait for one line of agent output, in milliseconds.
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Merge the config file (if any) with command-line overrides and
    /// validate the result.
    fn into_config(self) -> Result<(HarnessConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::read_from_path(path)?,
            None => HarnessConfig::for_program(PathBuf::new()),
        };

        if let Some(program) = self.agent {
            config.agent.program = program;
        }
        if !self.agent_args.is_empty() {
            config.agent.args = self.agent_args;
        }
        if let Some(cwd) = self.cwd {
            config.agent.cwd = cwd;
        }
        if !self.prompts.is_empty() {
            config.prompts = self.prompts;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(shape) = self.shape {
            config.prompt_shape = shape;
        }
        if let Some(max) = self.max_messages {
            config.collect.max_messages = max;
        }
        if let Some(ms) = self.read_timeout_ms {
            config.timeouts.read_ms = ms;
        }

        config.validate()?;
        Ok((config, self.json))
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    let (config, json) = args.into_config()?;
    info!(agent = %config.agent.program.display(), mode = %config.mode, "acp-harness starting");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(config, json))
}

async fn run(config: HarnessConfig, json: bool) -> Result<()> {
    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, cancelling run");
        signal_ct.cancel();
    });

    let report = Harness::new(config).run(&ct).await;
    signal_handle.abort();
    let report = report?;

    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{report}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
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
