//! Harness configuration parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::acp::client::{ClientCapabilities, ClientInfo, ClientOptions, FsCapabilities, InitializeParams};
use crate::acp::collector::CollectLimits;
use crate::acp::process::{SpawnConfig, TeardownPolicy, TerminationPolicy, DEFAULT_STDERR_LIMIT};
use crate::acp::prompt::PromptShape;
use crate::mode::RunMode;
use crate::{AppError, Result};

/// How to launch the agent under test.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent executable. Required, either here or via `--agent`.
    #[serde(default)]
    pub program: PathBuf,
    /// Arguments selecting protocol mode.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Working directory of the agent and of `session/new`.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Extra environment variables for the agent.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Stderr bytes kept for the report; the oldest output is dropped.
    #[serde(default = "default_stderr_limit")]
    pub stderr_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            args: default_agent_args(),
            cwd: default_cwd(),
            env: BTreeMap::new(),
            stderr_limit: DEFAULT_STDERR_LIMIT,
        }
    }
}

fn default_stderr_limit() -> usize {
    DEFAULT_STDERR_LIMIT
}

fn default_agent_args() -> Vec<String> {
    vec!["acp".into()]
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

/// Identity and capabilities announced in `initialize`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// `clientInfo.name`.
    #[serde(default = "default_client_name")]
    pub name: String,
    /// `clientInfo.version`.
    #[serde(default = "default_client_version")]
    pub version: String,
    /// `protocolVersion` proposed to the agent.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// `clientCapabilities.fs.readTextFile`.
    #[serde(default = "default_true")]
    pub read_text_file: bool,
    /// `clientCapabilities.fs.writeTextFile`.
    #[serde(default = "default_true")]
    pub write_text_file: bool,
    /// `clientCapabilities.terminal`.
    #[serde(default)]
    pub terminal: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
            protocol_version: default_protocol_version(),
            read_text_file: true,
            write_text_file: true,
            terminal: false,
        }
    }
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").into()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_protocol_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Parameters of `session/new`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// `mcpServers`, passed through verbatim.
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

/// Response collection bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CollectConfig {
    /// Lines read per request before giving up.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Answer agent-initiated requests with `-32601`.
    #[serde(default = "default_true")]
    pub reject_agent_requests: bool,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            reject_agent_requests: true,
        }
    }
}

fn default_max_messages() -> usize {
    5
}

/// Timeout values (milliseconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Maximum wait for a single line of agent output.
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    /// Fixed pause after each send before reading; 0 disables it.
    #[serde(default)]
    pub settle_ms: u64,
    /// Time the agent is given to exit after the termination request.
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    /// Time allowed for draining stderr and stdout after exit.
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
    /// What happens when the grace period elapses.
    #[serde(default)]
    pub termination_policy: TerminationPolicy,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            settle_ms: 0,
            termination_grace_ms: default_termination_grace_ms(),
            drain_ms: default_drain_ms(),
            termination_policy: TerminationPolicy::default(),
        }
    }
}

fn default_read_ms() -> u64 {
    5000
}

fn default_termination_grace_ms() -> u64 {
    2000
}

fn default_drain_ms() -> u64 {
    2000
}

fn default_prompts() -> Vec<String> {
    vec!["hi what can you do".into()]
}

fn default_prompt_shape() -> PromptShape {
    PromptShape::ContentBlocks
}

/// Full harness configuration, usually parsed from a TOML file and then
/// overridden from the command line.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HarnessConfig {
    /// Agent launch settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// `initialize` settings.
    #[serde(default)]
    pub client: ClientConfig,
    /// `session/new` settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Collection bounds.
    #[serde(default)]
    pub collect: CollectConfig,
    /// Timeouts and termination policy.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Prompt texts, sent in order.
    #[serde(default = "default_prompts")]
    pub prompts: Vec<String>,
    /// Prompt submission strategy.
    #[serde(default)]
    pub mode: RunMode,
    /// Payload shape of sequential prompts.
    #[serde(default = "default_prompt_shape")]
    pub prompt_shape: PromptShape,
}

impl HarnessConfig {
    /// Defaults for every key, launching `program`. Not yet validated.
    #[must_use]
    pub fn for_program(program: impl Into<PathBuf>) -> Self {
        Self {
            agent: AgentConfig {
                program: program.into(),
                ..AgentConfig::default()
            },
            client: ClientConfig::default(),
            session: SessionConfig::default(),
            collect: CollectConfig::default(),
            timeouts: TimeoutConfig::default(),
            prompts: default_prompts(),
            mode: RunMode::default(),
            prompt_shape: default_prompt_shape(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::read_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file path without validating it, so
    /// command-line overrides can be applied first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed.
    pub fn read_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::parse_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config = Self::parse_toml(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string, filling in defaults, without validation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on invalid TOML or unknown enum values.
    pub fn parse_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Check bounds and normalise paths.
    ///
    /// The working directory is canonicalised. A program path with more
    /// than one component is resolved against the harness's own working
    /// directory; a bare name is left for `PATH` lookup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on an empty program, a zero message
    /// budget, read timeout or stderr limit, probe mode without a prompt, or
    /// a path that does not exist.
    pub fn validate(&mut self) -> Result<()> {
        if self.agent.program.as_os_str().is_empty() {
            return Err(AppError::Config(
                "agent.program must be set (config file or --agent)".into(),
            ));
        }

        if self.collect.max_messages == 0 {
            return Err(AppError::Config(
                "collect.max_messages must be greater than zero".into(),
            ));
        }

        if self.timeouts.read_ms == 0 {
            return Err(AppError::Config(
                "timeouts.read_ms must be greater than zero".into(),
            ));
        }

        if self.agent.stderr_limit == 0 {
            return Err(AppError::Config(
                "agent.stderr_limit must be greater than zero".into(),
            ));
        }

        if self.mode == RunMode::Probe && self.prompts.is_empty() {
            return Err(AppError::Config(
                "probe mode needs at least one prompt".into(),
            ));
        }

        self.agent.cwd = self
            .agent
            .cwd
            .canonicalize()
            .map_err(|err| AppError::Config(format!("agent.cwd invalid: {err}")))?;

        if self.agent.program.components().count() > 1 {
            self.agent.program = self.agent.program.canonicalize().map_err(|err| {
                AppError::Config(format!(
                    "agent.program {} invalid: {err}",
                    self.agent.program.display()
                ))
            })?;
        }

        Ok(())
    }

    /// Launch parameters for the agent process.
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            program: self.agent.program.clone(),
            args: self.agent.args.clone(),
            cwd: self.agent.cwd.clone(),
            env: self.agent.env.clone(),
            stderr_limit: self.agent.stderr_limit,
        }
    }

    /// Termination and drain bounds.
    #[must_use]
    pub fn teardown_policy(&self) -> TeardownPolicy {
        TeardownPolicy {
            grace: Duration::from_millis(self.timeouts.termination_grace_ms),
            drain_timeout: Duration::from_millis(self.timeouts.drain_ms),
            on_timeout: self.timeouts.termination_policy,
        }
    }

    /// Read bounds and settle delay for the protocol client.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            limits: CollectLimits {
                max_messages: self.collect.max_messages,
                read_timeout: Duration::from_millis(self.timeouts.read_ms),
                reject_agent_requests: self.collect.reject_agent_requests,
            },
            settle: Duration::from_millis(self.timeouts.settle_ms),
        }
    }

    /// `initialize` parameters built from `[client]`.
    #[must_use]
    pub fn initialize_params(&self) -> InitializeParams {
        InitializeParams {
            protocol_version: self.client.protocol_version,
            client_capabilities: ClientCapabilities {
                fs: FsCapabilities {
                    read_text_file: self.client.read_text_file,
                    write_text_file: self.client.write_text_file,
                },
                terminal: self.client.terminal,
            },
            client_info: ClientInfo {
                name: self.client.name.clone(),
                version: self.client.version.clone(),
            },
        }
    }
}
