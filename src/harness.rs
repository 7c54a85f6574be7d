//! One complete harness run.
//!
//! [`Harness::run`] spawns the agent, drives the exchange selected by the
//! configured [`RunMode`], and always releases the process afterwards. The
//! first error of the exchange is recorded as the run's failure rather than
//! returned, so the report still carries the agent's stderr and any stdout
//! the exchange did not consume.

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::acp::client::{InitializeOutcome, PromptExchange, ProtocolClient, Session, ShapeProbe};
use crate::acp::collector::StopCondition;
use crate::acp::message::RequestId;
use crate::acp::process::AgentProcess;
use crate::acp::transport::Transport;
use crate::config::HarnessConfig;
use crate::mode::RunMode;
use crate::report::{AgentSummary, RunReport};
use crate::Result;

/// What the exchange produced before it finished or failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Exchange {
    /// Successful `initialize`, if reached.
    pub initialize: Option<InitializeOutcome>,
    /// Established session, if reached.
    pub session: Option<Session>,
    /// Prompt exchanges in sequential or pipelined mode.
    pub prompts: Vec<PromptExchange>,
    /// Shape probe in probe mode.
    pub probe: Option<ShapeProbe>,
    /// Every request id issued, in order.
    pub issued_ids: Vec<RequestId>,
}

/// Drive the handshake and prompts over `transport`, filling `record` as
/// each step succeeds.
///
/// # Errors
///
/// Returns the first error of any step; `record` keeps what was reached.
pub async fn exchange<W, R>(
    transport: &mut Transport<W, R>,
    config: &HarnessConfig,
    record: &mut Exchange,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut client = ProtocolClient::new(transport, config.client_options(), cancel.clone());
    let outcome = drive(&mut client, config, record).await;
    record.issued_ids = client.issued_ids().to_vec();
    outcome
}

async fn drive<W, R>(
    client: &mut ProtocolClient<'_, W, R>,
    config: &HarnessConfig,
    record: &mut Exchange,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    record.initialize = Some(client.initialize(&config.initialize_params()).await?);

    let session = client
        .create_session(&config.agent.cwd, &config.session.mcp_servers)
        .await?;
    record.session = Some(session.clone());

    match config.mode {
        RunMode::Sequential => {
            for text in &config.prompts {
                let exchange = client.prompt_with(&session, text, config.prompt_shape).await?;
                let stop = exchange.collection.stop;
                record.prompts.push(exchange);
                if matches!(stop, StopCondition::StreamClosed | StopCondition::Cancelled) {
                    warn!(%stop, "skipping remaining prompts");
                    break;
                }
            }
        }
        RunMode::Pipelined => {
            record
                .prompts
                .push(client.fire_prompts(&session, &config.prompts).await?);
        }
        RunMode::Probe => {
            if let Some(text) = config.prompts.first() {
                record.probe = Some(client.probe_prompt_shapes(&session, text).await?);
            }
        }
    }

    Ok(())
}

/// A configured harness, ready to run.
#[derive(Debug, Clone)]
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    /// Harness for an already validated configuration.
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    /// Perform one run.
    ///
    /// Cancelling `cancel` ends any pending read; teardown still runs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` only if the agent cannot be spawned.
    /// Every later failure is recorded in [`RunReport::failure`].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let span = info_span!("run", mode = %self.config.mode);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let started_at = Utc::now();
        let mut agent = AgentProcess::spawn(&self.config.spawn_config())?;
        let summary = AgentSummary {
            command: agent.command_line().to_owned(),
            pid: agent.pid(),
            cwd: self.config.agent.cwd.clone(),
        };

        let mut record = Exchange::default();
        let failure = match exchange(agent.transport(), &self.config, &mut record, cancel).await {
            Ok(()) => None,
            Err(err) => {
                warn!(%err, "run failed");
                Some(err.to_string())
            }
        };

        let teardown = agent.shutdown(&self.config.teardown_policy()).await;
        info!(requests = record.issued_ids.len(), failed = failure.is_some(), "run finished");

        Ok(RunReport {
            agent: summary,
            mode: self.config.mode,
            started_at,
            finished_at: Utc::now(),
            exchange: record,
            failure,
            teardown,
        })
    }
}
