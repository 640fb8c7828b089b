use std::{collections::HashMap, sync::Arc, time::Duration};

use proto_api::agent_api_pb::{CommandKind, CommandRequest};
use tokio::{
    sync::{mpsc::error::TrySendError, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agents::AgentManager,
    config::ServerConfig,
    data_model::{CancelReason, CommandOutcome, CommandResult, ProcessId, SandboxId},
    state_store::{OrchestratorState, PendingCorrelation},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no ready agent for sandbox")]
    NoReadyAgent,
    #[error("agent stream disconnected")]
    AgentDisconnected,
    #[error("write to agent stream failed")]
    AgentWriteFailed,
    #[error("command timed out")]
    Timeout,
    #[error("command cancelled by caller")]
    Cancelled,
    #[error("orchestrator shutting down")]
    Shutdown,
}

impl From<CancelReason> for DispatchError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Terminated => DispatchError::Cancelled,
            CancelReason::SandboxDeleted | CancelReason::Shutdown => DispatchError::Shutdown,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub command: String,
    /// None means the server default.
    pub timeout: Option<Duration>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// An in-flight dispatch: the correlation id plus the one-shot receiver the
/// agent's eventual result arrives on.
#[derive(Debug)]
pub struct DispatchHandle {
    pub process_id: ProcessId,
    pub deadline: Instant,
    rx: oneshot::Receiver<CommandOutcome>,
}

/// Correlates outbound commands with their eventual results. The pending map
/// lives in the state store; this is the only component that inserts into it
/// or synthesizes Timeout/Cancelled outcomes.
pub struct CommandDispatcher {
    state: Arc<OrchestratorState>,
    agents: Arc<AgentManager>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        state: Arc<OrchestratorState>,
        agents: Arc<AgentManager>,
        config: &ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            agents,
            default_timeout: config.default_command_timeout(),
        })
    }

    /// Resolve a ready agent, register a pending correlation, and write the
    /// command to the agent's downstream stream. Returns without waiting for
    /// the result; pair with [`wait`] or poll the process registry.
    pub async fn dispatch(
        &self,
        sandbox_id: &SandboxId,
        spec: CommandSpec,
    ) -> Result<DispatchHandle, DispatchError> {
        let agent_id = self
            .agents
            .find_ready_agent(sandbox_id)
            .await
            .ok_or(DispatchError::NoReadyAgent)?;

        let process_id = ProcessId::default();
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let (tx, rx) = oneshot::channel();
        self.state
            .insert_pending(
                process_id.clone(),
                PendingCorrelation {
                    sandbox_id: sandbox_id.clone(),
                    tx,
                    deadline,
                },
            )
            .await;

        // The agent may have dropped off between the readiness check and now.
        let Some(sender) = self.agents.downstream_sender(&agent_id).await else {
            self.state.take_pending(&process_id).await;
            return Err(DispatchError::AgentDisconnected);
        };

        let request = CommandRequest {
            command_id: process_id.get().to_string(),
            command: spec.command,
            timeout_s: timeout.as_secs() as u32,
            working_dir: spec.working_dir,
            env: spec.env,
            kind: CommandKind::Run as i32,
            target_process_id: None,
        };

        if let Err(err) = sender.try_send(Ok(request)) {
            self.state.take_pending(&process_id).await;
            return match err {
                TrySendError::Closed(_) => Err(DispatchError::AgentDisconnected),
                TrySendError::Full(_) => {
                    warn!(agent_id = %agent_id, "agent command stream is full");
                    Err(DispatchError::AgentWriteFailed)
                }
            };
        }

        debug!(
            agent_id = %agent_id,
            sandbox_id = %sandbox_id,
            process_id = %process_id,
            "command dispatched"
        );

        Ok(DispatchHandle {
            process_id,
            deadline,
            rx,
        })
    }

    /// Wait for the result of a dispatched command, bounded by its deadline
    /// and the caller's cancellation.
    pub async fn wait(
        &self,
        mut handle: DispatchHandle,
        cancel: CancellationToken,
    ) -> Result<CommandResult, DispatchError> {
        tokio::select! {
            outcome = &mut handle.rx => {
                match outcome {
                    Ok(CommandOutcome::Result(result)) => Ok(result),
                    Ok(CommandOutcome::Cancelled(reason)) => Err(reason.into()),
                    // Sender dropped without completing: the pending entry was
                    // discarded wholesale, which only happens on teardown.
                    Err(_) => Err(DispatchError::Shutdown),
                }
            }
            _ = tokio::time::sleep_until(handle.deadline) => {
                self.state.take_pending(&handle.process_id).await;
                info!(process_id = %handle.process_id, "command timed out");
                Err(DispatchError::Timeout)
            }
            _ = cancel.cancelled() => {
                self.state.take_pending(&handle.process_id).await;
                debug!(process_id = %handle.process_id, "command cancelled by caller");
                Err(DispatchError::Cancelled)
            }
        }
    }

    /// Dispatch and block until the agent responds, the timeout lapses, or
    /// the caller cancels.
    pub async fn execute(
        &self,
        sandbox_id: &SandboxId,
        spec: CommandSpec,
        cancel: CancellationToken,
    ) -> Result<CommandResult, DispatchError> {
        let handle = self.dispatch(sandbox_id, spec).await?;
        self.wait(handle, cancel).await
    }

    /// Deliver an agent result to the waiter, if one is still registered.
    /// Returns false for late results (already timed out or cancelled); the
    /// caller acknowledges the agent either way.
    pub async fn complete(&self, process_id: &ProcessId, result: CommandResult) -> bool {
        match self.state.take_pending(process_id).await {
            Some(pending) => pending.tx.send(CommandOutcome::Result(result)).is_ok(),
            None => {
                debug!(process_id = %process_id, "dropping late command result");
                false
            }
        }
    }

    /// Cancel one pending correlation. Returns false if none was registered.
    pub async fn cancel(&self, process_id: &ProcessId, reason: CancelReason) -> bool {
        match self.state.take_pending(process_id).await {
            Some(pending) => pending.tx.send(CommandOutcome::Cancelled(reason)).is_ok(),
            None => false,
        }
    }

    /// Cancel every pending correlation owned by a sandbox (delete-in-flight).
    pub async fn cancel_for_sandbox(&self, sandbox_id: &SandboxId, reason: CancelReason) -> usize {
        let pending = self.state.take_pending_for_sandbox(sandbox_id).await;
        let count = pending.len();
        for (process_id, correlation) in pending {
            debug!(process_id = %process_id, %reason, "cancelling pending command");
            let _ = correlation.tx.send(CommandOutcome::Cancelled(reason));
        }
        if count > 0 {
            info!(sandbox_id = %sandbox_id, count, "cancelled pending commands for sandbox");
        }
        count
    }

    /// Cancel everything outstanding; called once at orchestrator shutdown.
    pub async fn shutdown(&self) -> usize {
        let pending = self.state.drain_pending().await;
        let count = pending.len();
        for (_, correlation) in pending {
            let _ = correlation
                .tx
                .send(CommandOutcome::Cancelled(CancelReason::Shutdown));
        }
        if count > 0 {
            info!(count, "cancelled pending commands at shutdown");
        }
        count
    }
}
