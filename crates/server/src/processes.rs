use std::sync::Arc;

use nanoid::nanoid;
use proto_api::agent_api_pb::{CommandKind, CommandRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    agents::AgentManager,
    data_model::{CancelReason, CommandResult, ProcessId, ProcessRecord, SandboxId},
    dispatcher::{CommandDispatcher, CommandSpec, DispatchError},
    state_store::OrchestratorState,
};

#[derive(Debug, thiserror::Error)]
#[error("process not found: {0}")]
pub struct ProcessNotFound(pub ProcessId);

#[derive(Debug, Clone)]
pub struct SubmittedCommand {
    pub process_id: ProcessId,
    pub command: String,
    pub is_running: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub process_id: ProcessId,
    pub is_running: bool,
    pub result: Option<CommandResult>,
}

/// Per-(sandbox, process) state: the running flag, accumulated log lines, and
/// the final result. The process id is the dispatcher's correlation id, so a
/// process record and its pending correlation share one key.
pub struct ProcessRegistry {
    state: Arc<OrchestratorState>,
    agents: Arc<AgentManager>,
    dispatcher: Arc<CommandDispatcher>,
}

impl ProcessRegistry {
    pub fn new(
        state: Arc<OrchestratorState>,
        agents: Arc<AgentManager>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            agents,
            dispatcher,
        })
    }

    /// Dispatch the command and return immediately with a running process
    /// record. A detached waiter finishes the record when the agent responds,
    /// the timeout lapses, or the command is cancelled.
    pub async fn submit(
        self: &Arc<Self>,
        sandbox_id: &SandboxId,
        spec: CommandSpec,
    ) -> Result<SubmittedCommand, DispatchError> {
        let command = spec.command.clone();
        let handle = self.dispatcher.dispatch(sandbox_id, spec).await?;
        let process_id = handle.process_id.clone();

        let record = self
            .state
            .insert_process(ProcessRecord::new(
                sandbox_id.clone(),
                process_id.clone(),
                command.clone(),
            ))
            .await;

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.wait(handle, CancellationToken::new()).await;
            let mut process = record.write().await;
            match outcome {
                Ok(result) => {
                    process.complete(result);
                }
                Err(DispatchError::Timeout) => {
                    process.finish_without_result("timeout");
                }
                Err(DispatchError::Cancelled) => {
                    process.finish_without_result("terminated");
                }
                Err(DispatchError::Shutdown) => {
                    process.finish_without_result("shutdown");
                }
                // Dispatch already succeeded; these cannot come out of wait().
                Err(err) => {
                    warn!(process_id = %process.process_id, "unexpected wait error: {err}");
                    process.finish_without_result(&err.to_string());
                }
            }
        });

        Ok(SubmittedCommand {
            process_id,
            command,
            is_running: true,
        })
    }

    pub async fn get_status(
        &self,
        sandbox_id: &SandboxId,
        process_id: &ProcessId,
    ) -> Option<ProcessStatus> {
        let record = self.state.process(sandbox_id, process_id).await?;
        let process = record.read().await;
        Some(ProcessStatus {
            process_id: process.process_id.clone(),
            is_running: process.is_running,
            result: process.result(),
        })
    }

    pub async fn get_logs(
        &self,
        sandbox_id: &SandboxId,
        process_id: &ProcessId,
    ) -> Option<Vec<String>> {
        let record = self.state.process(sandbox_id, process_id).await?;
        let process = record.read().await;
        Some(process.log_lines.clone())
    }

    /// Attach a log line pushed by the agent for this process. Lines for
    /// finished or unknown processes are dropped.
    pub async fn append_log(
        &self,
        sandbox_id: &SandboxId,
        process_id: &ProcessId,
        line: String,
    ) -> bool {
        match self.state.process(sandbox_id, process_id).await {
            Some(record) => record.write().await.append_log(line),
            None => false,
        }
    }

    /// Ask the agent to kill the process (best effort) and cancel the
    /// orchestrator-side waiter immediately.
    pub async fn terminate(
        &self,
        sandbox_id: &SandboxId,
        process_id: &ProcessId,
    ) -> Result<(), ProcessNotFound> {
        let record = self
            .state
            .process(sandbox_id, process_id)
            .await
            .ok_or_else(|| ProcessNotFound(process_id.clone()))?;

        if let Some(agent_id) = self.agents.find_ready_agent(sandbox_id).await {
            if let Some(sender) = self.agents.downstream_sender(&agent_id).await {
                let request = CommandRequest {
                    command_id: nanoid!(),
                    command: String::new(),
                    timeout_s: 0,
                    working_dir: None,
                    env: Default::default(),
                    kind: CommandKind::Terminate as i32,
                    target_process_id: Some(process_id.get().to_string()),
                };
                if sender.try_send(Ok(request)).is_err() {
                    debug!(
                        process_id = %process_id,
                        "terminate signal not deliverable to agent"
                    );
                }
            }
        }

        let cancelled = self
            .dispatcher
            .cancel(process_id, CancelReason::Terminated)
            .await;
        if !cancelled {
            // No waiter left (already finished, or its task was torn down);
            // make sure the record still reaches a terminal state.
            record.write().await.finish_without_result("terminated");
        }
        Ok(())
    }
}
