use std::sync::Arc;

use proto_api::agent_api_pb::{
    agent_api_server::AgentApi, AgentStatus as PbAgentStatus, CommandRequest, GetCommandsRequest,
    HeartbeatRequest, HeartbeatResponse, LogMessage, RegisterAgentRequest, RegisterAgentResponse,
    ResourceUsage as PbResourceUsage, SendCommandResultRequest, SendCommandResultResponse,
    SendLogsResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::{
    agents::{AgentManager, RegisterAgentSpec},
    data_model::{AgentId, AgentLogLine, AgentStatus, CommandResult, ProcessId, ResourceUsage},
    dispatcher::CommandDispatcher,
    processes::ProcessRegistry,
    state_store::OrchestratorState,
};

/// Channel depth of one agent's downstream command stream. Writes beyond
/// this while the agent is not draining fail with AgentWriteFailed.
const DOWNSTREAM_CHANNEL_CAPACITY: usize = 64;

fn agent_status_from_pb(status: PbAgentStatus) -> Option<AgentStatus> {
    match status {
        PbAgentStatus::Unspecified => None,
        PbAgentStatus::Starting => Some(AgentStatus::Starting),
        PbAgentStatus::Ready => Some(AgentStatus::Ready),
        PbAgentStatus::Busy => Some(AgentStatus::Busy),
        PbAgentStatus::Unreachable => Some(AgentStatus::Unreachable),
    }
}

fn resource_usage_from_pb(usage: PbResourceUsage) -> ResourceUsage {
    ResourceUsage {
        cpu_percent: usage.cpu_percent,
        memory_bytes: usage.memory_bytes,
        disk_bytes: usage.disk_bytes,
        process_count: usage.process_count,
    }
}

pub struct AgentApiService {
    state: Arc<OrchestratorState>,
    agents: Arc<AgentManager>,
    dispatcher: Arc<CommandDispatcher>,
    processes: Arc<ProcessRegistry>,
}

impl AgentApiService {
    pub fn new(
        state: Arc<OrchestratorState>,
        agents: Arc<AgentManager>,
        dispatcher: Arc<CommandDispatcher>,
        processes: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            state,
            agents,
            dispatcher,
            processes,
        }
    }
}

#[tonic::async_trait]
impl AgentApi for AgentApiService {
    async fn register_agent(
        &self,
        request: Request<RegisterAgentRequest>,
    ) -> Result<Response<RegisterAgentResponse>, Status> {
        let req = request.into_inner();
        if req.agent_id.is_empty() {
            return Err(Status::invalid_argument("agent_id required"));
        }
        if req.sandbox_id.is_empty() {
            return Err(Status::invalid_argument("sandbox_id required"));
        }

        let heartbeat_interval_s = self
            .agents
            .register(RegisterAgentSpec {
                agent_id: AgentId::from(req.agent_id.as_str()),
                sandbox_id: req.sandbox_id.as_str().into(),
                vm_id: req.vm_id,
                agent_version: req.agent_version,
                metadata: req.metadata,
            })
            .await;

        Ok(Response::new(RegisterAgentResponse {
            ok: true,
            message: "registered".to_string(),
            heartbeat_interval_s: heartbeat_interval_s as u32,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        if req.agent_id.is_empty() {
            return Err(Status::invalid_argument("agent_id required"));
        }

        let status = agent_status_from_pb(req.status());
        let usage = req.resource_usage.map(resource_usage_from_pb);
        let agent_id = AgentId::from(req.agent_id.as_str());

        match self.agents.heartbeat(&agent_id, status, usage).await {
            Ok(()) => Ok(Response::new(HeartbeatResponse {
                ok: true,
                message: String::new(),
            })),
            Err(_) => Ok(Response::new(HeartbeatResponse {
                ok: false,
                message: "unknown agent; re-register".to_string(),
            })),
        }
    }

    type GetCommandsStream = ReceiverStream<Result<CommandRequest, Status>>;

    async fn get_commands(
        &self,
        request: Request<GetCommandsRequest>,
    ) -> Result<Response<Self::GetCommandsStream>, Status> {
        let req = request.into_inner();
        let agent_id = AgentId::from(req.agent_id.as_str());

        let record = self
            .state
            .agent(&agent_id)
            .await
            .ok_or_else(|| Status::failed_precondition("agent not registered"))?;
        {
            let agent = record.read().await;
            if !req.sandbox_id.is_empty() && agent.sandbox_id.get() != req.sandbox_id {
                return Err(Status::invalid_argument("sandbox_id does not match registration"));
            }
        }

        let (tx, rx) = mpsc::channel(DOWNSTREAM_CHANNEL_CAPACITY);
        let generation = self
            .agents
            .attach_downstream(&agent_id, tx.clone())
            .await
            .map_err(|_| Status::failed_precondition("agent not registered"))?;

        info!(agent_id = %agent_id, generation, "command stream attached");

        // The stream is owned by this RPC; the record only indexes it. When
        // the client goes away (including handler teardown on error), the
        // receiver drops, closed() fires, and the handle is cleared unless a
        // reconnect already replaced it.
        let agents = self.agents.clone();
        let watcher_id = agent_id.clone();
        tokio::spawn(async move {
            tx.closed().await;
            agents
                .clear_downstream_if_current(&watcher_id, generation)
                .await;
            debug!(agent_id = %watcher_id, generation, "command stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn send_command_result(
        &self,
        request: Request<SendCommandResultRequest>,
    ) -> Result<Response<SendCommandResultResponse>, Status> {
        let req = request.into_inner();
        if req.command_id.is_empty() {
            return Err(Status::invalid_argument("command_id required"));
        }

        let process_id = ProcessId::from(req.command_id.as_str());
        let result = CommandResult {
            exit_code: req.exit_code,
            stdout: req.stdout,
            stderr: req.stderr,
            duration_ms: req.duration_ms,
            success: req.success,
        };

        let delivered = self.dispatcher.complete(&process_id, result).await;
        if !delivered {
            debug!(
                command_id = %process_id,
                agent_id = %req.agent_id,
                "acknowledging late command result"
            );
        }

        // Always ack so the agent stays simple.
        Ok(Response::new(SendCommandResultResponse { ok: true }))
    }

    async fn send_logs(
        &self,
        request: Request<Streaming<LogMessage>>,
    ) -> Result<Response<SendLogsResponse>, Status> {
        let mut stream = request.into_inner();

        while let Some(msg) = stream.message().await? {
            let agent_id = AgentId::from(msg.agent_id.as_str());
            let process_id = msg.process_id.as_deref().filter(|p| !p.is_empty());

            match process_id {
                Some(pid) => {
                    // Process-tagged lines land on the process record; the
                    // sandbox comes from the sending agent's registration.
                    let sandbox_id = match self.state.agent(&agent_id).await {
                        Some(record) => record.read().await.sandbox_id.clone(),
                        None => {
                            debug!(agent_id = %agent_id, "log line from unknown agent dropped");
                            continue;
                        }
                    };
                    let attached = self
                        .processes
                        .append_log(&sandbox_id, &ProcessId::from(pid), msg.message.clone())
                        .await;
                    if !attached {
                        debug!(
                            agent_id = %agent_id,
                            process_id = pid,
                            "log line for unknown or finished process dropped"
                        );
                    }
                }
                None => {
                    self.agents
                        .append_agent_log(
                            &agent_id,
                            AgentLogLine {
                                level: msg.level,
                                message: msg.message,
                                timestamp_ms: msg.timestamp_ms,
                            },
                        )
                        .await;
                }
            }
        }

        Ok(Response::new(SendLogsResponse { ok: true }))
    }
}
