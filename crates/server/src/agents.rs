use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use proto_api::agent_api_pb::CommandRequest;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tonic::Status;
use tracing::{debug, info};

use crate::{
    config::ServerConfig,
    data_model::{
        Agent, AgentId, AgentLogLine, AgentStatus, DownstreamStream, ResourceUsage, SandboxId,
        SandboxStatus,
    },
    state_store::OrchestratorState,
};

#[derive(Debug, thiserror::Error)]
#[error("unknown agent: {0}")]
pub struct UnknownAgent(pub AgentId);

pub struct RegisterAgentSpec {
    pub agent_id: AgentId,
    pub sandbox_id: SandboxId,
    pub vm_id: String,
    pub agent_version: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_id: String,
    pub sandbox_id: String,
    pub vm_id: String,
    pub agent_version: String,
    pub status: String,
    pub resource_usage: Option<ResourceUsage>,
}

/// Tracks agent sessions: registration, heartbeat liveness, and the
/// downstream command stream each live GetCommands call attaches.
pub struct AgentManager {
    state: Arc<OrchestratorState>,
    heartbeat_interval_secs: u64,
    stale_threshold: Duration,
    sweep_interval: Duration,
    stream_generation: AtomicU64,
}

impl AgentManager {
    pub fn new(state: Arc<OrchestratorState>, config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            state,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            stale_threshold: config.stale_threshold(),
            sweep_interval: config.sweep_interval(),
            stream_generation: AtomicU64::new(0),
        })
    }

    /// Create-or-overwrite registration. Cannot fail; a retry or an agent
    /// replacement lands on the same record. Any previously attached
    /// downstream stream is dropped so a reconnecting agent starts clean.
    pub async fn register(&self, spec: RegisterAgentSpec) -> u64 {
        let now = Instant::now();
        if let Some(existing) = self.state.agent(&spec.agent_id).await {
            let mut agent = existing.write().await;
            agent.sandbox_id = spec.sandbox_id.clone();
            agent.vm_id = spec.vm_id;
            agent.agent_version = spec.agent_version;
            agent.metadata = spec.metadata;
            agent.status = AgentStatus::Ready;
            agent.last_heartbeat = now;
            agent.downstream = None;
            info!(agent_id = %agent.id, sandbox_id = %agent.sandbox_id, "agent re-registered");
        } else {
            let agent = Agent {
                id: spec.agent_id.clone(),
                sandbox_id: spec.sandbox_id.clone(),
                vm_id: spec.vm_id,
                agent_version: spec.agent_version,
                metadata: spec.metadata,
                status: AgentStatus::Ready,
                last_heartbeat: now,
                resource_usage: None,
                downstream: None,
                log_lines: Vec::new(),
            };
            info!(agent_id = %agent.id, sandbox_id = %agent.sandbox_id, "agent registered");
            self.state.insert_agent(agent).await;
        }
        self.promote_sandbox(&spec.sandbox_id).await;
        self.heartbeat_interval_secs
    }

    pub async fn heartbeat(
        &self,
        agent_id: &AgentId,
        status: Option<AgentStatus>,
        resource_usage: Option<ResourceUsage>,
    ) -> Result<(), UnknownAgent> {
        let record = self
            .state
            .agent(agent_id)
            .await
            .ok_or_else(|| UnknownAgent(agent_id.clone()))?;
        let sandbox_id = {
            let mut agent = record.write().await;
            agent.last_heartbeat = Instant::now();
            if let Some(status) = status {
                agent.status = status;
            }
            if resource_usage.is_some() {
                agent.resource_usage = resource_usage;
            }
            debug!(agent_id = %agent.id, status = %agent.status, "heartbeat received");
            (agent.status == AgentStatus::Ready).then(|| agent.sandbox_id.clone())
        };
        if let Some(sandbox_id) = sandbox_id {
            self.promote_sandbox(&sandbox_id).await;
        }
        Ok(())
    }

    /// Store the downstream stream handle for an agent. Returns the stream
    /// generation; the caller's disconnect watcher passes it back to
    /// `clear_downstream_if_current` so it never clears a stream a reconnect
    /// already replaced.
    pub async fn attach_downstream(
        &self,
        agent_id: &AgentId,
        sender: mpsc::Sender<Result<CommandRequest, Status>>,
    ) -> Result<u64, UnknownAgent> {
        let record = self
            .state
            .agent(agent_id)
            .await
            .ok_or_else(|| UnknownAgent(agent_id.clone()))?;
        let generation = self.stream_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut agent = record.write().await;
        if agent.downstream.is_some() {
            info!(agent_id = %agent.id, "replacing downstream stream");
        }
        agent.downstream = Some(DownstreamStream { sender, generation });
        Ok(generation)
    }

    pub async fn clear_downstream_if_current(&self, agent_id: &AgentId, generation: u64) {
        let Some(record) = self.state.agent(agent_id).await else {
            return;
        };
        let mut agent = record.write().await;
        if agent
            .downstream
            .as_ref()
            .is_some_and(|d| d.generation == generation)
        {
            agent.downstream = None;
            debug!(agent_id = %agent.id, generation, "downstream stream cleared");
        }
    }

    pub async fn downstream_sender(
        &self,
        agent_id: &AgentId,
    ) -> Option<mpsc::Sender<Result<CommandRequest, Status>>> {
        let record = self.state.agent(agent_id).await?;
        let agent = record.read().await;
        agent.downstream.as_ref().map(|d| d.sender.clone())
    }

    /// One agent eligible to execute commands for the sandbox. Multiple
    /// matches are unexpected outside agent replacement; the tie-break is
    /// deterministic by smallest agent id.
    pub async fn find_ready_agent(&self, sandbox_id: &SandboxId) -> Option<AgentId> {
        let now = Instant::now();
        let mut best: Option<AgentId> = None;
        for record in self.state.list_agents().await {
            let agent = record.read().await;
            if agent.sandbox_id != *sandbox_id ||
                !agent.is_dispatchable(self.stale_threshold, now)
            {
                continue;
            }
            if best.as_ref().map_or(true, |b| agent.id < *b) {
                best = Some(agent.id.clone());
            }
        }
        best
    }

    /// Agents with a fresh heartbeat.
    pub async fn list_active(&self) -> Vec<AgentSummary> {
        let now = Instant::now();
        let mut active = Vec::new();
        for record in self.state.list_agents().await {
            let agent = record.read().await;
            if agent.is_stale(self.stale_threshold, now) {
                continue;
            }
            active.push(AgentSummary {
                agent_id: agent.id.get().to_string(),
                sandbox_id: agent.sandbox_id.get().to_string(),
                vm_id: agent.vm_id.clone(),
                agent_version: agent.agent_version.clone(),
                status: agent.status.to_string(),
                resource_usage: agent.resource_usage,
            });
        }
        active.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        active
    }

    pub async fn append_agent_log(&self, agent_id: &AgentId, line: AgentLogLine) {
        if let Some(record) = self.state.agent(agent_id).await {
            record.write().await.log_lines.push(line);
        } else {
            debug!(agent_id = %agent_id, "dropping log line from unknown agent");
        }
    }

    /// Marks stale agents Unreachable. Records are never deleted here; an
    /// agent that reconnects reclaims its record, and deletion happens only
    /// with the owning sandbox.
    pub async fn sweep_once(&self) -> usize {
        let now = Instant::now();
        let mut marked = 0;
        for record in self.state.list_agents().await {
            let mut agent = record.write().await;
            if agent.status != AgentStatus::Unreachable &&
                agent.is_stale(self.stale_threshold, now)
            {
                info!(
                    agent_id = %agent.id,
                    sandbox_id = %agent.sandbox_id,
                    "marking stale agent unreachable"
                );
                agent.status = AgentStatus::Unreachable;
                marked += 1;
            }
        }
        marked
    }

    pub async fn start_sweeper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown_rx.changed() => {
                    debug!("shutting down agent sweeper");
                    break;
                }
            }
        }
    }

    /// A sandbox still provisioning becomes Ready the moment one of its
    /// agents does.
    async fn promote_sandbox(&self, sandbox_id: &SandboxId) {
        let Some(record) = self.state.sandbox(sandbox_id).await else {
            return;
        };
        let mut sandbox = record.write().await;
        if matches!(
            sandbox.status,
            SandboxStatus::Creating | SandboxStatus::Starting
        ) {
            info!(sandbox_id = %sandbox.id, "sandbox ready");
            sandbox.status = SandboxStatus::Ready;
        }
    }
}
