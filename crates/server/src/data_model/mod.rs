use std::{collections::HashMap, fmt::Display, time::Duration};

use derive_builder::Builder;
use nanoid::nanoid;
use proto_api::agent_api_pb::CommandRequest;
use serde::{Deserialize, Serialize};
use strum::Display as StrumDisplay;
use tokio::{sync::mpsc, time::Instant};
use tonic::Status;
use utoipa::ToSchema;

use crate::utils::get_epoch_time_in_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct AgentId(String);

impl Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl AgentId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct SandboxId(String);

impl Default for SandboxId {
    fn default() -> Self {
        Self(nanoid!())
    }
}

impl Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl SandboxId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SandboxId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

/// Correlation id of a submitted command. The same token identifies the
/// pending correlation in the dispatcher and the process record in the
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ProcessId(String);

impl Default for ProcessId {
    fn default() -> Self {
        Self(nanoid!())
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl ProcessId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProcessId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, StrumDisplay)]
pub enum AgentStatus {
    Starting,
    Ready,
    Busy,
    Unreachable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub process_count: u32,
}

/// Server-push channel to one agent, owned by the live GetCommands handler.
/// The agent record only indexes it; the generation lets a disconnect watcher
/// avoid clearing a stream that a reconnect already replaced.
#[derive(Debug, Clone)]
pub struct DownstreamStream {
    pub sender: mpsc::Sender<Result<CommandRequest, Status>>,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLogLine {
    pub level: String,
    pub message: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub sandbox_id: SandboxId,
    pub vm_id: String,
    pub agent_version: String,
    pub metadata: HashMap<String, String>,
    pub status: AgentStatus,
    pub last_heartbeat: Instant,
    pub resource_usage: Option<ResourceUsage>,
    pub downstream: Option<DownstreamStream>,
    /// Log lines pushed through SendLogs without a process id.
    pub log_lines: Vec<AgentLogLine>,
}

impl Agent {
    pub fn is_stale(&self, stale_threshold: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > stale_threshold
    }

    /// Eligible for dispatch: reports Ready, heartbeat fresh, and a live
    /// downstream stream attached.
    pub fn is_dispatchable(&self, stale_threshold: Duration, now: Instant) -> bool {
        self.status == AgentStatus::Ready &&
            !self.is_stale(stale_threshold, now) &&
            self.downstream.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, StrumDisplay, ToSchema)]
pub enum SandboxStatus {
    Creating,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

/// Opaque to the core: handed to the cloud provider verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfiguration {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub admin_credentials: Option<AdminCredentials>,
}

/// Token the cloud provider returns for a provisioned VM. Opaque to the core;
/// passed back verbatim on deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct VmHandle(String);

impl VmHandle {
    pub fn new(handle: String) -> Self {
        Self(handle)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct Sandbox {
    #[builder(default)]
    pub id: SandboxId,
    pub status: SandboxStatus,
    pub configuration: SandboxConfiguration,
    #[builder(default)]
    pub public_ip: Option<String>,
    #[builder(default = "self.default_created_at()")]
    pub created_at_ms: u64,
    #[builder(default)]
    pub vm_handle: Option<VmHandle>,
}

impl SandboxBuilder {
    fn default_created_at(&self) -> u64 {
        get_epoch_time_in_ms()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

/// Why a pending correlation was cancelled instead of completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
pub enum CancelReason {
    /// Terminate was requested for the process.
    Terminated,
    /// The owning sandbox was deleted while the command was in flight.
    SandboxDeleted,
    /// The orchestrator is shutting down.
    Shutdown,
}

/// Payload delivered through a pending correlation's one-shot channel.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Result(CommandResult),
    Cancelled(CancelReason),
}

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub sandbox_id: SandboxId,
    pub process_id: ProcessId,
    pub command: String,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: Option<u64>,
    pub log_lines: Vec<String>,
    pub created_at_ms: u64,
}

impl ProcessRecord {
    pub fn new(sandbox_id: SandboxId, process_id: ProcessId, command: String) -> Self {
        Self {
            sandbox_id,
            process_id,
            command,
            is_running: true,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: None,
            log_lines: Vec::new(),
            created_at_ms: get_epoch_time_in_ms(),
        }
    }

    /// Terminal transition with an agent-reported result. Returns false if the
    /// record already left the running state.
    pub fn complete(&mut self, result: CommandResult) -> bool {
        if !self.is_running {
            return false;
        }
        self.is_running = false;
        self.exit_code = Some(result.exit_code);
        self.stdout = result.stdout;
        self.stderr = result.stderr;
        self.duration_ms = Some(result.duration_ms);
        true
    }

    /// Terminal transition without an agent result (timeout, terminate,
    /// shutdown). Exit code is fixed at -1; `detail` lands in stderr.
    pub fn finish_without_result(&mut self, detail: &str) -> bool {
        if !self.is_running {
            return false;
        }
        self.is_running = false;
        self.exit_code = Some(-1);
        self.stderr = detail.to_string();
        self.duration_ms = Some(get_epoch_time_in_ms().saturating_sub(self.created_at_ms));
        true
    }

    /// Log lines may arrive only while the process is running.
    pub fn append_log(&mut self, line: String) -> bool {
        if !self.is_running {
            return false;
        }
        self.log_lines.push(line);
        true
    }

    pub fn result(&self) -> Option<CommandResult> {
        if self.is_running {
            return None;
        }
        Some(CommandResult {
            exit_code: self.exit_code.unwrap_or(-1),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            duration_ms: self.duration_ms.unwrap_or(0),
            success: self.exit_code == Some(0),
        })
    }
}
