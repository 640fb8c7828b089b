//! In-memory registries for the orchestrator: agents, sandboxes, processes,
//! and pending command correlations. One `OrchestratorState` is constructed
//! at startup and shared into every component; nothing here is persisted, so
//! an orchestrator restart loses all state and agents re-register on
//! reconnect.
//!
//! Locking: each registry map is behind its own `RwLock`; record values are
//! `Arc<RwLock<_>>` so mutation takes a per-record lock without holding the
//! map lock. No lock is ever held across a channel send or any other await
//! on foreign code.

use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::{oneshot, Mutex, RwLock},
    time::Instant,
};

use crate::data_model::{
    Agent, AgentId, CommandOutcome, ProcessId, ProcessRecord, Sandbox, SandboxId,
};

/// A caller waiting for a command result. Completed with a result by the
/// agent path or cancelled with a reason; either way the entry is removed
/// from the map first, so it never outlives its waiter.
pub struct PendingCorrelation {
    pub sandbox_id: SandboxId,
    pub tx: oneshot::Sender<CommandOutcome>,
    pub deadline: Instant,
}

pub struct OrchestratorState {
    agents: RwLock<HashMap<AgentId, Arc<RwLock<Agent>>>>,
    sandboxes: RwLock<HashMap<SandboxId, Arc<RwLock<Sandbox>>>>,
    processes: RwLock<HashMap<(SandboxId, ProcessId), Arc<RwLock<ProcessRecord>>>>,
    pending: Mutex<HashMap<ProcessId, PendingCorrelation>>,
}

impl OrchestratorState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
            sandboxes: RwLock::new(HashMap::new()),
            processes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    // --- Agents ---

    pub async fn agent(&self, id: &AgentId) -> Option<Arc<RwLock<Agent>>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn insert_agent(&self, agent: Agent) -> Arc<RwLock<Agent>> {
        let record = Arc::new(RwLock::new(agent));
        let id = record.read().await.id.clone();
        self.agents.write().await.insert(id, record.clone());
        record
    }

    pub async fn list_agents(&self) -> Vec<Arc<RwLock<Agent>>> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Agents are deleted only when their owning sandbox is.
    pub async fn remove_agents_for_sandbox(&self, sandbox_id: &SandboxId) -> Vec<AgentId> {
        let mut agents = self.agents.write().await;
        let mut removed = Vec::new();
        for (id, record) in agents.iter() {
            if record.read().await.sandbox_id == *sandbox_id {
                removed.push(id.clone());
            }
        }
        for id in &removed {
            agents.remove(id);
        }
        removed
    }

    // --- Sandboxes ---

    pub async fn sandbox(&self, id: &SandboxId) -> Option<Arc<RwLock<Sandbox>>> {
        self.sandboxes.read().await.get(id).cloned()
    }

    pub async fn insert_sandbox(&self, sandbox: Sandbox) -> Arc<RwLock<Sandbox>> {
        let id = sandbox.id.clone();
        let record = Arc::new(RwLock::new(sandbox));
        self.sandboxes.write().await.insert(id, record.clone());
        record
    }

    pub async fn list_sandboxes(&self) -> Vec<Arc<RwLock<Sandbox>>> {
        self.sandboxes.read().await.values().cloned().collect()
    }

    // --- Processes ---

    pub async fn process(
        &self,
        sandbox_id: &SandboxId,
        process_id: &ProcessId,
    ) -> Option<Arc<RwLock<ProcessRecord>>> {
        self.processes
            .read()
            .await
            .get(&(sandbox_id.clone(), process_id.clone()))
            .cloned()
    }

    pub async fn insert_process(&self, record: ProcessRecord) -> Arc<RwLock<ProcessRecord>> {
        let key = (record.sandbox_id.clone(), record.process_id.clone());
        let record = Arc::new(RwLock::new(record));
        self.processes.write().await.insert(key, record.clone());
        record
    }

    pub async fn remove_processes_for_sandbox(&self, sandbox_id: &SandboxId) -> usize {
        let mut processes = self.processes.write().await;
        let before = processes.len();
        processes.retain(|(sid, _), _| sid != sandbox_id);
        before - processes.len()
    }

    // --- Pending correlations ---

    /// Returns false (and drops `correlation`) if an entry already exists for
    /// the id; ids are generated per dispatch, so a collision is a bug.
    pub async fn insert_pending(
        &self,
        process_id: ProcessId,
        correlation: PendingCorrelation,
    ) -> bool {
        use std::collections::hash_map::Entry;
        match self.pending.lock().await.entry(process_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(correlation);
                true
            }
        }
    }

    pub async fn take_pending(&self, process_id: &ProcessId) -> Option<PendingCorrelation> {
        self.pending.lock().await.remove(process_id)
    }

    pub async fn take_pending_for_sandbox(
        &self,
        sandbox_id: &SandboxId,
    ) -> Vec<(ProcessId, PendingCorrelation)> {
        let mut pending = self.pending.lock().await;
        let ids: Vec<ProcessId> = pending
            .iter()
            .filter(|(_, c)| c.sandbox_id == *sandbox_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|c| (id, c)))
            .collect()
    }

    pub async fn drain_pending(&self) -> Vec<(ProcessId, PendingCorrelation)> {
        self.pending.lock().await.drain().collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}
