use std::sync::Arc;

use crate::{
    agents::AgentManager,
    config::ServerConfig,
    dispatcher::CommandDispatcher,
    processes::ProcessRegistry,
    sandboxes::SandboxManager,
    state_store::OrchestratorState,
};

#[derive(Clone)]
pub struct RouteState {
    pub config: Arc<ServerConfig>,
    pub state: Arc<OrchestratorState>,
    pub agents: Arc<AgentManager>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub sandboxes: Arc<SandboxManager>,
    pub processes: Arc<ProcessRegistry>,
}
