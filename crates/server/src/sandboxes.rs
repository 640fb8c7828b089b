use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::{
    agents::AgentManager,
    cloud::CloudProvider,
    config::ServerConfig,
    data_model::{
        CancelReason, Sandbox, SandboxBuilder, SandboxConfiguration, SandboxId, SandboxStatus,
    },
    dispatcher::CommandDispatcher,
    state_store::OrchestratorState,
};

#[derive(Debug, thiserror::Error)]
#[error("sandbox not found: {0}")]
pub struct SandboxNotFound(pub SandboxId);

/// Owns the sandbox registry and drives sandbox lifecycle against the cloud
/// provider. Provisioning and deletion both finish in detached tasks; the
/// REST surface acknowledges acceptance, not completion.
pub struct SandboxManager {
    state: Arc<OrchestratorState>,
    agents: Arc<AgentManager>,
    dispatcher: Arc<CommandDispatcher>,
    provider: Arc<dyn CloudProvider>,
    external_endpoint: String,
    /// Memoized default image id; the mutex doubles as the single-flight
    /// guard so concurrent first-creates coalesce on one build.
    default_image: Mutex<Option<String>>,
}

impl SandboxManager {
    pub fn new(
        state: Arc<OrchestratorState>,
        agents: Arc<AgentManager>,
        dispatcher: Arc<CommandDispatcher>,
        provider: Arc<dyn CloudProvider>,
        config: &ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            agents,
            dispatcher,
            provider,
            external_endpoint: config.external_grpc_endpoint.clone(),
            default_image: Mutex::new(config.default_image.clone()),
        })
    }

    /// Insert the record and kick off provisioning in the background.
    /// Returns as soon as the record exists, always in Creating.
    pub async fn create_sandbox(
        self: &Arc<Self>,
        configuration: Option<SandboxConfiguration>,
    ) -> Result<(SandboxId, SandboxStatus)> {
        let configuration = configuration.unwrap_or_default();
        let sandbox = SandboxBuilder::default()
            .status(SandboxStatus::Creating)
            .configuration(configuration)
            .build()
            .context("building sandbox record")?;
        let sandbox_id = sandbox.id.clone();
        self.state.insert_sandbox(sandbox).await;

        info!(sandbox_id = %sandbox_id, "sandbox created, provisioning in background");

        let manager = self.clone();
        let id = sandbox_id.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.provision(&id).await {
                error!(sandbox_id = %id, "provisioning failed: {err:?}");
                manager.set_status_unless_deleted(&id, SandboxStatus::Error).await;
            }
        });

        Ok((sandbox_id, SandboxStatus::Creating))
    }

    async fn provision(&self, sandbox_id: &SandboxId) -> Result<()> {
        let record = self
            .state
            .sandbox(sandbox_id)
            .await
            .ok_or_else(|| SandboxNotFound(sandbox_id.clone()))?;

        let mut configuration = record.read().await.configuration.clone();
        if configuration.image.is_none() {
            let image = self.ensure_default_image().await?;
            configuration.image = Some(image);
            record.write().await.configuration = configuration.clone();
        }

        let provisioned = self
            .provider
            .create_sandbox(sandbox_id, &configuration, &self.external_endpoint)
            .await
            .context("cloud provider create failed")?;

        let mut sandbox = record.write().await;
        // A delete that raced the provisioner wins; don't resurrect the record.
        if sandbox.status == SandboxStatus::Creating {
            sandbox.vm_handle = Some(provisioned.vm_handle);
            sandbox.public_ip = provisioned.public_ip;
            sandbox.status = SandboxStatus::Starting;
            info!(sandbox_id = %sandbox.id, "vm provisioned, waiting for agent");
        }
        Ok(())
    }

    /// Default image id, building it through the provider on first use. The
    /// lock is held across the build so at most one build runs per process.
    async fn ensure_default_image(&self) -> Result<String> {
        let mut default_image = self.default_image.lock().await;
        if let Some(image) = default_image.as_ref() {
            return Ok(image.clone());
        }
        info!("building default sandbox image");
        let image = self
            .provider
            .build_default_image(&self.external_endpoint)
            .await
            .context("cloud provider image build failed")?;
        info!(image = %image, "default sandbox image built");
        *default_image = Some(image.clone());
        Ok(image)
    }

    pub async fn get_sandbox(&self, sandbox_id: &SandboxId) -> Option<Sandbox> {
        let record = self.state.sandbox(sandbox_id).await?;
        let sandbox = record.read().await.clone();
        Some(sandbox)
    }

    pub async fn list_sandboxes(&self) -> Vec<Sandbox> {
        let mut sandboxes = Vec::new();
        for record in self.state.list_sandboxes().await {
            sandboxes.push(record.read().await.clone());
        }
        sandboxes.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        sandboxes
    }

    /// A sandbox is ready iff a ready-and-fresh agent with a live downstream
    /// stream exists for it.
    pub async fn is_sandbox_ready(&self, sandbox_id: &SandboxId) -> bool {
        self.agents.find_ready_agent(sandbox_id).await.is_some()
    }

    /// Accepts the deletion and finishes it in the background: pending
    /// commands are cancelled and the sandbox's agents and processes removed
    /// immediately; the provider call and the terminal status land later.
    pub async fn delete_sandbox(self: &Arc<Self>, sandbox_id: &SandboxId) -> Result<(), SandboxNotFound> {
        let record = self
            .state
            .sandbox(sandbox_id)
            .await
            .ok_or_else(|| SandboxNotFound(sandbox_id.clone()))?;

        let vm_handle = {
            let mut sandbox = record.write().await;
            if matches!(sandbox.status, SandboxStatus::Stopping | SandboxStatus::Deleted) {
                return Ok(());
            }
            sandbox.status = SandboxStatus::Stopping;
            sandbox.vm_handle.clone()
        };

        self.dispatcher
            .cancel_for_sandbox(sandbox_id, CancelReason::SandboxDeleted)
            .await;
        let removed_agents = self.state.remove_agents_for_sandbox(sandbox_id).await;
        let removed_processes = self.state.remove_processes_for_sandbox(sandbox_id).await;
        info!(
            sandbox_id = %sandbox_id,
            agents = removed_agents.len(),
            processes = removed_processes,
            "sandbox stopping"
        );

        let manager = self.clone();
        let id = sandbox_id.clone();
        tokio::spawn(async move {
            let result = match vm_handle {
                Some(handle) => manager.provider.delete_sandbox(&handle).await,
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    manager.set_status(&id, SandboxStatus::Deleted).await;
                    info!(sandbox_id = %id, "sandbox deleted");
                }
                Err(err) => {
                    manager.set_status(&id, SandboxStatus::Error).await;
                    error!(sandbox_id = %id, "sandbox deletion failed: {err:?}");
                }
            }
        });

        Ok(())
    }

    async fn set_status(&self, sandbox_id: &SandboxId, status: SandboxStatus) {
        if let Some(record) = self.state.sandbox(sandbox_id).await {
            record.write().await.status = status;
        }
    }

    async fn set_status_unless_deleted(&self, sandbox_id: &SandboxId, status: SandboxStatus) {
        if let Some(record) = self.state.sandbox(sandbox_id).await {
            let mut sandbox = record.write().await;
            if !matches!(
                sandbox.status,
                SandboxStatus::Stopping | SandboxStatus::Deleted
            ) {
                sandbox.status = status;
            }
        }
    }
}
