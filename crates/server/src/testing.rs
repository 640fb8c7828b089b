use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use proto_api::agent_api_pb::CommandRequest;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    agent_api::AgentApiService,
    agents::RegisterAgentSpec,
    cloud::{CloudProvider, ProvisionedSandbox},
    config::ServerConfig,
    data_model::{AgentId, SandboxConfiguration, SandboxId, SandboxStatus, VmHandle},
    service::Service,
};

/// Scriptable provider for tests: records calls, can be told to fail.
pub struct MockCloudProvider {
    pub created: Mutex<Vec<SandboxId>>,
    pub deleted: Mutex<Vec<VmHandle>>,
    pub image_builds: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl MockCloudProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            image_builds: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn create_sandbox(
        &self,
        sandbox_id: &SandboxId,
        _configuration: &SandboxConfiguration,
        _orchestrator_endpoint: &str,
    ) -> Result<ProvisionedSandbox> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("mock provider create failure");
        }
        self.created.lock().await.push(sandbox_id.clone());
        Ok(ProvisionedSandbox {
            vm_handle: VmHandle::new(format!("mock-vm-{sandbox_id}")),
            public_ip: Some("10.0.0.5".to_string()),
        })
    }

    async fn build_default_image(&self, _orchestrator_endpoint: &str) -> Result<String> {
        self.image_builds.fetch_add(1, Ordering::SeqCst);
        Ok("mock-image".to_string())
    }

    async fn delete_sandbox(&self, vm_handle: &VmHandle) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            anyhow::bail!("mock provider delete failure");
        }
        self.deleted.lock().await.push(vm_handle.clone());
        Ok(())
    }
}

pub struct TestService {
    pub service: Service,
    pub provider: Arc<MockCloudProvider>,
}

impl TestService {
    pub fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let provider = MockCloudProvider::new();
        let service = Service::new(ServerConfig::default(), provider.clone())?;
        Ok(Self { service, provider })
    }

    pub fn agent_api(&self) -> AgentApiService {
        AgentApiService::new(
            self.service.state.clone(),
            self.service.agents.clone(),
            self.service.dispatcher.clone(),
            self.service.processes.clone(),
        )
    }

    /// Register an agent and attach a downstream stream directly through the
    /// manager, standing in for the RegisterAgent + GetCommands RPC pair.
    /// The returned receiver is the fake agent's command inbox.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        sandbox_id: &SandboxId,
    ) -> mpsc::Receiver<Result<CommandRequest, tonic::Status>> {
        self.service
            .agents
            .register(RegisterAgentSpec {
                agent_id: AgentId::from(agent_id),
                sandbox_id: sandbox_id.clone(),
                vm_id: format!("vm-{agent_id}"),
                agent_version: "1.0.0".to_string(),
                metadata: HashMap::new(),
            })
            .await;
        let (tx, rx) = mpsc::channel(1024);
        self.service
            .agents
            .attach_downstream(&AgentId::from(agent_id), tx)
            .await
            .expect("agent just registered");
        rx
    }

    /// Create a sandbox and wait for the background provisioner to finish.
    pub async fn create_provisioned_sandbox(&self) -> SandboxId {
        let (sandbox_id, status) = self
            .service
            .sandboxes
            .create_sandbox(None)
            .await
            .expect("create sandbox");
        assert_eq!(status, SandboxStatus::Creating);
        self.wait_for_status(&sandbox_id, SandboxStatus::Starting)
            .await;
        sandbox_id
    }

    pub async fn wait_for_status(&self, sandbox_id: &SandboxId, expected: SandboxStatus) {
        for _ in 0..10_000 {
            if let Some(sandbox) = self.service.sandboxes.get_sandbox(sandbox_id).await {
                if sandbox.status == expected {
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
        panic!("sandbox {sandbox_id} never reached {expected}");
    }
}
