use anyhow::Result;
use async_trait::async_trait;
use nanoid::nanoid;
use tracing::info;

use crate::data_model::{SandboxConfiguration, SandboxId, VmHandle};

pub struct ProvisionedSandbox {
    pub vm_handle: VmHandle,
    pub public_ip: Option<String>,
}

/// Provisioning boundary. The core only ever asks for a VM with a sandbox id
/// and the orchestrator endpoint baked in, a base image build, and deletion;
/// credentials and cloud specifics live entirely behind this trait.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provision a VM for the sandbox. `orchestrator_endpoint` must be
    /// embedded in the VM's boot metadata so the booting agent knows where to
    /// connect.
    async fn create_sandbox(
        &self,
        sandbox_id: &SandboxId,
        configuration: &SandboxConfiguration,
        orchestrator_endpoint: &str,
    ) -> Result<ProvisionedSandbox>;

    /// Build the base image used for sandboxes created without an explicit
    /// configuration. Called at most once per orchestrator process; the
    /// result is memoized by the sandbox manager. May take minutes.
    async fn build_default_image(&self, orchestrator_endpoint: &str) -> Result<String>;

    async fn delete_sandbox(&self, vm_handle: &VmHandle) -> Result<()>;
}

/// Local development provider: hands out synthetic VM handles without
/// touching any cloud. Lets the orchestrator run end-to-end with agents
/// started by hand against the local gRPC endpoint.
pub struct DevCloudProvider;

#[async_trait]
impl CloudProvider for DevCloudProvider {
    async fn create_sandbox(
        &self,
        sandbox_id: &SandboxId,
        configuration: &SandboxConfiguration,
        orchestrator_endpoint: &str,
    ) -> Result<ProvisionedSandbox> {
        let vm_handle = VmHandle::new(format!("dev-vm-{}", nanoid!(8)));
        info!(
            sandbox_id = %sandbox_id,
            vm_handle = %vm_handle,
            image = ?configuration.image,
            orchestrator_endpoint,
            "dev provider: pretending to provision a vm"
        );
        Ok(ProvisionedSandbox {
            vm_handle,
            public_ip: None,
        })
    }

    async fn build_default_image(&self, orchestrator_endpoint: &str) -> Result<String> {
        info!(orchestrator_endpoint, "dev provider: returning stock image id");
        Ok("cordon-dev-image".to_string())
    }

    async fn delete_sandbox(&self, vm_handle: &VmHandle) -> Result<()> {
        info!(vm_handle = %vm_handle, "dev provider: pretending to delete vm");
        Ok(())
    }
}
