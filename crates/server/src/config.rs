use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub env: String,
    /// REST listen address.
    pub listen_addr: String,
    /// Agent RPC listen address.
    pub listen_addr_grpc: String,
    /// Endpoint agents reach the orchestrator at. Baked into provisioned VMs
    /// so the booting agent knows where to phone home.
    pub external_grpc_endpoint: String,
    /// Interval agents are told to heartbeat at, returned by RegisterAgent.
    pub heartbeat_interval_secs: u64,
    /// Agents whose last heartbeat is older than this are excluded from
    /// dispatch.
    pub stale_threshold_secs: u64,
    /// Cadence of the background sweep that marks stale agents unreachable.
    pub sweep_interval_secs: u64,
    /// Timeout applied to commands submitted without one.
    pub default_command_timeout_secs: u64,
    /// Image used for sandboxes created without a configuration. Built on
    /// demand through the cloud provider when unset.
    pub default_image: Option<String>,
    pub instance_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:5000".to_string(),
            listen_addr_grpc: "0.0.0.0:5001".to_string(),
            external_grpc_endpoint: "http://127.0.0.1:5001".to_string(),
            heartbeat_interval_secs: 30,
            stale_threshold_secs: 120,
            sweep_interval_secs: 30,
            default_command_timeout_secs: 300,
            default_image: None,
            instance_id: None,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.listen_addr_grpc.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address grpc: {}",
                self.listen_addr_grpc
            ));
        }
        if self.stale_threshold_secs < self.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "stale threshold ({}s) must not be shorter than the heartbeat interval ({}s)",
                self.stale_threshold_secs,
                self.heartbeat_interval_secs
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn default_command_timeout(&self) -> Duration {
        Duration::from_secs(self.default_command_timeout_secs)
    }
}
