use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use service::Service;

mod agent_api;
mod agents;
mod cloud;
mod config;
mod data_model;
mod dispatcher;
mod http_objects;
mod processes;
mod routes;
mod routes_internal;
mod sandboxes;
mod service;
mod state_store;
mod tracing;
mod utils;
use tracing::setup_tracing;

#[cfg(test)]
mod integration_test_http_routes;
#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::ServerConfig::from_path(path.to_str().unwrap())?,
        None => config::ServerConfig::default(),
    };

    setup_tracing(&config)?;

    let mut service = Service::new(config, Arc::new(cloud::DevCloudProvider))
        .context("Failed to create service")?;
    service.start().await.context("Failed to start service")
}
