use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::Router;
use axum_server::Handle;
use hyper::Method;
use proto_api::{
    agent_api_pb::agent_api_server::AgentApiServer, descriptor as agent_api_descriptor,
};
use tokio::{
    signal,
    sync::watch,
};
use tonic::transport::Server;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    agent_api::AgentApiService,
    agents::AgentManager,
    cloud::CloudProvider,
    config::ServerConfig,
    dispatcher::CommandDispatcher,
    processes::ProcessRegistry,
    routes::{create_routes, routes_state::RouteState},
    routes_internal::configure_internal_routes,
    sandboxes::SandboxManager,
    state_store::OrchestratorState,
};

pub struct Service {
    pub config: Arc<ServerConfig>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state: Arc<OrchestratorState>,
    pub agents: Arc<AgentManager>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub sandboxes: Arc<SandboxManager>,
    pub processes: Arc<ProcessRegistry>,
}

impl Service {
    pub fn new(config: ServerConfig, provider: Arc<dyn CloudProvider>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let state = OrchestratorState::new();
        let agents = AgentManager::new(state.clone(), &config);
        let dispatcher = CommandDispatcher::new(state.clone(), agents.clone(), &config);
        let sandboxes = SandboxManager::new(
            state.clone(),
            agents.clone(),
            dispatcher.clone(),
            provider,
            &config,
        );
        let processes = ProcessRegistry::new(state.clone(), agents.clone(), dispatcher.clone());

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state,
            agents,
            dispatcher,
            sandboxes,
            processes,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            config: self.config.clone(),
            state: self.state.clone(),
            agents: self.agents.clone(),
            dispatcher: self.dispatcher.clone(),
            sandboxes: self.sandboxes.clone(),
            processes: self.processes.clone(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        let sweeper = self.agents.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            sweeper.start_sweeper(shutdown_rx).await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr_grpc: SocketAddr = self.config.listen_addr_grpc.parse()?;
        let mut grpc_shutdown_rx = self.shutdown_rx.clone();
        let agent_api = AgentApiService::new(
            self.state.clone(),
            self.agents.clone(),
            self.dispatcher.clone(),
            self.processes.clone(),
        );
        tokio::spawn(async move {
            info!("agent grpc listening on {}", addr_grpc);
            let reflection_service = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(
                    agent_api_descriptor::AGENT_API_FILE_DESCRIPTOR_SET,
                )
                .build_v1()
                .expect("building reflection service");

            let result = Server::builder()
                .add_service(AgentApiServer::new(agent_api))
                .add_service(reflection_service)
                .serve_with_shutdown(addr_grpc, async move {
                    grpc_shutdown_rx.changed().await.ok();
                })
                .await;
            if let Err(err) = result {
                tracing::error!("agent grpc server exited with error: {err:?}");
            }
        });

        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_origin(Any)
            .allow_headers(Any);

        let router = Router::new()
            .merge(create_routes(self.route_state()))
            .merge(configure_internal_routes(self.route_state()))
            .layer(TraceLayer::new_for_http())
            .layer(cors);

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(router.into_make_service())
            .await?;

        // REST handlers are drained; fail every caller still waiting on an
        // agent before exiting.
        self.dispatcher.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    shutdown_tx.send(()).ok();
    info!("signal received, shutting down server gracefully");
}
