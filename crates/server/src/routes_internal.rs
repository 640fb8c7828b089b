use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::{agents::AgentSummary, routes::routes_state::RouteState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentsResponse {
    agents: Vec<AgentSummary>,
}

async fn healthz() -> &'static str {
    "ok"
}

/// Operator view of the live agent fleet; not part of the client surface.
async fn list_agents(State(state): State<RouteState>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: state.agents.list_active().await,
    })
}

pub fn configure_internal_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/internal/agents", get(list_agents))
        .with_state(route_state)
}
