pub mod commands;
pub mod routes_state;
pub mod sandboxes;

use axum::{
    routing::{delete, get, post},
    Router,
};
use commands::{command_logs, command_status, submit_command, terminate_command};
use routes_state::RouteState;
use sandboxes::{create_sandbox, delete_sandbox, get_sandbox, list_sandboxes};
use utoipa::OpenApi;

use crate::http_objects::{
    ApiError, CommandLogsResponse, CommandResultPayload, CommandStatusResponse,
    CreateSandboxRequest, CreateSandboxResponse, ListSandboxesResponse, MessageResponse,
    SandboxDetail, SandboxSummary, SubmitCommandRequest, SubmitCommandResponse,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        sandboxes::create_sandbox,
        sandboxes::list_sandboxes,
        sandboxes::get_sandbox,
        sandboxes::delete_sandbox,
        commands::submit_command,
        commands::command_status,
        commands::command_logs,
        commands::terminate_command,
    ),
    components(
        schemas(
            ApiError,
            CreateSandboxRequest,
            CreateSandboxResponse,
            SandboxDetail,
            SandboxSummary,
            ListSandboxesResponse,
            MessageResponse,
            SubmitCommandRequest,
            SubmitCommandResponse,
            CommandStatusResponse,
            CommandResultPayload,
            CommandLogsResponse,
        )
    ),
    tags(
        (name = "sandboxes", description = "Sandbox lifecycle API"),
        (name = "commands", description = "Command execution API")
    )
)]
pub struct ApiDoc;

pub fn create_routes(route_state: RouteState) -> Router {
    let api_routes = Router::new()
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route("/sandboxes/{id}", get(get_sandbox).delete(delete_sandbox))
        .route("/sandboxes/{id}/commands", post(submit_command))
        .route("/sandboxes/{id}/commands/{pid}", delete(terminate_command))
        .route(
            "/sandboxes/{id}/commands/{pid}/status",
            get(command_status),
        )
        .route("/sandboxes/{id}/commands/{pid}/logs", get(command_logs));

    Router::new()
        .route(
            "/docs/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        )
        .nest("/api", api_routes)
        .with_state(route_state)
}
