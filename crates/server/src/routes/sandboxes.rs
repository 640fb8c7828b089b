use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    data_model::SandboxId,
    http_objects::{
        ApiError, CreateSandboxRequest, CreateSandboxResponse, ListSandboxesResponse,
        MessageResponse, SandboxDetail, SandboxSummary,
    },
    routes::routes_state::RouteState,
};

/// Create a new sandbox. Provisioning runs in the background; the response
/// acknowledges acceptance with the record in Creating.
#[utoipa::path(
    post,
    path = "/api/sandboxes",
    tag = "sandboxes",
    request_body = CreateSandboxRequest,
    responses(
        (status = 200, description = "Sandbox created", body = CreateSandboxResponse),
        (status = 500, description = "Internal server error")
    ),
)]
pub async fn create_sandbox(
    State(state): State<RouteState>,
    body: Option<Json<CreateSandboxRequest>>,
) -> Result<Json<CreateSandboxResponse>, ApiError> {
    let configuration = body.and_then(|Json(req)| req.configuration);
    let (id, status) = state
        .sandboxes
        .create_sandbox(configuration)
        .await
        .map_err(ApiError::internal_error)?;

    Ok(Json(CreateSandboxResponse {
        id: id.get().to_string(),
        status,
    }))
}

/// List all known sandboxes, including deleted ones.
#[utoipa::path(
    get,
    path = "/api/sandboxes",
    tag = "sandboxes",
    responses(
        (status = 200, description = "List of sandboxes", body = ListSandboxesResponse),
    ),
)]
pub async fn list_sandboxes(
    State(state): State<RouteState>,
) -> Result<Json<ListSandboxesResponse>, ApiError> {
    let sandboxes = state
        .sandboxes
        .list_sandboxes()
        .await
        .into_iter()
        .map(SandboxSummary::from)
        .collect();
    Ok(Json(ListSandboxesResponse { sandboxes }))
}

/// Get a specific sandbox.
#[utoipa::path(
    get,
    path = "/api/sandboxes/{id}",
    tag = "sandboxes",
    responses(
        (status = 200, description = "Sandbox details", body = SandboxDetail),
        (status = 404, description = "Sandbox not found")
    ),
)]
pub async fn get_sandbox(
    Path(id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<SandboxDetail>, ApiError> {
    let sandbox = state
        .sandboxes
        .get_sandbox(&SandboxId::from(id.as_str()))
        .await
        .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
    Ok(Json(sandbox.into()))
}

/// Delete a sandbox. The VM teardown finishes in the background; the
/// response acknowledges acceptance.
#[utoipa::path(
    delete,
    path = "/api/sandboxes/{id}",
    tag = "sandboxes",
    responses(
        (status = 200, description = "Deletion accepted", body = MessageResponse),
        (status = 404, description = "Sandbox not found")
    ),
)]
pub async fn delete_sandbox(
    Path(id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .sandboxes
        .delete_sandbox(&SandboxId::from(id.as_str()))
        .await
        .map_err(|_| ApiError::not_found("sandbox not found"))?;
    Ok(Json(MessageResponse {
        message: format!("sandbox {id} deletion accepted"),
    }))
}
