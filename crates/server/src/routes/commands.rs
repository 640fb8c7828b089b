use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    data_model::{ProcessId, Sandbox, SandboxId, SandboxStatus},
    dispatcher::CommandSpec,
    http_objects::{
        ApiError, CommandLogsResponse, CommandStatusResponse, MessageResponse,
        SubmitCommandRequest, SubmitCommandResponse,
    },
    routes::routes_state::RouteState,
};

/// Resolve the sandbox for a command endpoint. A sandbox that is being torn
/// down no longer has processes, so it reads as not found here even though
/// `GET /api/sandboxes/{id}` still shows the record.
async fn resolve_sandbox(state: &RouteState, id: &str) -> Result<Sandbox, ApiError> {
    let sandbox = state
        .sandboxes
        .get_sandbox(&SandboxId::from(id))
        .await
        .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
    if matches!(
        sandbox.status,
        SandboxStatus::Stopping | SandboxStatus::Deleted
    ) {
        return Err(ApiError::not_found("sandbox not found"));
    }
    Ok(sandbox)
}

/// Submit a command for execution in the sandbox. Returns immediately with
/// the process id; poll the status endpoint for the result.
#[utoipa::path(
    post,
    path = "/api/sandboxes/{id}/commands",
    tag = "commands",
    request_body = SubmitCommandRequest,
    responses(
        (status = 200, description = "Command submitted", body = SubmitCommandResponse),
        (status = 400, description = "Body and URL sandbox ids differ"),
        (status = 404, description = "Sandbox not found"),
        (status = 500, description = "No ready agent or agent write failure")
    ),
)]
pub async fn submit_command(
    Path(id): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<SubmitCommandRequest>,
) -> Result<Json<SubmitCommandResponse>, ApiError> {
    if request.sandbox_id != id {
        return Err(ApiError::bad_request(
            "sandbox id in body does not match url",
        ));
    }
    let sandbox = resolve_sandbox(&state, &id).await?;

    let submitted = state
        .processes
        .submit(&sandbox.id, CommandSpec::new(request.command))
        .await?;

    Ok(Json(SubmitCommandResponse {
        process_id: submitted.process_id.get().to_string(),
        command: submitted.command,
        is_running: submitted.is_running,
    }))
}

/// Status of a submitted command; `result` is set once it left the running
/// state.
#[utoipa::path(
    get,
    path = "/api/sandboxes/{id}/commands/{pid}/status",
    tag = "commands",
    responses(
        (status = 200, description = "Command status", body = CommandStatusResponse),
        (status = 404, description = "Sandbox or process not found")
    ),
)]
pub async fn command_status(
    Path((id, pid)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<CommandStatusResponse>, ApiError> {
    let sandbox = resolve_sandbox(&state, &id).await?;
    let status = state
        .processes
        .get_status(&sandbox.id, &ProcessId::from(pid.as_str()))
        .await
        .ok_or_else(|| ApiError::not_found("process not found"))?;

    Ok(Json(CommandStatusResponse {
        process_id: status.process_id.get().to_string(),
        is_running: status.is_running,
        result: status.result.map(Into::into),
    }))
}

/// All log lines accumulated for the process so far.
#[utoipa::path(
    get,
    path = "/api/sandboxes/{id}/commands/{pid}/logs",
    tag = "commands",
    responses(
        (status = 200, description = "Accumulated log lines", body = CommandLogsResponse),
        (status = 404, description = "Sandbox or process not found")
    ),
)]
pub async fn command_logs(
    Path((id, pid)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<CommandLogsResponse>, ApiError> {
    let sandbox = resolve_sandbox(&state, &id).await?;
    let log_lines = state
        .processes
        .get_logs(&sandbox.id, &ProcessId::from(pid.as_str()))
        .await
        .ok_or_else(|| ApiError::not_found("process not found"))?;

    Ok(Json(CommandLogsResponse { log_lines }))
}

/// Terminate a running command: signals the agent and cancels the waiting
/// correlation immediately.
#[utoipa::path(
    delete,
    path = "/api/sandboxes/{id}/commands/{pid}",
    tag = "commands",
    responses(
        (status = 200, description = "Termination accepted", body = MessageResponse),
        (status = 404, description = "Sandbox or process not found")
    ),
)]
pub async fn terminate_command(
    Path((id, pid)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<MessageResponse>, ApiError> {
    let sandbox = resolve_sandbox(&state, &id).await?;
    state
        .processes
        .terminate(&sandbox.id, &ProcessId::from(pid.as_str()))
        .await
        .map_err(|_| ApiError::not_found("process not found"))?;

    Ok(Json(MessageResponse {
        message: format!("process {pid} termination accepted"),
    }))
}
