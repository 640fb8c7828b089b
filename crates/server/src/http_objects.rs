use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    data_model::{CommandResult, Sandbox, SandboxConfiguration, SandboxStatus},
    dispatcher::DispatchError,
    utils::format_timespan,
};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn internal_error_str(message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self::internal_error_str(&format!("command dispatch failed: {err}"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    #[serde(default)]
    pub configuration: Option<SandboxConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxResponse {
    pub id: String,
    pub status: SandboxStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDetail {
    pub id: String,
    pub status: SandboxStatus,
    pub public_ip: Option<String>,
    pub configuration: SandboxConfiguration,
}

impl From<Sandbox> for SandboxDetail {
    fn from(sandbox: Sandbox) -> Self {
        Self {
            id: sandbox.id.get().to_string(),
            status: sandbox.status,
            public_ip: sandbox.public_ip,
            configuration: sandbox.configuration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    pub id: String,
    pub status: SandboxStatus,
    pub public_ip: Option<String>,
    pub created_at: u64,
}

impl From<Sandbox> for SandboxSummary {
    fn from(sandbox: Sandbox) -> Self {
        Self {
            id: sandbox.id.get().to_string(),
            status: sandbox.status,
            public_ip: sandbox.public_ip,
            created_at: sandbox.created_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListSandboxesResponse {
    pub sandboxes: Vec<SandboxSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandRequest {
    pub sandbox_id: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandResponse {
    pub process_id: String,
    pub command: String,
    pub is_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub exit_code: i32,
    pub standard_output: String,
    pub standard_error: String,
    /// `hh:mm:ss.fffffff` rendering of the command duration.
    pub duration: String,
}

impl From<CommandResult> for CommandResultPayload {
    fn from(result: CommandResult) -> Self {
        Self {
            exit_code: result.exit_code,
            standard_output: result.stdout,
            standard_error: result.stderr,
            duration: format_timespan(Duration::from_millis(result.duration_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusResponse {
    pub process_id: String,
    pub is_running: bool,
    pub result: Option<CommandResultPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandLogsResponse {
    pub log_lines: Vec<String>,
}
