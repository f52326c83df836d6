//! Error types for the container runtime and provisioning, plus plain-text
//! error responses for the gateway

use crate::proxy::{full_body, GatewayBody};
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Failure reported by a container runtime operation
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("`{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failure while provisioning a session
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: RuntimeError,
    },

    #[error("container {container} is not running after start; recent logs:\n{logs}")]
    ContainerExited { container: String, logs: String },

    #[error("could not resolve compose role '{role}': {detail}")]
    RoleUnresolved { role: String, detail: String },

    #[error("failed to allocate a free host port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("session id collision: {0}")]
    IdCollision(String),

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("provisioning task stopped before finishing")]
    Interrupted,
}

impl ProvisionError {
    /// Name of the failed step, where one applies
    pub fn step(&self) -> Option<&str> {
        match self {
            ProvisionError::StepFailed { step, .. } => Some(step),
            ProvisionError::ContainerExited { .. } => Some("verify running"),
            ProvisionError::RoleUnresolved { .. } => Some("resolve compose roles"),
            ProvisionError::PortAllocation(_) => Some("allocate host port"),
            ProvisionError::IdCollision(_)
            | ProvisionError::ShuttingDown
            | ProvisionError::Interrupted => None,
        }
    }
}

/// Error codes carried in the X-Gateway-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// No route for the requested path
    NotFound,
    /// Session exists but its entry point is not reachable yet
    SessionStarting,
    /// Method not supported on this route
    MethodNotAllowed,
    /// Session did not answer within the request timeout
    UpstreamTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::SessionStarting => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::SessionStarting => "SESSION_STARTING",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Plain-text error response with X-Gateway-Error header
pub fn text_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Cache-Control", "no-store")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}
