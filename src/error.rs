//! Error taxonomy for the supervisor and its HTTP mapping

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;

/// Every failure a supervisor operation can report
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Missing or malformed request field
    #[error("{0}")]
    Validation(String),

    /// Name already belongs to a live instance
    #[error("name is already taken: {0}")]
    Conflict(String),

    /// No live instance with this name
    #[error("no instance named '{0}'")]
    NotFound(String),

    /// Every port in the range is occupied
    #[error("no free port in range {min}..{max}")]
    ResourceExhausted { min: u16, max: u16 },

    /// Backend executable missing or refused by the OS
    #[error("failed to spawn '{program}' for '{name}': {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Termination signal could not be delivered or the process not reaped
    #[error("failed to terminate pid {pid}: {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// State snapshot could not be read or written
    #[error("state file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Supervisor is stopping and no longer starts backends
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// Stored record the supervisor cannot act on
    #[error("{0}")]
    Internal(String),

    /// State snapshot is not a valid document
    #[error("state file {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },
}

/// Stable error codes sent in the X-Portwarden-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    Conflict,
    NotFound,
    ResourceExhausted,
    SpawnFailed,
    TerminateFailed,
    StateIo,
    ShuttingDown,
    Internal,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::Conflict => StatusCode::BAD_REQUEST,
            ErrorCode::ResourceExhausted => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::SpawnFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::TerminateFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StateIo => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::TerminateFailed => "TERMINATE_FAILED",
            ErrorCode::StateIo => "STATE_IO",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl SupervisorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::Validation(_) => ErrorCode::Validation,
            SupervisorError::Conflict(_) => ErrorCode::Conflict,
            SupervisorError::NotFound(_) => ErrorCode::NotFound,
            SupervisorError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            SupervisorError::Spawn { .. } => ErrorCode::SpawnFailed,
            SupervisorError::Terminate { .. } => ErrorCode::TerminateFailed,
            SupervisorError::Io { .. } | SupervisorError::Parse { .. } => ErrorCode::StateIo,
            SupervisorError::ShuttingDown => ErrorCode::ShuttingDown,
            SupervisorError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Plain-text error response carrying the error code header.
///
/// Client errors echo the reason; internal errors only name the code so OS
/// details stay in the supervisor's log.
pub fn error_response(err: &SupervisorError) -> Response<Full<Bytes>> {
    let code = err.code();
    let status = code.status_code();
    let body = if status.is_client_error() {
        err.to_string()
    } else {
        code.as_header_value().to_lowercase()
    };

    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .header("X-Portwarden-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
