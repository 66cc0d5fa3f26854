//! Error types for the document server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised by the session/connection lifecycle manager.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid server setup. Fatal at construction time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Request Host header is not in the whitelist.
    #[error("Request host '{host}' not in whitelist")]
    ForbiddenHost { host: String },

    /// Unknown application path.
    #[error("Application {0} does not exist on this server")]
    NotFound(String),

    /// The session was discarded before a connection could attach to it.
    #[error("Session {session_id} of {app_path} was discarded")]
    SessionExpired { app_path: String, session_id: String },

    /// An offloaded background task failed or was abandoned.
    #[error("Background task failed: {0}")]
    WorkerFailure(String),

    /// The server is not in the `Running` state.
    #[error("Server is not accepting new work")]
    NotAccepting,

    /// Sending a frame on a client transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::ForbiddenHost { .. } => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::SessionExpired { .. } => StatusCode::GONE,
            ServerError::NotAccepting => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
