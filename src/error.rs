//! Shared error kinds surfaced by the core.
//!
//! Every fallible boundary in the daemon (catalog lookups, allocation,
//! container operations, proxying) reports one of these variants. HTTP
//! handlers map them onto status codes and the two wire-level error
//! envelopes (OpenAI-style and Anthropic-style).

use axum::http::StatusCode;

/// Errors produced by the scheduler, allocators, and request router.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("instance unhealthy: {0}")]
    Unhealthy(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status this error maps to on the management and OpenAI routes.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::Unhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error type string used in the Anthropic error envelope.
    pub fn anthropic_kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found_error",
            Error::Invalid(_) => "invalid_request_error",
            Error::ResourceExhausted(_) | Error::Cancelled(_) => "overloaded_error",
            _ => "api_error",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
