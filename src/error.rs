//! Hadron connect error abstractions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// Application error variants surfaced by the control plane.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The resource specified in the path is not found.
    #[error("the resource specified in the path is not found")]
    ResourceNotFound,
    /// The requested action conflicts with the current state of the resource.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Another state-changing command is already in flight for the target pipeline.
    #[error("another command is already in flight for this pipeline")]
    Busy,
    /// The requested state transition was not observed within the command timeout.
    #[error("timeout waiting for pipeline to reach state {0}")]
    Timeout(String),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

impl AppError {
    /// The HTTP status code of this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::ResourceNotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::Busy => StatusCode::CONFLICT,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Ise(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Translate the given error as an app error.
    pub fn http(err: anyhow::Error) -> Self {
        err.downcast::<Self>()
            .or_else(|err| err.downcast::<ConfigError>().map(|err| Self::InvalidInput(err.0)))
            .unwrap_or_else(Self::Ise)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Ise(err) = &self {
            tracing::error!(error = ?err, "internal error while handling request");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// A result type used by the HTTP handlers.
pub type HttpResult<T> = ::std::result::Result<T, AppError>;

/// A failure to decode or encode a record.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("format error{}: {message}", record_suffix(.record))]
pub struct FormatError {
    /// The zero-based index of the offending record within its payload, if known.
    pub record: Option<usize>,
    /// A description of the failure.
    pub message: String,
}

impl FormatError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { record: None, message: message.into() }
    }

    pub fn at(record: usize, message: impl Into<String>) -> Self {
        Self {
            record: Some(record),
            message: message.into(),
        }
    }
}

fn record_suffix(record: &Option<usize>) -> String {
    match record {
        Some(idx) => format!(" in record {}", idx),
        None => String::new(),
    }
}

/// A transport fault raised by a connector.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// A retryable transport fault, such as a timeout or an unavailable broker.
    #[error("transient transport error: {0}")]
    Transient(String),
    /// The retry budget was exhausted or the fault is unrecoverable.
    #[error("permanent transport error: {0}")]
    Permanent(String),
}

/// An invalid or incompatible configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// An error propagated from the computation engine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("engine error: {0}")]
pub struct EngineError(pub String);

/// The union of faults which transition a pipeline to `Failed`.
#[derive(Clone, Debug, Error)]
pub enum PipelineError {
    #[error("connector {connector}: {error}")]
    Format { connector: String, error: FormatError },
    #[error("connector {connector}: {error}")]
    Connector { connector: String, error: ConnectorError },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn connector(connector: &str, error: ConnectorError) -> Self {
        Self::Connector {
            connector: connector.into(),
            error,
        }
    }

    pub fn format(connector: &str, error: FormatError) -> Self {
        Self::Format {
            connector: connector.into(),
            error,
        }
    }
}
