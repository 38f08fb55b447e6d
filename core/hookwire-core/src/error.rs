//! Error kinds surfaced by the engine.
//!
//! Payload and configuration errors terminate an invocation. Guard and handler
//! errors are contained to the dispatch that raised them. A task that outlives
//! its TTL is never an error here; observers see `TaskOutcome::Failed("timeout")`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    /// The inbound payload is not JSON or has no recognizable `hook_event_name`.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Bad registration (unknown parameter, duplicate binding, ...).
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Guard '{binding}' failed: {message}")]
    GuardEvaluation { binding: String, message: String },

    #[error("Handler '{binding}' failed: {message}")]
    Handler { binding: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist temp file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl HookError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        HookError::Configuration(message.into())
    }

    /// Short machine-readable name, used as `error_type` in observability events.
    pub fn kind(&self) -> &'static str {
        match self {
            HookError::MalformedPayload(_) => "MalformedPayloadError",
            HookError::Configuration(_) => "ConfigurationError",
            HookError::GuardEvaluation { .. } => "GuardEvaluationError",
            HookError::Handler { .. } => "HandlerError",
            HookError::Io(_) => "IoError",
            HookError::Json(_) => "JsonError",
            HookError::Persist(_) => "PersistError",
        }
    }
}

pub type Result<T> = std::result::Result<T, HookError>;
