//! Command error types for CLI output
//!
//! Errors serialize to `{"code": "...", "message": "..."}` so scripted callers
//! can match on the code.

use deckpilot_core::ClientError;
use serde::Serialize;

/// Errors returned by command handlers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CommandError {
    // Caller errors
    InvalidArgument { message: String },
    Validation { message: String },
    NotFound { message: String },

    // Backend errors
    NetworkError { message: String },
    ServerError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
    TaskTimedOut { message: String },
    TaskFailed { message: String },

    // Local errors
    StorageError { message: String },
    InternalError { message: String },
}

impl CommandError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self::NotFound {
            message: format!("{} not found: {}", what, id),
        }
    }

    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::TaskFailed {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument { message }
            | Self::Validation { message }
            | Self::NotFound { message }
            | Self::NetworkError { message }
            | Self::ServerError { message, .. }
            | Self::TaskTimedOut { message }
            | Self::TaskFailed { message }
            | Self::StorageError { message }
            | Self::InternalError { message } => message,
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for CommandError {}

impl From<ClientError> for CommandError {
    fn from(err: ClientError) -> Self {
        let message = err.user_message();
        match err {
            ClientError::Validation(_) => Self::Validation { message },
            ClientError::Transport(_) => Self::NetworkError { message },
            ClientError::Server { status: Some(404), .. } => Self::NotFound { message },
            ClientError::Server { status, .. } => Self::ServerError { message, status },
            ClientError::Timeout { .. } => Self::TaskTimedOut { message },
            ClientError::Decode(_) => Self::ServerError {
                message,
                status: None,
            },
            ClientError::SourceUnreadable(_) | ClientError::Image(_) => {
                Self::InvalidArgument { message }
            }
            ClientError::Io(_) => Self::StorageError { message },
        }
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

/// Result type alias for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// Extension trait for converting Results to CommandResult
pub trait ResultExt<T> {
    fn storage_err(self) -> CommandResult<T>;
    fn invalid_arg(self) -> CommandResult<T>;
    fn internal_err(self) -> CommandResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn storage_err(self) -> CommandResult<T> {
        self.map_err(|e| CommandError::storage(e.to_string()))
    }

    fn invalid_arg(self) -> CommandResult<T> {
        self.map_err(|e| CommandError::invalid_argument(e.to_string()))
    }

    fn internal_err(self) -> CommandResult<T> {
        self.map_err(|e| CommandError::internal(e.to_string()))
    }
}
