//! Client error taxonomy.
//!
//! Every error the client can observe falls into one of a few buckets that
//! the UI treats differently: transport failures get a generic message,
//! server failures are shown (normalised) verbatim, validation failures never
//! reach the network, and timeouts say that the wait ran out rather than why.

use std::time::Duration;

use thiserror::Error;

/// Generic text shown for transport failures.
pub const NETWORK_ERROR_MESSAGE: &str = "Network error, please check the connection and try again";

/// Fallback when the server gave no message at all.
pub const OPERATION_FAILED_MESSAGE: &str = "Operation failed";

#[derive(Debug, Error)]
pub enum ClientError {
    /// Request never produced a response (DNS, connect, reset, request timeout).
    #[error("network error: {0}")]
    Transport(String),

    /// Server answered with an error or reported a failed job.
    #[error("{message}")]
    Server { status: Option<u16>, message: String },

    /// Rejected locally before any network call.
    #[error("{0}")]
    Validation(String),

    /// Local polling deadline elapsed before the job reached a terminal status.
    #[error("timed out after {}s waiting for the task", .after.as_secs())]
    Timeout { after: Duration },

    /// Response arrived but could not be understood.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Source image could not be read (missing, unreadable, or blocked).
    #[error("cannot read source image: {0}")]
    SourceUnreadable(String),

    #[error("image processing failed: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            status: None,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Text suitable for a user-facing notice.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) => NETWORK_ERROR_MESSAGE.to_string(),
            Self::Server { message, .. } => normalize_error_message(Some(message.as_str())),
            Self::Validation(message) => message.clone(),
            Self::Timeout { .. } => "The task timed out, please try again".to_string(),
            Self::Decode(_) => "The server returned an unexpected response".to_string(),
            Self::SourceUnreadable(_) => {
                "Cannot crop a region from this image (it could not be read). Try uploading the reference image manually.".to_string()
            }
            Self::Image(message) => format!("Image processing failed: {}", message),
            Self::Io(e) => e.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Server {
                status: Some(status.as_u16()),
                message: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<image::ImageError> for ClientError {
    fn from(err: image::ImageError) -> Self {
        match &err {
            image::ImageError::Decoding(_) | image::ImageError::Unsupported(_) => {
                Self::SourceUnreadable(err.to_string())
            }
            _ => Self::Image(err.to_string()),
        }
    }
}

/// Turn known server error texts into friendlier guidance.
///
/// Unknown messages pass through unchanged; a missing message becomes
/// [`OPERATION_FAILED_MESSAGE`].
pub fn normalize_error_message(message: Option<&str>) -> String {
    let Some(message) = message.filter(|m| !m.is_empty()) else {
        return OPERATION_FAILED_MESSAGE.to_string();
    };

    let lower = message.to_lowercase();
    if lower.contains("no template image found") {
        "This project has no template yet. Choose or upload a template image from the project toolbar, then generate again.".to_string()
    } else if lower.contains("page must have description content") {
        "This page has no description yet. Generate or write one in the page description step first.".to_string()
    } else if lower.contains("image already exists") {
        "This page already has an image. Choose regenerate if you want a new one, or try again later.".to_string()
    } else {
        message.to_string()
    }
}
