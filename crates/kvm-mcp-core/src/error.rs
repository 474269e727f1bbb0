//! Error types: the domain error taxonomy and its AI-friendly rendering.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::input::TagError;

/// Error codes reported to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedTag,
    InvalidInput,
    ServiceUnavailable,
    ServiceConnectionLost,
    ServiceTimeout,
    ServiceRejected,
    ServiceProtocol,
    RecognitionUnavailable,
    RecognitionFailed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::MalformedTag => "MALFORMED_TAG",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ServiceConnectionLost => "SERVICE_CONNECTION_LOST",
            ErrorCode::ServiceTimeout => "SERVICE_TIMEOUT",
            ErrorCode::ServiceRejected => "SERVICE_REJECTED",
            ErrorCode::ServiceProtocol => "SERVICE_PROTOCOL",
            ErrorCode::RecognitionUnavailable => "RECOGNITION_UNAVAILABLE",
            ErrorCode::RecognitionFailed => "RECOGNITION_FAILED",
        };
        f.write_str(code)
    }
}

/// Everything that can go wrong while serving a tool call.
#[derive(Debug, Error)]
pub enum KvmError {
    #[error(transparent)]
    MalformedTag(#[from] TagError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No connection and the single connect attempt failed.
    #[error("KVM service unavailable at {addr}: {reason}")]
    ServiceUnavailable { addr: String, reason: String },

    /// The connection dropped while a request was in flight.
    #[error("connection to KVM service lost: {0}")]
    ConnectionLost(String),

    #[error("KVM service did not respond within {0:?}")]
    Timeout(Duration),

    /// The service answered with its own failure flag.
    #[error("KVM service rejected {action}: {message}")]
    Rejected { action: String, message: String },

    /// The service answered with something that is not a valid response.
    #[error("unexpected response from KVM service: {0}")]
    Protocol(String),

    #[error("text recognition engine unavailable: {0}")]
    RecognitionUnavailable(String),

    #[error("text recognition failed: {0}")]
    RecognitionFailed(String),

    /// A multi-request input operation failed part way through.
    #[error("{completed} of {total} input steps sent before failure: {source}")]
    PartialInput {
        completed: usize,
        total: usize,
        source: Box<KvmError>,
    },
}

impl KvmError {
    pub fn partial(completed: usize, total: usize, source: KvmError) -> Self {
        KvmError::PartialInput {
            completed,
            total,
            source: Box::new(source),
        }
    }

    /// Partial input reports the code of its underlying error.
    pub fn code(&self) -> ErrorCode {
        match self {
            KvmError::MalformedTag(_) => ErrorCode::MalformedTag,
            KvmError::InvalidArgument(_) => ErrorCode::InvalidInput,
            KvmError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            KvmError::ConnectionLost(_) => ErrorCode::ServiceConnectionLost,
            KvmError::Timeout(_) => ErrorCode::ServiceTimeout,
            KvmError::Rejected { .. } => ErrorCode::ServiceRejected,
            KvmError::Protocol(_) => ErrorCode::ServiceProtocol,
            KvmError::RecognitionUnavailable(_) => ErrorCode::RecognitionUnavailable,
            KvmError::RecognitionFailed(_) => ErrorCode::RecognitionFailed,
            KvmError::PartialInput { source, .. } => source.code(),
        }
    }
}

/// An error response with AI-friendly context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

fn suggestion_for(err: &KvmError) -> &'static str {
    match err {
        KvmError::MalformedTag(_) => {
            "Use tags like {enter}, {tab}, {f5}, {ctrl+c} or {0x87}; type braces with {lbrace} and {rbrace}"
        }
        KvmError::InvalidArgument(_) => "Check the tool arguments and try again",
        KvmError::ServiceUnavailable { .. } => {
            "Make sure the KVM server is running and SHKVM_API_HOST/SHKVM_API_PORT point at it"
        }
        KvmError::ConnectionLost(_) => {
            "The request may or may not have reached the target; capture the screen to check before retrying"
        }
        KvmError::Timeout(_) => {
            "The KVM server is slow or stuck; capture the screen to check the target state before retrying"
        }
        KvmError::Rejected { .. } => {
            "The KVM server refused the request; use get_device_info or list_capture_devices to check valid values"
        }
        KvmError::Protocol(_) => "Check that the KVM server version matches this client",
        KvmError::RecognitionUnavailable(_) => {
            "Install tesseract or set MCP_TESSERACT_CMD to its path; capture_screen still works without it"
        }
        KvmError::RecognitionFailed(_) => "Try capture_screen to inspect the screen as an image",
        KvmError::PartialInput { source, .. } => suggestion_for(source),
    }
}

impl From<&KvmError> for ApiError {
    fn from(err: &KvmError) -> Self {
        let mut suggestion = suggestion_for(err).to_string();
        if let KvmError::PartialInput { completed, .. } = err {
            if *completed > 0 {
                suggestion = format!(
                    "Earlier steps already reached the target; do not resend them. {}",
                    suggestion
                );
            }
        }
        Self {
            code: err.code(),
            message: err.to_string(),
            suggestion: Some(suggestion),
        }
    }
}

impl From<KvmError> for ApiError {
    fn from(err: KvmError) -> Self {
        ApiError::from(&err)
    }
}
