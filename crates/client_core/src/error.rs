use shared::{
    domain::{ChatRef, LocalMessageId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

/// Failure to open or use a duplex connection or to reach an HTTP collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection closed")]
    Closed,
    #[error("request failed: {0}")]
    Request(String),
    #[error("server error: {0}")]
    Server(ApiError),
}

/// Outcome of a failed collaborator call, split at the boundary so callers
/// can tell a rejected request from an unreachable server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rejected by server: {0}")]
    Rejected(ApiError),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiFailure {
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let error = ApiError::from_status(status, detail);
        if error.code.is_transient() {
            ApiFailure::Transport(TransportError::Server(error))
        } else {
            ApiFailure::Rejected(error)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiFailure::Rejected(err) if err.code == ErrorCode::NotFound)
    }
}

impl From<reqwest::Error> for ApiFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiFailure::Malformed(err.to_string())
        } else {
            ApiFailure::Transport(TransportError::Request(err.to_string()))
        }
    }
}

/// Why an optimistic message ended up Failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(String),
    Rejected(String),
}

impl FailureReason {
    pub fn user_message(&self) -> String {
        match self {
            FailureReason::Transport(_) => "Not sent: connection problem, tap to retry".to_string(),
            FailureReason::Rejected(detail) => format!("Not sent: {detail}"),
        }
    }
}

impl From<&ApiFailure> for FailureReason {
    fn from(failure: &ApiFailure) -> Self {
        match failure {
            ApiFailure::Rejected(err) => FailureReason::Rejected(err.message.clone()),
            other => FailureReason::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("microphone unavailable: {0}")]
    MediaUnavailable(String),
    #[error("message rejected by server: {0}")]
    DeliveryRejected(String),
    #[error("chat {0} no longer exists")]
    StaleChatReference(ChatRef),
    #[error("a call is already in progress")]
    CallInProgress,
    #[error("no incoming call to answer")]
    NoIncomingCall,
    #[error("no active call")]
    NoActiveCall,
    #[error("unknown outbound message {0}")]
    UnknownMessage(LocalMessageId),
    #[error("message {0} is not in a retryable state")]
    NotRetryable(LocalMessageId),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("session is closed")]
    SessionClosed,
}

impl CoreError {
    /// Only these reach the user as failures; everything else recovers locally.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            CoreError::MediaUnavailable(_) | CoreError::DeliveryRejected(_)
        )
    }
}
