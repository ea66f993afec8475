use serde::Serialize;
use thiserror::Error;

/// Why the recording device refused or dropped a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum DeviceFailure {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("recording device unavailable")]
    Unavailable,
    #[error("recording device is held by another capture")]
    Busy,
    #[error("recording device failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Timeout,
    ServerUnavailable,
    RateLimited,
    ServerRejected,
    Validation,
    Device,
    StaleResponse,
    InvalidState,
    Initialization,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("server returned {status}: {detail}")]
    Server { status: u16, detail: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Device(DeviceFailure),
    #[error("stale response for question {question_id} (token {token})")]
    StaleResponse { question_id: String, token: u64 },
    #[error("operation not allowed: {0}")]
    InvalidState(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SessionError> },
    #[error("attempt could not be initialized: {0}")]
    Initialization(String),
    #[error("local storage error: {0}")]
    Storage(String),
}

impl SessionError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Network(_) => ErrorClass::Network,
            SessionError::Timeout(_) => ErrorClass::Timeout,
            SessionError::Server { status: 429, .. } => ErrorClass::RateLimited,
            SessionError::Server { status, .. } if *status >= 500 => ErrorClass::ServerUnavailable,
            SessionError::Server { .. } => ErrorClass::ServerRejected,
            SessionError::Validation(_) => ErrorClass::Validation,
            SessionError::Device(_) => ErrorClass::Device,
            SessionError::StaleResponse { .. } => ErrorClass::StaleResponse,
            SessionError::InvalidState(_) => ErrorClass::InvalidState,
            SessionError::RetriesExhausted { last, .. } => last.class(),
            SessionError::Initialization(_) => ErrorClass::Initialization,
            SessionError::Storage(_) => ErrorClass::Storage,
        }
    }

    /// Whether a retry policy may try the operation again.
    ///
    /// `RetriesExhausted` wraps a retryable cause but is itself terminal.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, SessionError::RetriesExhausted { .. }) {
            return false;
        }
        matches!(
            self.class(),
            ErrorClass::Network
                | ErrorClass::Timeout
                | ErrorClass::ServerUnavailable
                | ErrorClass::RateLimited
        )
    }

    /// Stale responses are dropped without telling the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, SessionError::StaleResponse { .. })
    }

    /// Message shown next to the retry button or re-record prompt.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::RetriesExhausted { .. }
            | SessionError::Network(_)
            | SessionError::Timeout(_) => {
                "Connection problem. Check your network and press Retry.".to_string()
            }
            SessionError::Server { status: 429, .. } => {
                "The server is busy. Wait a moment and press Retry.".to_string()
            }
            SessionError::Server { status, .. } if *status >= 500 => {
                "The server is temporarily unavailable. Press Retry.".to_string()
            }
            SessionError::Server { detail, .. } => format!("Request rejected: {detail}"),
            SessionError::Validation(detail) => {
                format!("{detail}. Please record your answer again.")
            }
            SessionError::Device(DeviceFailure::PermissionDenied) => {
                "Microphone access was denied. Allow access and record again.".to_string()
            }
            SessionError::Device(failure) => format!("{failure}. Please record again."),
            SessionError::StaleResponse { .. } => String::new(),
            SessionError::InvalidState(detail) => detail.clone(),
            SessionError::Initialization(detail) => {
                format!("The exam could not be started: {detail}. Please restart the exam.")
            }
            SessionError::Storage(detail) => format!("Local settings could not be saved: {detail}"),
        }
    }

    pub(crate) fn from_status(status: u16, detail: impl Into<String>) -> Self {
        Self::Server { status, detail: detail.into() }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SessionError::Timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            return SessionError::from_status(status.as_u16(), err.to_string());
        }
        // A 2xx with an unreadable body will not improve on retry.
        if err.is_decode() {
            return SessionError::Server { status: 200, detail: format!("malformed body: {err}") };
        }
        SessionError::Network(err.to_string())
    }
}
