use std::fmt;

use reqwest::{Method, StatusCode};
use shared::domain::{MessageId, ThreadId};
use thiserror::Error;

/// Status the backend uses to signal an expired or revoked session.
pub const SESSION_INVALID_STATUS: StatusCode = StatusCode::PROXY_AUTHENTICATION_REQUIRED;

pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SessionInvalid,
    RateLimited,
    ServiceUnavailable,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub status_code: u16,
    pub server_message: Option<String>,
    pub retriable: bool,
    pub session_invalid: bool,
}

impl ErrorClassification {
    pub fn classify(method: &Method, status: StatusCode, server_message: Option<String>) -> Self {
        let throttled =
            status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE;
        Self {
            status_code: status.as_u16(),
            server_message,
            retriable: throttled && is_idempotent(method),
            session_invalid: status == SESSION_INVALID_STATUS,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.status_code {
            407 => ErrorKind::SessionInvalid,
            429 => ErrorKind::RateLimited,
            503 => ErrorKind::ServiceUnavailable,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Client,
        }
    }

    /// 429 and 503 are surfaced through retry banners, never toasts.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::ServiceUnavailable
        )
    }

    /// Best human-readable text for this failure, preferring the server's own message.
    pub fn display_message(&self) -> String {
        match &self.server_message {
            Some(message) => message.clone(),
            None => format!("Request failed with status code {}", self.status_code),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFailure {
    pub method: Method,
    pub url: String,
    pub classification: ErrorClassification,
    /// Number of retries performed before giving up on this request.
    pub retries: u32,
    /// Set when retries were exhausted on a throttled response.
    pub gave_up: bool,
}

impl HttpFailure {
    /// Message for a transient toast, or `None` when the toast is suppressed.
    pub fn user_message(&self) -> Option<String> {
        if self.classification.is_throttled() {
            return None;
        }
        Some(self.classification.display_message())
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed with status {}: {}",
            self.method,
            self.url,
            self.classification.status_code,
            self.classification.display_message()
        )?;
        if self.gave_up {
            write!(f, " (gave up after rate-limiting, {} retries)", self.retries)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no response for {method} {url}: {source}")]
    Network {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{0}")]
    Http(HttpFailure),
    #[error("failed to encode request body for {url}: {source}")]
    Encode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TransportError {
    pub fn classification(&self) -> Option<&ErrorClassification> {
        match self {
            TransportError::Http(failure) => Some(&failure.classification),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.classification().map(ErrorClassification::kind)
    }

    pub fn gave_up(&self) -> bool {
        matches!(self, TransportError::Http(failure) if failure.gave_up)
    }

    pub fn is_session_invalid(&self) -> bool {
        self.classification()
            .is_some_and(|classification| classification.session_invalid)
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid socket url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("socket url must use ws:// or wss://, got {0}")]
    UnsupportedScheme(String),
    #[error("socket handle is closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] shared::error::ProtocolError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("server id {server_id} for local message {local_id} collides with an existing message")]
    IdCollision {
        local_id: MessageId,
        server_id: MessageId,
    },
    #[error("message {0} is already present")]
    DuplicateMessage(MessageId),
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    #[error("message {0} is not in a resendable state")]
    NotResendable(MessageId),
    #[error("store update loop has stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
