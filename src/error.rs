//! Request error taxonomy.
//!
//! Every failure surfaced by the [`RequestGateway`](crate::gateway::RequestGateway)
//! is an [`ApiError`]. The variants map one-to-one onto the way callers are
//! expected to react:
//!
//! | Variant | Cause | Retried | Caller reaction |
//! |---------|-------|---------|-----------------|
//! | [`ApiError::Transport`] (timeout / reset) | network | yes | none unless retries exhaust |
//! | [`ApiError::Server`] | HTTP 5xx | yes | none unless retries exhaust |
//! | [`ApiError::AuthExpired`] | HTTP 401 | no | re-authenticate |
//! | [`ApiError::Client`] | other HTTP 4xx | no | report |
//! | [`ApiError::Validation`] | rejected locally | no request sent | fix input |
//! | [`ApiError::Decode`] | unexpected payload | no | report |
//! | [`ApiError::Io`] | local file access | no | report |
//!
//! Partial ingestion failures are not errors; they are reported as data in
//! [`IngestReport`](crate::ingest::IngestReport).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Low-level cause of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The attempt did not complete within the request timeout.
    Timeout,
    /// The connection was refused, reset, or dropped mid-flight.
    ConnectionReset,
    /// Anything else (TLS, malformed URL, body stream failure).
    Other,
}

/// Failure classes used to decide whether an error is worth retrying.
///
/// These are the values accepted by `retry.retry_on` in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionReset,
    ServerError,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("session expired or not authorized; log in again")]
    AuthExpired,

    #[error("request rejected with {status}: {body}")]
    Client { status: u16, body: String },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unexpected response payload: {0}")]
    Decode(String),

    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Build the error for a non-success HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 => Self::AuthExpired,
            500..=599 => Self::Server { status, body },
            _ => Self::Client { status, body },
        }
    }

    /// The retry class of this error, or `None` when it must never be retried.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            } => Some(FailureKind::Timeout),
            Self::Transport {
                kind: TransportErrorKind::ConnectionReset,
                ..
            } => Some(FailureKind::ConnectionReset),
            Self::Server { .. } => Some(FailureKind::ServerError),
            _ => None,
        }
    }

    /// Whether this error belongs to one of the default transient classes.
    pub fn is_transient(&self) -> bool {
        self.failure_kind().is_some()
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() || is_connection_reset(&err) {
            TransportErrorKind::ConnectionReset
        } else {
            TransportErrorKind::Other
        };
        Self::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

fn is_connection_reset(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
