//! Crate-wide error taxonomy, per OSMO's error handling design.
//!
//! Every fallible operation in this crate returns an [`OsmoError`] whose
//! [`ErrorKind`] places it in one of the kinds from the error handling
//! design: user error, server error, submission error, transient transport,
//! database error, duplicate, or poison message. Call sites match on
//! `kind()` to decide whether to retry, ack, or surface the failure to the
//! user, instead of downcasting concrete error types.

use std::fmt;
use thiserror::Error;

/// The taxonomy of error kinds. Not specific exception types: callers branch
/// on this to decide retry/ack/surface behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-originated invalid input; surfaced as HTTP 400; never retried.
    User,
    /// Server-side operational fault; HTTP 500; retryable at caller discretion.
    Server,
    /// Workflow submission rejected by business rules.
    Submission,
    /// Connection refused, read timeout, max-retry-exceeded: retried with backoff.
    Transient,
    /// Relational-store failure; message workers must not ack on this kind.
    Database,
    /// Idempotent no-op; succeed silently; log at debug.
    Duplicate,
    /// Deserialization/validation failure on a queue entry; ack and drop.
    Poison,
}

impl ErrorKind {
    /// Whether a caller should retry an operation that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Server)
    }
}

#[derive(Error, Debug)]
pub struct OsmoError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl OsmoError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        OsmoError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        OsmoError {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn submission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Submission, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplicate, message)
    }

    pub fn poison(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Poison, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for OsmoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<redis::RedisError> for OsmoError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            OsmoError::with_source(ErrorKind::Transient, "redis transport error", err)
        } else {
            OsmoError::with_source(ErrorKind::Server, "redis error", err)
        }
    }
}

impl From<serde_json::Error> for OsmoError {
    fn from(err: serde_json::Error) -> Self {
        OsmoError::with_source(ErrorKind::Poison, "failed to deserialize message", err)
    }
}

impl From<kube::Error> for OsmoError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code >= 500 => {
                OsmoError::with_source(ErrorKind::Server, format!("kubernetes API error: {resp}"), err)
            }
            kube::Error::Api(resp) if resp.code == 409 => {
                OsmoError::with_source(ErrorKind::Duplicate, format!("kubernetes API conflict: {resp}"), err)
            }
            _ => OsmoError::with_source(ErrorKind::Transient, "kubernetes transport error", err),
        }
    }
}

impl From<sqlx::Error> for OsmoError {
    fn from(err: sqlx::Error) -> Self {
        OsmoError::with_source(ErrorKind::Database, "relational store error", err)
    }
}

pub type OsmoResult<T> = Result<T, OsmoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Server.is_retryable());
        assert!(!ErrorKind::User.is_retryable());
        assert!(!ErrorKind::Duplicate.is_retryable());
        assert!(!ErrorKind::Poison.is_retryable());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = OsmoError::user("bad workflow spec");
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(format!("{err}"), "User: bad workflow spec");
    }
}
