//! Relay error taxonomy.
//!
//! `RelayError` is the domain error listeners, executors and the router work
//! with; process plumbing uses `eyre::Result` on top of it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::ConversionError;
use crate::types::ChainId;

/// Stable error category recorded with failed messages and used as a log field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigMissing,
    ParseError,
    RouteNotFound,
    SubmissionFailed,
    AuthError,
    StoreError,
    /// Submitted but the outcome could not be observed
    InDoubt,
    /// Plugin registration or core start misuse
    LifecycleError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigMissing => "config_missing",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::RouteNotFound => "route_not_found",
            ErrorKind::SubmissionFailed => "submission_failed",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::StoreError => "store_error",
            ErrorKind::InDoubt => "in_doubt",
            ErrorKind::LifecycleError => "lifecycle_error",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config_missing" => Ok(ErrorKind::ConfigMissing),
            "parse_error" => Ok(ErrorKind::ParseError),
            "route_not_found" => Ok(ErrorKind::RouteNotFound),
            "submission_failed" => Ok(ErrorKind::SubmissionFailed),
            "auth_error" => Ok(ErrorKind::AuthError),
            "store_error" => Ok(ErrorKind::StoreError),
            "in_doubt" => Ok(ErrorKind::InDoubt),
            "lifecycle_error" => Ok(ErrorKind::LifecycleError),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0} environment variable is required")]
    ConfigMissing(String),

    #[error("failed to parse event: {0}")]
    Parse(String),

    #[error("no plugin registered for destination chain {dest}")]
    RouteNotFound { dest: ChainId },

    #[error("submission failed: {reason}")]
    SubmissionFailed { reason: String, retryable: bool },

    /// The request reached the destination (`reference` is the tx hash or
    /// request id) but its outcome is unknown. Never resubmitted.
    #[error("outcome unknown ({reference}): {reason}")]
    InDoubt { reference: String, reason: String },

    #[error("executor credential rejected: {0}")]
    Auth(String),

    #[error("message store error: {0}")]
    Store(String),

    #[error("chain {0} is already registered")]
    DuplicateChain(ChainId),

    #[error("plugin for {plugin} cannot be registered under {requested}")]
    PluginMismatch { requested: ChainId, plugin: ChainId },

    #[error("relay core has already been started")]
    AlreadyStarted,
}

impl RelayError {
    pub fn transient(reason: impl Into<String>) -> Self {
        RelayError::SubmissionFailed {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        RelayError::SubmissionFailed {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn in_doubt(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayError::InDoubt {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::ConfigMissing(_) => ErrorKind::ConfigMissing,
            RelayError::DuplicateChain(_)
            | RelayError::PluginMismatch { .. }
            | RelayError::AlreadyStarted => ErrorKind::LifecycleError,
            RelayError::Parse(_) => ErrorKind::ParseError,
            RelayError::RouteNotFound { .. } => ErrorKind::RouteNotFound,
            RelayError::SubmissionFailed { .. } => ErrorKind::SubmissionFailed,
            RelayError::InDoubt { .. } => ErrorKind::InDoubt,
            RelayError::Auth(_) => ErrorKind::AuthError,
            RelayError::Store(_) => ErrorKind::StoreError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::SubmissionFailed {
                retryable: true,
                ..
            }
        )
    }
}

/// A value that cannot be represented on the destination is never submitted.
impl From<ConversionError> for RelayError {
    fn from(err: ConversionError) -> Self {
        RelayError::permanent(err.to_string())
    }
}
