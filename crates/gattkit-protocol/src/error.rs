//! Error taxonomy for session operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable error code carried in failure envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    ConnectionNotAlive,
    Timeout,
    DeviceUnreachable,
    PolicyDenied,
    LimitExceeded,
    InvalidArgument,
    SubscriptionMismatch,
    Unsupported,
    TransportError,
    UnknownTool,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ConnectionNotAlive => "connection_not_alive",
            Self::Timeout => "timeout",
            Self::DeviceUnreachable => "device_unreachable",
            Self::PolicyDenied => "policy_denied",
            Self::LimitExceeded => "limit_exceeded",
            Self::InvalidArgument => "invalid_argument",
            Self::SubscriptionMismatch => "subscription_mismatch",
            Self::Unsupported => "unsupported",
            Self::TransportError => "transport_error",
            Self::UnknownTool => "unknown_tool",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of thing a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Scan,
    Connection,
    Subscription,
    Spec,
    Capability,
    Extension,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Scan => "scan_id",
            Self::Connection => "connection_id",
            Self::Subscription => "subscription_id",
            Self::Spec => "spec_id",
            Self::Capability => "characteristic",
            Self::Extension => "extension",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by the session engine and the dispatch layers around it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown {kind}: {id}")]
    NotFound { kind: SessionKind, id: String },
    #[error("connection {connection_id} to {address} is not alive")]
    ConnectionNotAlive {
        connection_id: String,
        address: String,
    },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("subscription {subscription_id} does not belong to connection {connection_id}")]
    SubscriptionMismatch {
        subscription_id: String,
        connection_id: String,
    },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    pub fn not_found(kind: SessionKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::ConnectionNotAlive { .. } => ErrorCode::ConnectionNotAlive,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::DeviceUnreachable(_) => ErrorCode::DeviceUnreachable,
            Self::PolicyDenied(_) => ErrorCode::PolicyDenied,
            Self::LimitExceeded(_) => ErrorCode::LimitExceeded,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::SubscriptionMismatch { .. } => ErrorCode::SubscriptionMismatch,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Transport(_) => ErrorCode::TransportError,
            Self::UnknownTool(_) => ErrorCode::UnknownTool,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Convenience result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_id_field() {
        let err = SessionError::not_found(SessionKind::Scan, "abc");
        assert_eq!(err.to_string(), "unknown scan_id: abc");
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn codes_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ConnectionNotAlive).unwrap();
        assert_eq!(json, "\"connection_not_alive\"");
        assert_eq!(ErrorCode::TransportError.as_str(), "transport_error");
        assert_eq!(
            SessionError::Transport("gatt busy".into()).code(),
            ErrorCode::TransportError
        );
    }
}
