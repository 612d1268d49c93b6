// src/infra/errors.rs — Error types for handoff

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::session::SessionState;

#[derive(Error, Debug)]
pub enum BrokerError {
    // Caller errors (rejected before touching the store)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Lookup errors
    #[error("Unknown session")]
    UnknownSession,

    #[error("Session has expired")]
    SessionExpired,

    // Ordering violations
    #[error("Cannot apply '{event}' to a session in state {from:?}")]
    InvalidTransition {
        from: SessionState,
        event: &'static str,
    },

    // Session-level failures (recorded on the session as `Failed`)
    #[error("Key installation failed: {0}")]
    KeyInstallFailed(String),

    #[error("Transfer exceeded the {secs}s time limit")]
    TransferTimeout { secs: u64 },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Transfer cancelled")]
    Cancelled,

    // Reported as a warning, never blocks retirement
    #[error("Key revocation failed: {0}")]
    CleanupFailed(String),

    // Infra
    #[error("Key generation error: {0}")]
    KeyGeneration(#[from] ssh_key::Error),

    #[error("Job runner error: {0}")]
    Job(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    /// Stable machine-readable name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::InvalidRequest(_) => "InvalidRequest",
            BrokerError::UnknownSession => "UnknownSession",
            BrokerError::SessionExpired => "SessionExpired",
            BrokerError::InvalidTransition { .. } => "InvalidTransition",
            BrokerError::KeyInstallFailed(_) => "KeyInstallFailed",
            BrokerError::TransferTimeout { .. } => "TransferTimeout",
            BrokerError::TransferFailed(_) => "TransferFailed",
            BrokerError::Cancelled => "Cancelled",
            BrokerError::CleanupFailed(_) => "CleanupFailed",
            BrokerError::KeyGeneration(_) => "KeyGeneration",
            BrokerError::Job(_) => "Job",
            BrokerError::Io(_) => "Io",
            BrokerError::Other(_) => "Internal",
        }
    }

    /// The failure kind this error records on a session, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            BrokerError::KeyInstallFailed(_) => Some(FailureKind::KeyInstallFailed),
            BrokerError::TransferTimeout { .. } => Some(FailureKind::TransferTimeout),
            BrokerError::TransferFailed(_) => Some(FailureKind::TransferFailed),
            BrokerError::Cancelled => Some(FailureKind::Cancelled),
            _ => None,
        }
    }

    /// Build the `lastError` record for this error, if it is a session failure.
    pub fn to_record(&self) -> Option<ErrorRecord> {
        self.failure_kind()
            .map(|kind| ErrorRecord::new(kind, self.to_string()))
    }
}

/// Why a session ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    KeyInstallFailed,
    TransferTimeout,
    TransferFailed,
    Cancelled,
}

/// Error recorded on a session (`lastError`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            BrokerError::KeyInstallFailed("unreachable".into()).failure_kind(),
            Some(FailureKind::KeyInstallFailed)
        );
        assert_eq!(
            BrokerError::TransferTimeout { secs: 300 }.failure_kind(),
            Some(FailureKind::TransferTimeout)
        );
        assert_eq!(BrokerError::UnknownSession.failure_kind(), None);
        assert_eq!(
            BrokerError::CleanupFailed("x".into()).failure_kind(),
            None
        );
    }

    #[test]
    fn test_error_record_from_error() {
        let err = BrokerError::Cancelled;
        let record = err.to_record().unwrap();
        assert_eq!(record.kind, FailureKind::Cancelled);
        assert_eq!(record.message, "Transfer cancelled");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = BrokerError::InvalidTransition {
            from: SessionState::Succeeded,
            event: "consent",
        };
        assert_eq!(err.kind(), "InvalidTransition");
        assert!(err.to_string().contains("Succeeded"));
    }
}
