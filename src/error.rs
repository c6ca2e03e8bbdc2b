//! Error types for dump-relay.

use std::time::Duration;

use thiserror::Error;

/// Main error type for dump-relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Session with the given ID was not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// No session was named and none has been opened.
    #[error("no session specified and no active default session")]
    NoActiveSession,

    /// Stored command result with the given ID was not found.
    #[error("command output not found: {0}")]
    CommandNotFound(String),

    /// No analysis script with the given name was discovered.
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    /// Session is still starting its engines.
    #[error("session is still starting: {0}")]
    SessionStarting(String),

    /// The engine process is dead or unresponsive.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// No engine could be started for the session.
    #[error("engine failed to start: {0}")]
    EngineStart(String),

    /// Command execution exceeded its time bound.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed offset, limit or similar argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed search expression.
    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),

    /// Session failed to recover from a timeout and is permanently degraded.
    #[error("session unusable: {0}")]
    SessionUnusable(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// An optional feature was requested but is not configured.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Persistence I/O failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

impl RelayError {
    /// Stable machine-readable code for this error family.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) | Self::NoActiveSession => "SESSION_NOT_FOUND",
            Self::CommandNotFound(_) => "COMMAND_NOT_FOUND",
            Self::ScriptNotFound(_) => "SCRIPT_NOT_FOUND",
            Self::SessionStarting(_) => "SESSION_STARTING",
            Self::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            Self::EngineStart(_) => "ENGINE_START_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::InvalidPattern(_) => "INVALID_PATTERN",
            Self::SessionUnusable(_) => "SESSION_UNUSABLE",
            Self::InvalidStateTransition { .. } => "INVALID_STATE",
            Self::NotConfigured(_) => "NOT_CONFIGURED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::LockPoisoned => "INTERNAL_ERROR",
        }
    }

    /// Whether this error belongs to the not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_)
                | Self::NoActiveSession
                | Self::CommandNotFound(_)
                | Self::ScriptNotFound(_)
        )
    }
}

/// Convenience Result type for dump-relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
