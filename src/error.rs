//! Domain-specific error types for pool and runner operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Expected negative results
//! (unknown session, unsupported backend operation) get their own
//! variants so callers can handle them without string inspection.

use std::time::Duration;

/// Errors that can occur during sandbox pool and runner operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend reported a failure (network, API error code). Surfaced
    /// verbatim; the pool and runner never retry these themselves.
    #[error("Backend operation failed: {message}")]
    Backend { message: String },

    /// The session key is not registered with the runner. An expected,
    /// non-fatal condition the caller is expected to handle.
    #[error("Session not found: {session}")]
    SessionNotFound { session: String },

    /// The backend adapter does not implement an optional operation.
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: String,
    },

    /// A readiness probe did not succeed before the deadline.
    #[error("Readiness probe timed out after {timeout_secs} seconds")]
    ProbeTimeout { timeout_secs: u64 },

    /// The readiness probe worker terminated unexpectedly.
    #[error("Readiness probe worker crashed: {message}")]
    ProbeCrashed { message: String },

    /// A command exceeded its timeout plus the grace period.
    #[error("Command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// A sandbox was observed in a state the operation cannot handle
    /// (e.g. a session sandbox that is neither running nor stopped).
    #[error("Sandbox {id} is in unexpected state: {status}")]
    UnexpectedStatus { id: String, status: String },

    /// Missing or malformed configuration. Fails fast at call time;
    /// no meaningful recovery exists.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a `Backend` error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a `SessionNotFound` error.
    pub fn session_not_found(session: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session: session.into(),
        }
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(operation: &'static str, backend: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            backend: backend.into(),
        }
    }

    /// Creates a `ProbeTimeout` error from a `Duration`.
    pub fn probe_timeout(duration: Duration) -> Self {
        Self::ProbeTimeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `ProbeCrashed` error.
    pub fn probe_crashed(message: impl Into<String>) -> Self {
        Self::ProbeCrashed {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates an `UnexpectedStatus` error.
    pub fn unexpected_status(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            id: id.into(),
            status: status.into(),
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true if this is a session-not-found error.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. })
    }

    /// Returns true if this is a timeout (command or probe).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ProbeTimeout { .. })
    }

    /// Returns true if the backend does not support the operation.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Returns true if this is a backend failure.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}
