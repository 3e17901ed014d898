//! Error types for strata operations

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for strata operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The cluster spec or local environment is unusable; nothing was attempted
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A provisioning-backend subprocess failed
    #[error("backend error: {command}: {message}")]
    Backend {
        /// The command that failed
        command: String,
        /// Captured stderr or failure description
        message: String,
    },

    /// A remote command on a single node failed or timed out
    #[error("remote execution error on {node}: {message}")]
    RemoteExecution {
        /// The node the command targeted
        node: String,
        /// Failure description
        message: String,
    },

    /// No externally reachable endpoint could be resolved
    #[error("endpoint resolution error: {0}")]
    Resolution(String),

    /// The backend is registered but not yet implemented
    #[error("backend '{backend}' does not implement {operation}")]
    Unimplemented {
        /// Backend identity string
        backend: String,
        /// The operation that was requested
        operation: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Bootstrap failed in a specific phase; earlier phases are left intact
    #[error("bootstrap failed during {phase}: {cause}")]
    Bootstrap {
        /// The phase that was active when the failure occurred
        phase: String,
        /// The underlying failure
        #[source]
        cause: Box<Error>,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a backend error for a failed subprocess
    pub fn backend(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a remote execution error for a single node
    pub fn remote(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteExecution {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create an endpoint resolution error
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Create an unimplemented-backend error
    pub fn unimplemented(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Wrap an error with the bootstrap phase it occurred in
    pub fn in_phase(phase: impl Into<String>, cause: Error) -> Self {
        Self::Bootstrap {
            phase: phase.into(),
            cause: Box::new(cause),
        }
    }
}
