//! Error types shared across the workspace.
//!
//! Library code returns [`QubesError`]; the daemon binary and worker loops
//! wrap it in `anyhow::Error` where only logging remains to be done.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the workspace.
pub type QubesResult<T> = Result<T, QubesError>;

#[derive(Debug, Error)]
pub enum QubesError {
    /// Rejected property assignment or malformed input value.
    #[error("invalid value: {message}")]
    InvalidValue { message: String },

    /// A referenced object does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Operation blocked because another object still references the target.
    #[error("{message}")]
    InUse { message: String },

    /// Operation not legal in the current lifecycle state.
    #[error("{message}")]
    WrongState { message: String },

    /// The memory balancer refused the allocation.
    #[error("memory allocation refused: {message}")]
    Memory { message: String },

    /// Pool or driver I/O error.
    #[error("storage error in pool {pool}: {message}")]
    Storage { pool: String, message: String },

    /// Hypervisor call failed.
    #[error("hypervisor error {code}: {message}")]
    Hypervisor { code: i32, message: String },

    /// The admin policy rejected the call.
    #[error("not allowed: {message}")]
    NotAllowed { message: String },

    /// Malformed admin protocol frame.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Bug guard. Reported to the caller, the daemon keeps running.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl QubesError {
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn in_use(message: impl Into<String>) -> Self {
        Self::InUse {
            message: message.into(),
        }
    }

    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::WrongState {
            message: message.into(),
        }
    }

    pub fn storage(pool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            pool: pool.into(),
            message: message.into(),
        }
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::NotAllowed {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable kind name used as the exception type on the admin wire.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::InvalidValue { .. } => "InvalidValue",
            Self::NotFound { .. } => "NotFound",
            Self::InUse { .. } => "InUse",
            Self::WrongState { .. } => "WrongState",
            Self::Memory { .. } => "Memory",
            Self::Storage { .. } => "Storage",
            Self::Hypervisor { .. } => "Hypervisor",
            Self::NotAllowed { .. } => "NotAllowed",
            Self::Protocol { .. } => "Protocol",
            Self::Io { .. } => "Io",
            Self::Internal { .. } => "Internal",
        }
    }
}
