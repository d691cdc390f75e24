//! Error types for blobdir
//!
//! All modules use `BlobdirResult<T>` as their return type.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for blobdir operations
pub type BlobdirResult<T> = Result<T, BlobdirError>;

/// Status codes the remote store reports that the crate reacts to
pub mod status {
    pub const NOT_FOUND: u16 = 404;
    pub const TIMEOUT: u16 = 408;
    pub const CONFLICT: u16 = 409;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const INTERNAL: u16 = 500;
    pub const UNAVAILABLE: u16 = 503;
}

/// A failure reported by the remote object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    /// HTTP-style status code
    pub status: u16,
    /// Store-provided description
    pub message: String,
}

impl RemoteFault {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(status::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(status::CONFLICT, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(status::PRECONDITION_FAILED, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(status::UNAVAILABLE, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == status::NOT_FOUND
    }

    pub fn is_conflict(&self) -> bool {
        self.status == status::CONFLICT
    }

    /// Missing or conflicting lock objects are fixed by creating the
    /// backing object and retrying once
    pub fn is_recoverable(&self) -> bool {
        self.is_not_found() || self.is_conflict()
    }

    /// Whether the same call may succeed if simply repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self.status,
            status::TIMEOUT | status::TOO_MANY_REQUESTS | 500..=599
        )
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl std::error::Error for RemoteFault {}

/// All errors that can occur in blobdir
#[derive(Error, Debug)]
pub enum BlobdirError {
    // Remote store errors
    #[error("Remote store fault: {0}")]
    Remote(#[from] RemoteFault),

    #[error("Lease on {name} exceeded its hold ceiling and was broken")]
    StaleLease { name: String },

    #[error("Remote call {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Remote call {operation} was cancelled")]
    Cancelled { operation: String },

    // Read handle errors
    #[error("Input {name} used after close")]
    UseAfterClose { name: String },

    #[error("Failed to clone input {name}: {source}")]
    Clone {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Read past end of {name} at position {position}")]
    EndOfInput { name: String, position: u64 },

    #[error("Truncated read of {name}: requested {requested} bytes, {available} available")]
    Truncated {
        name: String,
        requested: u64,
        available: u64,
    },

    #[error("Invalid object name: {0:?}")]
    InvalidName(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // User-facing errors
    #[error("{0}")]
    User(String),
}

impl BlobdirError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The remote fault behind this error, if any
    pub fn remote_fault(&self) -> Option<&RemoteFault> {
        match self {
            Self::Remote(fault) => Some(fault),
            _ => None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(fault) => fault.is_transient(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Timeout { .. } => Some("Raise remote.call_timeout_secs or check the store"),
            Self::ConfigInvalid { .. } => Some("Run: blobdir config init --force"),
            Self::InvalidName(_) => Some("Object names must be a single path component"),
            Self::Remote(fault) if fault.is_transient() => Some("The store is busy, try again"),
            _ => None,
        }
    }
}
