//! Datastore error types.
//!
//! Every failure a caller can observe is a [`StoreError`].  Backend
//! implementations report connection-level failures as
//! [`StoreError::Transient`] and protocol-level outcomes as
//! [`StoreError::Backend`]; the retry policy and the individual operations
//! only ever look at [`StoreError::kind`] to decide what to do.

use thiserror::Error;

/// Azure error code for a directory or file that already exists.
pub const RESOURCE_ALREADY_EXISTS: &str = "ResourceAlreadyExists";
/// Azure error code for a share that already exists.
pub const SHARE_ALREADY_EXISTS: &str = "ShareAlreadyExists";
/// Azure error code for a missing file or directory.
pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
/// Azure error code for a missing parent directory.
pub const PARENT_NOT_FOUND: &str = "ParentNotFound";
/// Azure error code for a missing share.
pub const SHARE_NOT_FOUND: &str = "ShareNotFound";

/// Classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection-level failure; eligible for retry.
    Transient,
    /// Transient failures persisted past the retry budget.
    RetryExhausted,
    /// The backend reported that the target does not exist.
    NotFound,
    /// The backend reported that the target already exists.
    AlreadyExists,
    /// Any other protocol, format or local failure.
    Permanent,
}

/// Errors surfaced by the datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request never produced a response (connect failure, reset, timeout).
    #[error("transient transport failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The backend answered with an error status.
    #[error("backend error {status} ({code}): {message}")]
    Backend {
        status: u16,
        code: String,
        message: String,
    },

    /// Transient failures persisted for every allowed attempt.
    #[error("{operation} failed after {attempts} attempts")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    /// Writing the default metadata back to an object failed.
    #[error("could not write default metadata for {path}")]
    SelfHeal {
        path: String,
        #[source]
        source: Box<StoreError>,
    },

    /// Metadata was still empty after the self-healing write-back.
    #[error("metadata for {path} is still empty after self-healing")]
    MetadataUnresolved { path: String },

    /// Metadata keys that Azure cannot store as given.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The host content could not provide its body.
    #[error("content unavailable: {0}")]
    Content(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for unexpected internal errors.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Build a backend error from a status and error code.
    pub fn backend(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Backend {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a transient error for `operation`.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Transient { .. } => ErrorKind::Transient,
            StoreError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            StoreError::Backend { status, code, .. } => {
                if code.ends_with("AlreadyExists") {
                    ErrorKind::AlreadyExists
                } else if *status == 404 || code.ends_with("NotFound") {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::Permanent
                }
            }
            _ => ErrorKind::Permanent,
        }
    }

    /// True if the backend reported a missing resource.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True if the backend reported an already-existing resource.
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// True for errors that came from the backend protocol rather than the
    /// transport, i.e. the backend answered.
    pub fn is_backend(&self) -> bool {
        matches!(self, StoreError::Backend { .. })
    }
}
