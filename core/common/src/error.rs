//! Common error types for docsync.

use thiserror::Error;

/// Reasons a registration cannot complete.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The sync fabric root could not be reached.
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// The remote structure was written by an incompatible format version.
    #[error("incompatible remote format version {found} (supported: {supported})")]
    IncompatibleVersion {
        /// Version found at the remote.
        found: String,
        /// Version this build understands.
        supported: String,
    },

    /// The remote structure exists but does not match what was expected.
    #[error("invalid remote structure: {0}")]
    InvalidStructure(String),

    /// A document was registered before its application.
    #[error("application not registered: {0}")]
    ApplicationNotRegistered(String),
}

/// Top-level error type for docsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Registration failed.
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// A registration is already in flight for this manager.
    #[error("Registration already in progress")]
    AlreadyRegistering,

    /// The operation was cancelled before it could finish.
    #[error("Operation cancelled")]
    Cancelled,

    /// Converting or appending a save failed; nothing was committed.
    #[error("Save processing error: {0}")]
    SaveProcessing(String),

    /// Backend-specific transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested transition is not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Returns true for the cancelled outcome, which is not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
