//! Error types for sandpreview

use thiserror::Error;

/// Result type alias using sandpreview's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Booting the sandbox runtime
    Boot,
    /// Writing the mount tree into the sandbox
    Mount,
    /// Running the dependency install command
    Install,
    /// Running the start command and waiting for the server
    Serve,
    /// Anything outside the pipeline
    Other,
}

/// Main error type for sandpreview
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sandbox runtime failed to boot
    #[error("Failed to boot sandbox: {0}")]
    Boot(String),

    /// Mount tree could not be written into the sandbox
    #[error("Failed to mount files: {0}")]
    Mount(String),

    /// Dependency install exited with a non-zero code
    #[error("Dependency install failed with exit code {exit_code}")]
    Install {
        /// Exit code reported by the install process
        exit_code: i32,
    },

    /// A process could not be started, or lost track of, inside the sandbox
    #[error("Failed to spawn process: {message}")]
    Spawn {
        /// Stage the process belonged to
        stage: Stage,
        /// What went wrong
        message: String,
    },

    /// The start command never signalled readiness
    #[error("Preview server never became ready: {0}")]
    ServeNeverReady(String),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Pipeline stage this error belongs to
    pub fn stage(&self) -> Stage {
        match self {
            Error::Boot(_) => Stage::Boot,
            Error::Mount(_) => Stage::Mount,
            Error::Install { .. } => Stage::Install,
            Error::Spawn { stage, .. } => *stage,
            Error::ServeNeverReady(_) => Stage::Serve,
            _ => Stage::Other,
        }
    }

    /// Attribute a spawn failure to `stage`; other errors are returned as is
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Error::Spawn { message, .. } => Error::Spawn { stage, message },
            other => other,
        }
    }

    /// Check if retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Boot(_) | Error::ServeNeverReady(_) | Error::Container(_) | Error::Io(_)
        )
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_) | Error::Config(_))
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}
