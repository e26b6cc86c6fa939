//! Error types for the PiggyChick server.
//!
//! # Error Types
//!
//! - [`TasksError`] - Failures while resolving or reading PRD content
//! - [`ConfigError`] - Problems loading or validating the roots config file
//!
//! Every variant carries a stable machine-readable code (see
//! [`TasksError::code`] and [`ConfigError::code`]) that the HTTP layer puts
//! into its JSON error body.
//!
//! Not-found conditions are deliberately undifferentiated: a symlink, a
//! hardlink alias, a containment escape and a missing file all surface as
//! the same [`TasksError::NotFound`].

use axum::http::StatusCode;
use thiserror::Error;

/// Errors raised by the task store and the secure file reader.
#[derive(Error, Debug)]
pub enum TasksError {
    /// The root id is not in the current configuration.
    #[error("Unknown root")]
    InvalidRoot,

    /// The PRD id is malformed or resolves outside the tasks directory.
    #[error("Invalid PRD")]
    InvalidPrd,

    /// The document id is malformed.
    #[error("Invalid document")]
    InvalidDoc,

    /// The requested PRD, worktree or file does not exist or was rejected.
    #[error("{0}")]
    NotFound(&'static str),

    /// An unexpected filesystem failure.
    #[error("{message}")]
    Io {
        /// Human-readable description of the failed operation.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl TasksError {
    /// The generic not-found error used for every rejected file access.
    pub fn not_found() -> Self {
        Self::NotFound("Not found")
    }

    /// Wraps an unexpected I/O failure.
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRoot => "invalid_root",
            Self::InvalidPrd => "invalid_prd",
            Self::InvalidDoc => "invalid_doc",
            Self::NotFound(_) => "not_found",
            Self::Io { .. } => "io_error",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPrd | Self::InvalidDoc => StatusCode::BAD_REQUEST,
            Self::InvalidRoot | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

/// Errors raised while loading the roots configuration file.
///
/// `Clone` because registry initialisation shares its result between every
/// concurrent subscriber of the same root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file parsed but does not match the expected schema.
    #[error("{0}")]
    Invalid(String),

    /// The file is not valid JSONC.
    #[error("{0}")]
    Parse(String),

    /// The file exists but could not be read.
    #[error("{0}")]
    Read(String),
}

impl ConfigError {
    /// Creates a schema validation error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "config_invalid",
            Self::Parse(_) => "config_parse_error",
            Self::Read(_) => "config_read_error",
        }
    }
}
