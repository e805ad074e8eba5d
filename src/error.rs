//! Error types for the discovery core

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`PmError`]
pub type Result<T> = std::result::Result<T, PmError>;

/// Main error type for the discovery core
#[derive(Debug, Error)]
pub enum PmError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error
    #[error("Failed to parse config at {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    /// Agent lookup failed across all tiers
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Malformed header in an agent file
    #[error("Failed to parse agent file {path}: {message}")]
    ParseFailed { path: PathBuf, message: String },

    /// Agent file removed between resolution and read
    #[error("Agent source vanished: {path}")]
    SourceVanished { path: PathBuf },

    /// Permission or I/O failure on a scan directory
    #[error("Directory unreadable {path}: {message}")]
    DirectoryUnreadable { path: PathBuf, message: String },

    /// Deadline exceeded
    #[error("Operation timed out: {operation}")]
    Timeout { operation: &'static str },

    /// Operation invoked before `start`
    #[error("Core has not been started")]
    NotStarted,

    /// Operation invoked after `stop`
    #[error("Core has been stopped")]
    Stopped,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl PmError {
    /// Stable kind label used in activity records
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PmError::Io(_) => "io",
            PmError::ConfigParse { .. } => "config_parse",
            PmError::ConfigValidation(_) => "config_validation",
            PmError::AgentNotFound(_) => "agent_not_found",
            PmError::ParseFailed { .. } => "parse_failed",
            PmError::SourceVanished { .. } => "source_vanished",
            PmError::DirectoryUnreadable { .. } => "directory_unreadable",
            PmError::Timeout { .. } => "timeout",
            PmError::NotStarted => "not_started",
            PmError::Stopped => "stopped",
            PmError::Json(_) => "json",
            PmError::Other(_) => "other",
        }
    }
}
