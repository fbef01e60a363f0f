//! Custom error types for learnloop.
//!
//! Apply-time and verify-time failures are *data* (recorded on
//! [`crate::fix::FixResult`]), not errors. This module covers the faults
//! that must surface to the caller: ledger I/O, missing prompts or
//! findings files, and invalid configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for learnloop operations
#[derive(Error, Debug)]
pub enum LoopError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Ledger read or write failed
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        path: Option<PathBuf>,
    },

    /// Prompt document does not exist in the store
    #[error("Prompt not found: {prompt_id} ({path})")]
    PromptNotFound { prompt_id: String, path: PathBuf },

    /// Findings file does not exist
    #[error("Findings file not found: {path}")]
    FindingsNotFound { path: PathBuf },

    // =========================================================================
    // Verification Errors
    // =========================================================================
    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    /// Verifier could not be constructed or invoked
    #[error("Verifier error ({stage}): {message}")]
    Verifier { stage: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            path: None,
        }
    }

    /// Create a storage error with the offending path
    pub fn storage_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Storage {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a verifier error
    pub fn verifier(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Verifier {
            stage: stage.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error means a requested entity was absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PromptNotFound { .. } | Self::FindingsNotFound { .. }
        )
    }

    /// Check if this error is fatal (storage faults are never silently swallowed)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Io(_))
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PromptNotFound { .. } | Self::FindingsNotFound { .. } => 2,
            Self::Storage { .. } => 3,
            Self::MissingTool { .. } | Self::Verifier { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for learnloop results
pub type Result<T> = std::result::Result<T, LoopError>;
