//! Error types for curator.
//!
//! Library crates use [`CuratorError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Variants follow the pipeline's recovery policy: source, collaborator and
//! schema failures are recovered where they happen (a source, batch or item is
//! dropped), while phase-invariant and persistence failures abort the run.

use std::path::PathBuf;

/// Top-level error type for all curator operations.
#[derive(Debug, thiserror::Error)]
pub enum CuratorError {
    /// Configuration loading error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A single source could not be fetched or parsed.
    #[error("source error ({source_id}): {message}")]
    Source { source_id: String, message: String },

    /// Network/HTTP error outside of a specific source.
    #[error("network error: {0}")]
    Network(String),

    /// Text-generation call failed (transport, timeout, or provider error).
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Collaborator response did not match the expected structure.
    #[error("schema error: {message}")]
    Schema { message: String },

    /// A phase invariant was violated (e.g. weights not summing to 1.0).
    #[error("phase error in {phase}: {message}")]
    Phase { phase: String, message: String },

    /// Database or checkpoint storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Report rendering failed.
    #[error("render error: {0}")]
    Render(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, invalid identifier, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CuratorError>;

impl CuratorError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a source error for `source_id`.
    pub fn source(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    /// Create a schema error from any displayable message.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema {
            message: msg.into(),
        }
    }

    /// Create a phase-invariant error.
    pub fn phase(phase: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is scoped to one source, batch or item.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Source { .. } | Self::Network(_) | Self::Collaborator(_) | Self::Schema { .. }
        )
    }

    /// Whether the failure must abort the whole run regardless of phase fatality.
    pub fn aborts_run(&self) -> bool {
        matches!(self, Self::Phase { .. } | Self::Storage(_) | Self::Io { .. })
    }

    /// Short taxonomy label recorded in run error lists.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Source { .. } => "source",
            Self::Network(_) => "network",
            Self::Collaborator(_) => "collaborator",
            Self::Schema { .. } => "schema",
            Self::Phase { .. } => "phase",
            Self::Storage(_) => "persistence",
            Self::Render(_) => "render",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CuratorError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = CuratorError::phase("tier3_score", "weights sum to 0.9");
        assert!(err.to_string().contains("tier3_score"));
        assert!(err.to_string().contains("0.9"));
    }

    #[test]
    fn recovery_classification() {
        assert!(CuratorError::source("hn", "timeout").is_recoverable());
        assert!(CuratorError::schema("missing field").is_recoverable());
        assert!(CuratorError::Collaborator("502".into()).is_recoverable());
        assert!(!CuratorError::Storage("disk full".into()).is_recoverable());

        assert!(CuratorError::Storage("disk full".into()).aborts_run());
        assert!(CuratorError::phase("tier2_score", "bad").aborts_run());
        assert!(!CuratorError::Render("template".into()).aborts_run());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(CuratorError::Storage("x".into()).kind(), "persistence");
        assert_eq!(CuratorError::schema("x").kind(), "schema");
    }
}
