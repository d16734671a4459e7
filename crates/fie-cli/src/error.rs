//! CLI error types.

use fienode::NodeError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Malformed shell command or arguments.
    #[error("usage: {0}")]
    Usage(String),

    /// Node or orchestrator operation failed.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Shorthand for a usage error.
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_error_display_usage() {
        let err = CliError::usage("migrate <container> <node>");
        assert_eq!(err.to_string(), "usage: migrate <container> <node>");
    }

    #[test]
    fn cli_error_node_is_transparent() {
        let err = CliError::from(NodeError::container_not_found("fog-9"));
        assert_eq!(err.to_string(), "container not found: fog-9");
    }

    #[test]
    fn cli_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let cli_err = CliError::from(io_err);
        assert!(matches!(cli_err, CliError::Io(_)));
    }
}
