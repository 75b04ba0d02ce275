//! Domain-specific error types for rschimg.
//!
//! This module defines `ChimgError`, a `thiserror`-based enum that provides
//! typed error variants for the failure modes of a customization run. Public
//! API functions return `Result<T, ChimgError>` where the failure set is
//! closed; trait boundaries and orchestration code use `anyhow::Result`.
//!
//! `ChimgError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at boundaries that return `anyhow::Result`.

use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// kinds, falls back to the OS-level error message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for rschimg.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChimgError {
    /// An external command exited with an unacceptable code.
    ///
    /// The captured output streams are carried so callers (and the log) can
    /// show what the tool printed; the environment and working directory are
    /// logged at the call site rather than carried here.
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command line that was executed.
        command: String,
        /// Exit status, signal information, or a description of the internal
        /// failure (spawn error, wait error).
        status: String,
        /// Captured standard output of the failed command.
        stdout: String,
        /// Captured standard error of the failed command.
        stderr: String,
    },

    /// An expected artifact or field could not be resolved where exactly one
    /// was required (download produced zero or multiple `.snap`/`.assert`
    /// files, an assertion lacks a required field).
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The declarative configuration violates an invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// A configuration file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation requires state that is absent or conflicting
    /// (e.g., a concurrent run already holds the target lock).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred, usually an operation
        /// description with a path (e.g., `"failed to write seed manifest:
        /// /mnt/rootfs/var/lib/snapd/seed/seed.yaml"`).
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl ChimgError {
    /// Creates an `Io` variant with the `message` field derived from the
    /// `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_display() {
        let err = ChimgError::Execution {
            command: "apt-get install --assume-yes fuse3".to_string(),
            status: "exit status: 100".to_string(),
            stdout: String::new(),
            stderr: "E: Unable to locate package fuse3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command execution failed: apt-get install --assume-yes fuse3: exit status: 100"
        );
    }

    #[test]
    fn test_resolution_display() {
        let err = ChimgError::Resolution(
            "expected exactly one .snap file for snap hello, found 2".to_string(),
        );
        assert!(err.to_string().starts_with("resolution error: "));
    }

    #[test]
    fn test_validation_display() {
        let err =
            ChimgError::Validation("file etc/motd: exactly one of content or source".to_string());
        assert_eq!(
            err.to_string(),
            "validation error: file etc/motd: exactly one of content or source"
        );
    }

    #[test]
    fn test_precondition_display() {
        let err = ChimgError::Precondition("another run holds /mnt/rootfs".to_string());
        assert_eq!(err.to_string(), "precondition failed: another run holds /mnt/rootfs");
    }

    #[test]
    fn test_io_display() {
        let source = io::Error::new(io::ErrorKind::NotFound, "entity not found");
        let err = ChimgError::io("/mnt/rootfs/etc/apt/sources.list.d/ppa.sources", source);
        assert_eq!(
            err.to_string(),
            "/mnt/rootfs/etc/apt/sources.list.d/ppa.sources: I/O error: not found"
        );
    }

    #[test]
    fn test_io_source_preserved() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = ChimgError::io("/etc/shadow", source);
        match &err {
            ChimgError::Io { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_io_error_kind_message_other() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(io_error_kind_message(&err).starts_with("I/O error: "));
    }

    #[test]
    fn test_into_anyhow_error() {
        let err = ChimgError::Resolution("missing account-id field".to_string());
        let anyhow_err: anyhow::Error = err.into();
        let downcast = anyhow_err.downcast_ref::<ChimgError>();
        assert!(matches!(downcast, Some(ChimgError::Resolution(_))));
    }
}
