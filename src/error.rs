//! Domain-specific error types for monci.
//!
//! This module defines `MonciError`, a `thiserror`-based enum providing
//! typed error variants for the failure kinds named in the design: bad
//! config, ambient preconditions a host does not meet, subprocess
//! failures, guest-callable failures, and best-effort cleanup failures.
//! Public API functions return `Result<T, MonciError>`; trait boundaries
//! and orchestration glue use `anyhow::Result`.
//!
//! `MonciError` implements `Into<anyhow::Error>`, so `?` converts it
//! automatically at boundaries that return `anyhow::Result`.

use std::io;

/// Formats an IO error kind into a human-readable message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        io::ErrorKind::AlreadyExists => "I/O error: already exists".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Exit codes mandated by the external CLI contract.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAIL: i32 = 1;
    pub const LINT_ERRORS: i32 = 2;
    pub const BOOTSTRAP_FAILURE: i32 = 5;
    pub const UPDATE_FAILURE: i32 = 6;
}

/// Domain-specific error type for monci.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MonciError {
    /// Config/validation failure: bad YAML, unknown image, conflicting
    /// options. Printed as a single line with no traceback; exits 1.
    #[error("{0}")]
    Fail(String),

    /// An ambient precondition the host does not satisfy: cgroup-v1 guest
    /// on a cgroup-v2-only host, a missing bootstrapper binary, a missing
    /// tool. Test suites should treat this as a skip condition.
    #[error("container cannot start: {0}")]
    ContainerCannotStart(String),

    /// A subprocess exited non-zero (or could not be spawned/waited on).
    #[error("command failed: {command}: {status}")]
    Subprocess {
        /// The command line that was run, for diagnostics.
        command: String,
        /// Human-readable reason: exit code, signal, or spawn failure.
        status: String,
    },

    /// A `run_callable` payload failed inside the guest; the guest's
    /// formatted error chain is carried verbatim since Rust has no
    /// cross-process traceback to re-raise.
    #[error("callable failed in guest: {0}")]
    Callable(String),

    /// A best-effort cleanup step failed. Constructed only so the
    /// failure can be logged (`tracing::warn!`); never returned from a
    /// function that also has a primary error to report.
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl MonciError {
    /// Creates an `Io` variant with `message` derived from `source`.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates a `Subprocess` variant from a command line and a status
    /// description (exit code, signal, or spawn-failure text).
    pub fn subprocess(command: impl Into<String>, status: impl Into<String>) -> Self {
        Self::Subprocess {
            command: command.into(),
            status: status.into(),
        }
    }

    /// Maps this error to the process exit code it should produce when
    /// surfaced at the top level, absent a more specific command-level
    /// mapping (bootstrap -> 5, update -> 6, lint -> 2 are applied by the
    /// CLI dispatcher, not here).
    pub fn exit_code(&self) -> i32 {
        match self {
            MonciError::ContainerCannotStart(_) => exit_code::BOOTSTRAP_FAILURE,
            _ => exit_code::FAIL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_display() {
        let err = MonciError::Fail("unknown image 'bookworm2'".to_string());
        assert_eq!(err.to_string(), "unknown image 'bookworm2'");
    }

    #[test]
    fn test_container_cannot_start_display() {
        let err = MonciError::ContainerCannotStart("cgroup v1 required".to_string());
        assert_eq!(err.to_string(), "container cannot start: cgroup v1 required");
    }

    #[test]
    fn test_subprocess_display() {
        let err = MonciError::subprocess("apt-get update", "exit status: 100");
        assert_eq!(err.to_string(), "command failed: apt-get update: exit status: 100");
    }

    #[test]
    fn test_callable_display() {
        let err = MonciError::Callable("build() raised OSError".to_string());
        assert_eq!(err.to_string(), "callable failed in guest: build() raised OSError");
    }

    #[test]
    fn test_cleanup_display() {
        let err = MonciError::Cleanup("failed to unmount /srv/moncic-ci/build".to_string());
        assert_eq!(err.to_string(), "cleanup failed: failed to unmount /srv/moncic-ci/build");
    }

    #[test]
    fn test_io_display() {
        let source = io::Error::new(io::ErrorKind::NotFound, "entity not found");
        let err = MonciError::io("/etc/monci/config.yaml", source);
        assert_eq!(err.to_string(), "/etc/monci/config.yaml: I/O error: not found");
    }

    #[test]
    fn test_io_source_preserved() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = MonciError::io("/var/lib/machines", source);
        match &err {
            MonciError::Io { source, .. } => assert_eq!(source.kind(), io::ErrorKind::PermissionDenied),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_into_anyhow_error() {
        let err = MonciError::Fail("bad config".to_string());
        let anyhow_err: anyhow::Error = err.into();
        let downcast = anyhow_err.downcast_ref::<MonciError>();
        assert!(downcast.is_some());
        assert!(matches!(downcast.unwrap(), MonciError::Fail(_)));
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(MonciError::Fail("x".into()).exit_code(), exit_code::FAIL);
        assert_eq!(
            MonciError::ContainerCannotStart("x".into()).exit_code(),
            exit_code::BOOTSTRAP_FAILURE
        );
        assert_eq!(MonciError::subprocess("a", "b").exit_code(), exit_code::FAIL);
    }
}
