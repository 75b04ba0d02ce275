//! Command execution abstraction for rschimg.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Result of command execution with captured output
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`
//!
//! Every package-manager, snap-tool, bootloader and key-conversion call in
//! the crate goes through [`CommandExecutor`], so tests can substitute a
//! recording mock and assert on the exact argument vectors and environments.

mod real;

use std::process::ExitStatus;

use anyhow::Result;
use camino::Utf8PathBuf;

pub use real::RealCommandExecutor;

/// Formats string arguments into a space-separated, debug-quoted string.
///
/// Used by error messages to consistently format command arguments
/// (e.g., `"install" "--assume-yes" "fuse3"`).
pub(crate) fn format_command_args(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("{:?}", a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Specification for a command to be executed.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "apt-get")
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (optional, defaults to current directory)
    pub cwd: Option<Utf8PathBuf>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
    /// Run the joined command line through `/bin/sh -c` instead of spawning
    /// the program directly. Needed where apt patterns or sed expressions
    /// rely on shell quoting.
    pub shell: bool,
    /// Exit codes treated as success. Defaults to `[0]`.
    pub success_codes: Vec<i32>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args.
    #[must_use]
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            shell: false,
            success_codes: vec![0],
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds multiple environment variables.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Requests shell interpretation of the joined command line.
    #[must_use]
    pub fn with_shell(mut self) -> Self {
        self.shell = true;
        self
    }

    /// Replaces the set of acceptable exit codes.
    #[must_use]
    pub fn with_success_codes(mut self, codes: Vec<i32>) -> Self {
        self.success_codes = codes;
        self
    }

    /// Returns the command and arguments as one display string.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, format_command_args(&self.args))
        }
    }
}

/// Result of a successful command execution.
///
/// An unacceptable exit code is reported as `ChimgError::Execution` by the
/// executor, so a returned `ExecutionResult` always denotes success.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status of the command.
    pub status: Option<ExitStatus>,
    /// Captured standard output, decoded as UTF-8 (lossy) and trimmed.
    pub stdout: String,
    /// Captured standard error, decoded as UTF-8 (lossy) and trimmed.
    pub stderr: String,
}

impl ExecutionResult {
    /// Returns an empty success result. Useful for mock executors.
    pub fn empty() -> Self {
        Self {
            status: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Returns a success result carrying the given stdout. Useful for mock
    /// executors that emulate tool output parsing.
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            status: None,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so the executor can be shared as
/// `Arc<dyn CommandExecutor>` across the orchestrator and its guards.
pub trait CommandExecutor: Send + Sync {
    /// Executes a command with the given specification.
    ///
    /// Returns an error if the process cannot be spawned or exits with a
    /// code outside `spec.success_codes`.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}
