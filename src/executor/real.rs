//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command` with captured output. Unlike a streaming
//! executor, output is buffered: callers parse machine-oriented tool output
//! (snap metadata, findmnt/blkid values, assertion text) from
//! `ExecutionResult::stdout`.

use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, error, trace};
use which::which;

use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::ChimgError;

/// Command executor that runs actual system commands and captures their
/// output.
#[derive(Debug, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    fn build_command(&self, spec: &CommandSpec) -> Result<Command> {
        let mut command = if spec.shell {
            // Joined invocation through the shell; needed where the argv
            // carries quoting or glob patterns the target tool must not see
            // pre-expanded (apt purge patterns, sed expressions).
            let mut joined = spec.command.clone();
            for arg in &spec.args {
                joined.push(' ');
                joined.push_str(arg);
            }
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(joined);
            command
        } else {
            let cmd = which(&spec.command)
                .with_context(|| format!("command not found: {}", spec.command))?;
            trace!("command found: {}: {}", spec.command, cmd.to_string_lossy());
            let mut command = Command::new(cmd);
            command.args(&spec.args);
            command
        };

        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        Ok(command)
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        debug!("running command: {}", spec.display());

        let mut command = self.build_command(spec)?;
        let output = command
            .output()
            .with_context(|| format!("failed to spawn command: {}", spec.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        let acceptable = output
            .status
            .code()
            .is_some_and(|code| spec.success_codes.contains(&code));
        if !acceptable {
            error!(
                "command failed with {} (success codes: {:?})",
                output.status, spec.success_codes
            );
            error!("env: {:?}", spec.env);
            error!("cwd: {:?}", spec.cwd);
            error!("stdout: {}", stdout);
            error!("stderr: {}", stderr);
            return Err(ChimgError::Execution {
                command: spec.display(),
                status: output.status.to_string(),
                stdout,
                stderr,
            }
            .into());
        }

        trace!("executed command: {}: {}", spec.command, output.status);
        debug!("stdout: {}", stdout);
        debug!("stderr: {}", stderr);

        Ok(ExecutionResult {
            status: Some(output.status),
            stdout,
            stderr,
        })
    }
}
