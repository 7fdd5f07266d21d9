// src/system/executor.rs

use crate::{CancellationToken, constants::CANCELLATION_POLL_MS};
use std::io;
use std::process::{Child, Command as StdCommand, Stdio};
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("No command specified to run.")]
    EmptyCommand,
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, #[source] io::Error),
    #[error("Operation was cancelled by the user.")]
    Cancelled,
}

/// A running process (local or remote channel) that can be polled and killed.
pub trait ProcessHandle: Send {
    /// Returns the exit status once the process has finished.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;
    /// Terminates the process.
    fn kill(&mut self) -> io::Result<()>;
}

impl ProcessHandle for Child {
    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        // A process killed by a signal has no code; report it as a generic failure.
        Ok(Child::try_wait(self)?.map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)?;
        Child::wait(self).map(|_| ())
    }
}

/// Returns `Err(Cancelled)` once the token has been set.
pub fn check_for_cancellation(cancellation_token: &CancellationToken) -> Result<(), ExecutionError> {
    if cancellation_token.load(Ordering::SeqCst) {
        Err(ExecutionError::Cancelled)
    } else {
        Ok(())
    }
}

/// Waits for `handle` to exit, killing it if the cancellation token is set meanwhile.
pub fn wait_for_exit(
    handle: &mut dyn ProcessHandle,
    label: &str,
    cancellation_token: &CancellationToken,
) -> Result<i32, ExecutionError> {
    // Non-blocking wait loop to allow for cancellation.
    loop {
        match handle.try_wait() {
            Ok(Some(code)) => return Ok(code),
            Ok(None) => {
                if check_for_cancellation(cancellation_token).is_err() {
                    log::debug!("Cancellation requested, killing '{}'...", label);
                    if let Err(e) = handle.kill() {
                        log::warn!("Failed to kill '{}': {}", label, e);
                    }
                    return Err(ExecutionError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(CANCELLATION_POLL_MS));
            }
            Err(e) => return Err(ExecutionError::CommandFailed(label.to_string(), e)),
        }
    }
}

/// Runs `command_line` through the local shell with inherited stdio and returns its exit code.
pub fn execute_shell_command(
    command_line: &str,
    cancellation_token: &CancellationToken,
) -> Result<i32, ExecutionError> {
    check_for_cancellation(cancellation_token)?;

    let trimmed_command = command_line.trim();
    if trimmed_command.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }

    #[cfg(windows)]
    let mut command = {
        let mut command = StdCommand::new("cmd");
        command.args(["/C", trimmed_command]);
        command
    };

    #[cfg(not(windows))]
    let mut command = {
        let mut command = StdCommand::new("sh");
        command.args(["-c", trimmed_command]);
        command
    };

    let mut child = command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| ExecutionError::CommandFailed(trimmed_command.to_string(), e))?;

    wait_for_exit(&mut child, trimmed_command, cancellation_token)
}
