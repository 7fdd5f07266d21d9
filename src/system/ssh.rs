// src/system/ssh.rs

//! OpenSSH-backed transport.
//!
//! Each session is an OpenSSH ControlMaster: `connect` authenticates once and
//! leaves a master process listening on a private control socket. Channels and
//! file transfers are multiplexed over that socket, so they never
//! re-authenticate. Password logins go through `sshpass -e`; key logins run in
//! `BatchMode` so ssh never prompts on its own.

use crate::system::transport::{Channel, ConnectParams, Session, SessionTransport, TransportError};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::{NamedTempFile, TempDir};

/// How long an orphaned master lingers once nothing uses it.
const CONTROL_PERSIST: &str = "ControlPersist=10m";

/// Exit code sshpass uses for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

const AUTH_FAILURE_MARKERS: &[&str] = &[
    "Permission denied",
    "Authentication failed",
    "Too many authentication failures",
    "incorrect password",
];

/// Opens ControlMaster sessions with the system `ssh` binary.
#[derive(Debug)]
pub struct OpenSshTransport {
    control_dir: TempDir,
    counter: AtomicUsize,
    connect_timeout_secs: u32,
}

impl OpenSshTransport {
    /// Creates the transport and its private control-socket directory.
    pub fn new() -> Result<Self, TransportError> {
        let control_dir = tempfile::Builder::new()
            .prefix("fab-")
            .tempdir()
            .map_err(|source| TransportError::Io {
                target: "localhost".to_string(),
                source,
            })?;
        Ok(Self {
            control_dir,
            counter: AtomicUsize::new(0),
            connect_timeout_secs: 10,
        })
    }

    fn master_args(&self, params: &ConnectParams, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            control_path.display().to_string(),
            "-o".to_string(),
            CONTROL_PERSIST.to_string(),
            "-f".to_string(),
            "-N".to_string(),
            "-p".to_string(),
            params.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if params.accept_new_host_keys {
                    "accept-new"
                } else {
                    "yes"
                }
            ),
        ];

        if let Some(key) = &params.key_filename {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        if params.password.is_some() {
            args.extend(["-o".to_string(), "NumberOfPasswordPrompts=1".to_string()]);
        } else {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }

        args.push(format!("{}@{}", params.user, params.hostname));
        args
    }
}

impl SessionTransport for OpenSshTransport {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, TransportError> {
        let target = params.target();
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let control_path = self.control_dir.path().join(format!("{}.sock", n));
        let args = self.master_args(params, &control_path);

        let (program, mut command) = match &params.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg("ssh").env("SSHPASS", password);
                ("sshpass", command)
            }
            None => ("ssh", Command::new("ssh")),
        };

        // The master forks into the background and keeps its stdio open, so
        // stderr goes to a file instead of a pipe we would wait on forever.
        let io_err = |source: io::Error| TransportError::Io {
            target: target.clone(),
            source,
        };
        let stderr_file = NamedTempFile::new().map_err(io_err)?;
        let stderr_handle = stderr_file.reopen().map_err(io_err)?;

        log::debug!("Starting ssh master for {} ({})", target, control_path.display());
        let status = command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .status()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => TransportError::MissingTool(program.to_string()),
                _ => io_err(e),
            })?;

        if status.success() {
            return Ok(Box::new(OpenSshSession {
                control_path,
                destination: format!("{}@{}", params.user, params.hostname),
                port: params.port,
                closed: AtomicBool::new(false),
            }));
        }

        let detail = fs::read_to_string(stderr_file.path())
            .unwrap_or_default()
            .trim()
            .to_string();
        let bad_password = params.password.is_some() && status.code() == Some(SSHPASS_BAD_PASSWORD);
        if bad_password || AUTH_FAILURE_MARKERS.iter().any(|m| detail.contains(m)) {
            Err(TransportError::Authentication { target, detail })
        } else {
            Err(TransportError::Connect {
                target,
                detail: if detail.is_empty() {
                    format!("ssh exited with {}", status)
                } else {
                    detail
                },
            })
        }
    }
}

/// A session multiplexed over an ssh control socket.
#[derive(Debug)]
pub struct OpenSshSession {
    control_path: PathBuf,
    destination: String,
    port: u16,
    closed: AtomicBool,
}

impl OpenSshSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed(self.destination.clone()))
        } else {
            Ok(())
        }
    }

    fn io_error(&self, source: io::Error) -> TransportError {
        TransportError::Io {
            target: self.destination.clone(),
            source,
        }
    }

    fn scp(&self, from: &str, to: &str, path_for_errors: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let output = Command::new("scp")
            .arg("-q")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-P")
            .arg(self.port.to_string())
            .arg(from)
            .arg(to)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => TransportError::MissingTool("scp".to_string()),
                _ => self.io_error(e),
            })?;
        check_output(&output, path_for_errors)
    }
}

impl Session for OpenSshSession {
    fn open_channel(&self, command: &str) -> Result<Channel, TransportError> {
        self.ensure_open()?;
        let mut child = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-p")
            .arg(self.port.to_string())
            .args(["-T", "-o", "BatchMode=yes", "-o", "LogLevel=ERROR"])
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.io_error(e))?;

        let missing = |what: &str| {
            self.io_error(io::Error::new(
                ErrorKind::BrokenPipe,
                format!("channel {} was not captured", what),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        Ok(Channel {
            stdin: Some(Box::new(stdin)),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            process: Box::new(child),
        })
    }

    fn put(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let local_str = local.display().to_string();
        self.scp(&local_str, &format!("{}:{}", self.destination, remote), &local_str)
    }

    fn get(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.scp(
            &format!("{}:{}", self.destination, remote),
            &local.display().to_string(),
            remote,
        )
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Closing ssh master for {}", self.destination);
        let output = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.io_error(e))?;
        if !output.status.success() {
            log::warn!(
                "ssh master for {} did not exit cleanly: {}",
                self.destination,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

fn check_output(output: &Output, path: &str) -> Result<(), TransportError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(TransportError::Transfer {
            path: path.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
