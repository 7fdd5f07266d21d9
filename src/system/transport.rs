// src/system/transport.rs

//! The session transport seam.
//!
//! The orchestrator never speaks the remote-session protocol itself. It asks a
//! [`SessionTransport`] for an authenticated [`Session`], opens [`Channel`]s on
//! it to run commands, and uses its file primitives for transfers. The default
//! implementation lives in [`crate::system::ssh`].

use crate::system::executor::ProcessHandle;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Authentication failed for {target}: {detail}")]
    Authentication { target: String, detail: String },
    #[error("Could not connect to {target}: {detail}")]
    Connect { target: String, detail: String },
    #[error("Required tool '{0}' was not found in PATH.")]
    MissingTool(String),
    #[error("Session to {0} is closed.")]
    Closed(String),
    #[error("Transfer of '{path}' failed: {detail}")]
    Transfer { path: String, detail: String },
    #[error("I/O error talking to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// True when retrying with a different credential may help.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Everything a transport needs to open a session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Hostname or address.
    pub hostname: String,
    /// SSH port.
    pub port: u16,
    /// Login identity.
    pub user: String,
    /// Password, when known.
    pub password: Option<String>,
    /// Private key file, when configured.
    pub key_filename: Option<PathBuf>,
    /// Accept and record unknown host keys.
    pub accept_new_host_keys: bool,
}

impl ConnectParams {
    /// `user@host:port`, for messages.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.hostname, self.port)
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_filename", &self.key_filename)
            .field("accept_new_host_keys", &self.accept_new_host_keys)
            .finish()
    }
}

/// A command running on a remote host: its byte streams and its exit status.
pub struct Channel {
    /// Writable end of the remote stdin, if the transport exposes it.
    pub stdin: Option<Box<dyn Write + Send>>,
    /// Remote stdout.
    pub stdout: Box<dyn Read + Send>,
    /// Remote stderr.
    pub stderr: Box<dyn Read + Send>,
    /// Handle used to wait for (or kill) the remote command.
    pub process: Box<dyn ProcessHandle>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// A live, authenticated connection to one host.
pub trait Session: Send + Sync {
    /// Starts `command` on the remote host.
    fn open_channel(&self, command: &str) -> Result<Channel, TransportError>;
    /// Uploads a local file.
    fn put(&self, local: &Path, remote: &str) -> Result<(), TransportError>;
    /// Downloads a remote file.
    fn get(&self, remote: &str, local: &Path) -> Result<(), TransportError>;
    /// Closes the session. Further use fails with [`TransportError::Closed`].
    fn close(&self) -> Result<(), TransportError>;
}

/// Opens sessions.
pub trait SessionTransport: Send + Sync {
    /// Connects and authenticates with `params`.
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, TransportError>;
}
