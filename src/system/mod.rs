//! # System Interaction Layer
//!
//! Everything that touches the outside world: local processes, SSH sessions,
//! the terminal, and signals.
//!
//! ## Modules
//!
//! - **`executor`**: Spawns local commands through the user's shell and waits
//!   on them while watching the cancellation token.
//! - **`transport`**: The session and channel traits the core runs against.
//! - **`ssh`**: The OpenSSH implementation of those traits (a shared
//!   `ControlMaster` per host, `sshpass` for password logins).
//! - **`prompt`**: Interactive password, text and confirmation prompts.
//! - **`signals`**: Turns Ctrl+C into a cancelled run with cleanup.

pub mod executor;
pub mod prompt;
pub mod signals;
pub mod ssh;
pub mod transport;
