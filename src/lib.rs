//! Run shell commands and file transfers across many SSH hosts from one
//! invocation.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Set once the run must stop: Ctrl+C, an abort, or a failed parallel task.
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;

#[cfg(test)]
mod testing;
