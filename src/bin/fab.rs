// src/bin/fab.rs

use clap::Parser;
use colored::*;
use hostfab::{
    cli::{Cli, dispatcher::run_cli},
    core::orchestrator::RunError,
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Entry point of `fab`: sets up logging, runs the CLI and maps errors to exit codes.
fn main() {
    let cancellation_token = Arc::new(AtomicBool::new(false));
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse(), cancellation_token) {
        if let Some(run_err) = e.downcast_ref::<RunError>() {
            // Aborts were printed by the failure policy; interrupts exit quietly.
            if run_err.is_reported() {
                std::process::exit(run_err.exit_code());
            }
        }

        eprintln!("\n{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}
