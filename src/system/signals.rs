// src/system/signals.rs

use crate::{CancellationToken, constants::EXIT_INTERRUPTED};
use std::io;
use std::sync::atomic::Ordering;
use std::thread;

/// Watches for Ctrl+C on a dedicated thread.
///
/// On the first interrupt the token is set, so every waiter kills its child
/// process, then `cleanup` runs (closing sessions) and the process exits with
/// status 130. The watcher owns a single-threaded tokio runtime; the rest of
/// the program stays synchronous.
pub fn install_interrupt_handler<F>(token: CancellationToken, cleanup: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("fab-signals".to_string())
        .spawn(move || {
            let received = runtime.block_on(async { tokio::signal::ctrl_c().await });
            if let Err(e) = received {
                log::warn!("Could not listen for Ctrl+C: {}", e);
                return;
            }
            std::process::exit(handle_interrupt(&token, cleanup));
        })?;
    Ok(())
}

/// Stops the run: sets the token, runs `cleanup` and returns the exit status.
pub fn handle_interrupt<F: FnOnce()>(token: &CancellationToken, cleanup: F) -> i32 {
    log::debug!("Interrupt received, stopping...");
    token.store(true, Ordering::SeqCst);
    cleanup();
    eprintln!("\nStopped.");
    EXIT_INTERRUPTED
}
