// src/core/output.rs

//! User-facing output.
//!
//! Everything the user should see goes through a [`Reporter`], so strategies
//! running on worker threads never interleave half-lines and tests can capture
//! what would have been printed.

use crate::models::FailurePolicy;
use colored::Colorize;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::thread::{self, JoinHandle};

/// Which remote stream a forwarded line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output.
    Out,
    /// Standard error.
    Err,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Out => "out",
            Self::Err => "err",
        })
    }
}

/// Sink for progress messages, failure reports and forwarded remote output.
pub trait Reporter: Send + Sync {
    /// Progress and banners.
    fn info(&self, message: &str);
    /// A failure reported under the `warn` policy.
    fn warn(&self, message: &str);
    /// A failure reported under the `abort` policy, or a fatal error.
    fn error(&self, message: &str);
    /// One line of output produced on `host`.
    fn line(&self, host: &str, stream: Stream, line: &str);
}

/// Prints to the terminal with `colored` styling.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn info(&self, message: &str) {
        println!("{}", message);
    }

    fn warn(&self, message: &str) {
        println!("{}{}", FailurePolicy::Warn.message_prefix().yellow().bold(), message);
    }

    fn error(&self, message: &str) {
        eprintln!("{}{}", FailurePolicy::Abort.message_prefix().red().bold(), message);
    }

    fn line(&self, host: &str, stream: Stream, line: &str) {
        let prefix = format!("[{}] {}:", host, stream);
        let prefix = match stream {
            Stream::Out => prefix.cyan(),
            Stream::Err => prefix.magenta(),
        };
        // One locked write per line keeps concurrent hosts from splicing lines together.
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        if let Err(e) = writeln!(handle, "{} {}", prefix, line) {
            log::trace!("Could not forward output line: {}", e);
        }
    }
}

/// Spawns a thread forwarding `reader` line by line to `reporter`, prefixed with `host`.
///
/// The thread ends when the stream reaches end-of-file.
pub fn forward_lines<R>(
    reader: R,
    host: String,
    stream: Stream,
    reporter: std::sync::Arc<dyn Reporter>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-{}", host, stream))
        .spawn(move || {
            let reader = BufReader::new(reader);
            for line in reader.lines() {
                match line {
                    Ok(line) => reporter.line(&host, stream, line.trim_end_matches('\r')),
                    Err(e) => {
                        log::trace!("[{}] {} stream closed: {}", host, stream, e);
                        break;
                    }
                }
            }
        })
        .unwrap_or_else(|e| {
            log::warn!("Could not spawn output forwarder: {}", e);
            thread::spawn(|| {})
        })
}

/// Indents every line of `text` by `level` spaces.
pub fn indent(text: &str, level: usize) -> String {
    let pad = " ".repeat(level);
    text.lines()
        .map(|line| format!("{}{}", pad, line))
        .collect::<Vec<_>>()
        .join("\n")
}
