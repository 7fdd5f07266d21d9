// src/cli/mod.rs

use clap::Parser;
use std::path::PathBuf;

pub mod args;
pub mod dispatcher;

/// fab: run shell commands and file transfers across many SSH hosts.
///
/// Commands are named after the options, each optionally followed by
/// `:key=value,key2=value2` arguments:
///
/// ```text
/// fab -H web1,web2 run:"uptime"
/// fab set:fab_user=deploy staging deploy:tag=v1.2
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(disable_help_subcommand = true)]
#[command(
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
pub struct Cli {
    /// Hosts to operate on (sets `fab_hosts`), e.g. `web1,deploy@web2:2222`.
    #[arg(short = 'H', long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Execution strategy (sets `fab_mode`): `rolling` or `fanout`.
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Fabfile to load instead of `fabfile.toml` in the current directory.
    #[arg(short, long)]
    pub fabfile: Option<PathBuf>,

    /// List the available commands and exit.
    #[arg(short, long)]
    pub list: bool,

    /// Commands to run, in order.
    #[arg(trailing_var_arg = true)]
    pub commands: Vec<String>,
}
