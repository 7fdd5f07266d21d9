// src/cli/dispatcher.rs

use anyhow::{Context, Result};
use colored::Colorize;
use std::env;
use std::sync::Arc;

use crate::{
    CancellationToken,
    cli::{Cli, args::parse_commands},
    constants::keys,
    core::{
        commands::CommandRegistry,
        environment::Environment,
        fabfile::{Fabfile, find_fabfile},
        operation::OperationRegistry,
        orchestrator::Orchestrator,
        output::{ConsoleReporter, Reporter},
        settings::load_user_settings,
    },
    models::Value,
    system::{prompt::TerminalPrompter, signals::install_interrupt_handler, ssh::OpenSshTransport},
};

/// Builds the environment from defaults, user settings, the fabfile and the
/// flags, then runs the requested commands.
pub fn run_cli(cli: Cli, cancellation_token: CancellationToken) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);
    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter);

    let mut env = Environment::with_defaults();
    if let Some(path) = load_user_settings(&mut env)? {
        log::debug!("User settings loaded from {}", path.display());
    }

    let cwd = env::current_dir().context("Could not determine the current directory")?;
    let fabfile = match find_fabfile(cli.fabfile.as_deref(), &cwd) {
        Some(path) => Fabfile::load(&path)?,
        None => {
            reporter.warn("No fabfile found, only built-in commands are available.");
            Fabfile::default()
        }
    };

    if cli.list {
        print_command_list(&fabfile);
        return Ok(());
    }

    let invocations = parse_commands(&cli.commands);
    let transport = Arc::new(OpenSshTransport::new()?);
    let mut orchestrator = Orchestrator::new(
        env,
        transport,
        Arc::new(TerminalPrompter::new()),
        reporter.clone(),
        cancellation_token.clone(),
    );
    orchestrator.load_fabfile(&fabfile)?;

    // Flags win over the fabfile and the settings file.
    if !cli.hosts.is_empty() {
        orchestrator.set(keys::HOSTS, Value::List(cli.hosts.clone()))?;
    }
    if let Some(mode) = &cli.mode {
        orchestrator.set(keys::MODE, mode.as_str())?;
    }

    let connections = orchestrator.connections().clone();
    install_interrupt_handler(cancellation_token, move || connections.disconnect_all())
        .context("Could not install the Ctrl+C handler")?;

    orchestrator.execute(&invocations)?;
    reporter.info("Done.");
    Ok(())
}

fn print_command_list(fabfile: &Fabfile) {
    let mut registry = CommandRegistry::standard(&OperationRegistry::with_builtins());
    registry.register_fabfile(fabfile);
    println!("{}", "Available commands:".yellow().bold());
    for name in registry.names() {
        let doc = registry
            .get(name)
            .and_then(|command| command.doc().map(str::to_string))
            .unwrap_or_default();
        let first_line = doc.lines().next().unwrap_or_default();
        println!("    {:<20} {}", name.cyan(), first_line.dimmed());
    }
}
