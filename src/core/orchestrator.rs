// src/core/orchestrator.rs

//! # Orchestrator
//!
//! Ties the pieces together for one run: the global [`Environment`], the
//! [`ConnectionManager`], the operation, strategy and command registries, and
//! the user-facing prompter and reporter.
//!
//! A call to [`Orchestrator::run_operation`] resolves the strategy from
//! `fab_mode`, makes sure every host is connected, builds one [`HostTask`] per
//! host (with that host's merged scope) and lets the strategy drive the
//! invocations. [`Orchestrator::execute`] runs a list of commands and always
//! disconnects at the end, whatever the outcome.

use crate::{
    CancellationToken,
    constants::keys,
    core::{
        commands::{CommandInvocation, CommandRegistry},
        connection::{ConnectionError, ConnectionManager},
        environment::{EnvError, Environment, Scope},
        fabfile::{Fabfile, FabfileError},
        failure::{self, FailureError, Verdict},
        host_spec::{self, HostSpecError},
        interpolator::{self, InterpolationError},
        operation::{
            self, InvocationContext, Operation, OperationArgs, OperationError, OperationKind,
            OperationRegistry,
        },
        output::Reporter,
        strategy::{HostTask, RollingStrategy, Strategy, StrategyError, StrategyRegistry},
    },
    models::{Layer, Value},
    system::{
        prompt::{PromptError, Prompter},
        transport::{SessionTransport, TransportError},
    },
};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
    #[error(transparent)]
    HostSpec(#[from] HostSpecError),
    #[error(transparent)]
    Connection(ConnectionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Strategy(StrategyError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Failure(#[from] FailureError),
    #[error(transparent)]
    Fabfile(#[from] FabfileError),
    #[error("Could not read input: {0}")]
    Prompt(#[source] std::io::Error),
    #[error("Invalid validation pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("No such command: {0}")]
    UnknownCommand(String),
    #[error("No such operation: {0}")]
    UnknownOperation(String),
    #[error("No commands given.")]
    NoCommands,
    /// Stopped by the failure policy; the message was already printed.
    #[error("{0}")]
    Aborted(String),
    /// Ctrl+C, or end-of-input at a prompt that cannot be skipped.
    #[error("Interrupted.")]
    Interrupted,
}

impl RunError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => crate::constants::EXIT_INTERRUPTED,
            _ => 1,
        }
    }

    /// True when the message has already been shown to the user.
    pub fn is_reported(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::Interrupted)
    }
}

impl From<ConnectionError> for RunError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Interrupted => Self::Interrupted,
            other => Self::Connection(other),
        }
    }
}

impl From<StrategyError> for RunError {
    fn from(e: StrategyError) -> Self {
        match e {
            StrategyError::Aborted(message) => Self::Aborted(message),
            StrategyError::Cancelled => Self::Interrupted,
            StrategyError::Policy(e) => Self::Failure(e),
            other => Self::Strategy(other),
        }
    }
}

/// Drives operations and commands for one run.
pub struct Orchestrator {
    env: Environment,
    connections: Arc<ConnectionManager>,
    operations: OperationRegistry,
    strategies: StrategyRegistry,
    commands: Arc<CommandRegistry>,
    prompter: Arc<dyn Prompter>,
    reporter: Arc<dyn Reporter>,
    token: CancellationToken,
    called: BTreeSet<String>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("env", &self.env)
            .field("operations", &self.operations)
            .field("strategies", &self.strategies)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with the built-in operations, strategies and commands.
    pub fn new(
        env: Environment,
        transport: Arc<dyn SessionTransport>,
        prompter: Arc<dyn Prompter>,
        reporter: Arc<dyn Reporter>,
        token: CancellationToken,
    ) -> Self {
        let operations = OperationRegistry::with_builtins();
        let commands = CommandRegistry::standard(&operations);
        Self {
            env,
            connections: Arc::new(ConnectionManager::new(
                transport,
                prompter.clone(),
                reporter.clone(),
            )),
            operations,
            strategies: StrategyRegistry::new(),
            commands: Arc::new(commands),
            prompter,
            reporter,
            token,
            called: BTreeSet::new(),
        }
    }

    /// The global environment.
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The connection manager, shared with the interrupt handler.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// The command registry.
    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// The operation registry.
    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    /// Output sink.
    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Applies a fabfile's settings and registers its commands.
    pub fn load_fabfile(&mut self, fabfile: &Fabfile) -> Result<(), RunError> {
        fabfile.apply_settings(&mut self.env)?;
        Arc::make_mut(&mut self.commands).register_fabfile(fabfile);
        Ok(())
    }

    /// Sets a global variable with eager substitution.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<(), RunError> {
        Ok(self.env.set(key, value)?)
    }

    /// Fails with a configuration error unless every name is set.
    pub fn require(
        &self,
        names: &[String],
        used_for: Option<&str>,
        provided_by: &[String],
    ) -> Result<(), RunError> {
        Ok(self.env.require(names, used_for, provided_by)?)
    }

    /// Substitutes a command-line argument value: eager `%(name)s` first, then lazy `$(name)`.
    pub fn resolve_argument(&self, raw: &str) -> Result<String, RunError> {
        let eager = interpolator::eager_substitute(raw, &self.env, false)?;
        Ok(self.env.lazy_format(&eager)?)
    }

    /// Asks for `var` unless it already holds a valid value, and stores the answer.
    ///
    /// An empty answer takes `default`. When `validate` is given, the value
    /// must match it from the start; invalid values are reported and asked
    /// again. End-of-input leaves the variable unset.
    pub fn prompt(
        &mut self,
        var: &str,
        message: &str,
        default: Option<&str>,
        validate: Option<&str>,
    ) -> Result<(), RunError> {
        let validator = validate
            .map(|pattern| {
                Regex::new(&format!("^(?:{})", pattern)).map_err(|source| RunError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()?;
        let default = default.map(str::trim).filter(|d| !d.is_empty());
        let question = self.env.lazy_format(&match default {
            Some(default) => format!("{} [{}]: ", message.trim(), default),
            None => format!("{}: ", message.trim()),
        })?;

        let mut value = self
            .env
            .get(var)
            .filter(|v| v.is_truthy())
            .map(Value::to_string);
        loop {
            let candidate = match value.take() {
                Some(existing) => existing,
                None => match self.prompter.input(&question) {
                    Ok(answer) if answer.is_empty() => default.unwrap_or_default().to_string(),
                    Ok(answer) => answer,
                    Err(PromptError::EndOfInput) => return Ok(()),
                    Err(PromptError::Io(e)) => return Err(RunError::Prompt(e)),
                },
            };
            if let Some(validator) = &validator {
                if !validator.is_match(&candidate) {
                    self.reporter.info(&format!(
                        "Malformed value '{}'. Must match r'{}'.",
                        candidate,
                        validate.unwrap_or_default()
                    ));
                    continue;
                }
            }
            if !candidate.is_empty() {
                return self.set(var, candidate);
            }
        }
    }

    /// Runs the operation `name` against the current hosts.
    pub fn run_operation(&mut self, name: &str, args: &OperationArgs) -> Result<(), RunError> {
        let operation = self
            .operations
            .get(name)
            .ok_or_else(|| RunError::UnknownOperation(name.to_string()))?;
        log::debug!("Operation {} ({:?})", name, operation.kind());

        match operation.kind() {
            OperationKind::Composite => {
                for (step, step_args) in operation.expand(args, &self.env)? {
                    self.run_operation(step, &step_args)?;
                }
                Ok(())
            }
            OperationKind::Local => {
                let task = HostTask {
                    host: "localhost".to_string(),
                    scope: self
                        .env
                        .view()
                        .with(keys::HOST, "localhost")
                        .with(keys::CURRENT_OPERATION, name),
                    session: None,
                };
                self.dispatch(&RollingStrategy, &[task], &operation, args)
            }
            OperationKind::LocalPerHost => {
                let tasks = self.local_host_tasks(name)?;
                self.dispatch(&RollingStrategy, &tasks, &operation, args)
            }
            OperationKind::Remote => {
                let mode = self.env.get_or(keys::MODE, "rolling");
                let strategy = self.strategies.resolve(&mode)?;
                let connections = self.connections.ensure_connections(&self.env)?;
                self.env.insert_raw(keys::CONNECTED, true);

                let tasks = connections
                    .iter()
                    .map(|connection| {
                        Ok(HostTask {
                            host: connection.hostname().to_string(),
                            scope: connection
                                .scope(&self.env)
                                .with(keys::CURRENT_OPERATION, name),
                            session: Some(connection.session()?),
                        })
                    })
                    .collect::<Result<Vec<_>, RunError>>()?;
                log::debug!("Running {} on {} host(s) with {}", name, tasks.len(), mode);
                self.dispatch(strategy.as_ref(), &tasks, &operation, args)
            }
        }
    }

    fn dispatch(
        &self,
        strategy: &dyn Strategy,
        tasks: &[HostTask],
        operation: &Arc<dyn Operation>,
        args: &OperationArgs,
    ) -> Result<(), RunError> {
        let work = |task: &HostTask| -> Result<Verdict, StrategyError> {
            let ctx = InvocationContext {
                host: &task.host,
                session: task.session.as_deref(),
                scope: &task.scope,
                args,
                reporter: &self.reporter,
                prompter: self.prompter.as_ref(),
                token: &self.token,
            };
            let outcome = operation::invoke(operation.as_ref(), &ctx);
            if outcome.is_failure() && self.token.load(Ordering::SeqCst) {
                // Killed because the run is stopping; not this host's fault.
                return Err(StrategyError::Cancelled);
            }
            Ok(failure::handle_outcome(
                &outcome,
                args.fail,
                &task.scope,
                self.reporter.as_ref(),
            )?)
        };
        Ok(strategy.run(tasks, &work, &self.token)?)
    }

    /// Host views for local per-host operations. Live connections are used
    /// when they exist; otherwise views are built from the host list without
    /// connecting.
    fn local_host_tasks(&self, operation: &str) -> Result<Vec<HostTask>, RunError> {
        let scopes: Vec<Scope> = if self.connections.is_connected() {
            self.connections
                .connections()
                .iter()
                .map(|connection| connection.scope(&self.env))
                .collect()
        } else {
            host_spec::parse_host_list(&self.env)?
                .into_iter()
                .map(|spec| {
                    let identity: Layer =
                        [(keys::USER.to_string(), Value::from(spec.identity.as_str()))].into();
                    let host: Layer = [
                        (keys::HOST.to_string(), Value::from(spec.hostname.as_str())),
                        (keys::PORT.to_string(), Value::from(spec.port)),
                    ]
                    .into();
                    self.env.merge(&identity, &host)
                })
                .collect()
        };
        Ok(scopes
            .into_iter()
            .map(|scope| HostTask {
                host: scope.host(),
                scope: scope.with(keys::CURRENT_OPERATION, operation),
                session: None,
            })
            .collect())
    }

    /// Runs the command `name` with its raw command-line arguments.
    pub fn call_command(
        &mut self,
        name: &str,
        args: &[(String, Option<String>)],
    ) -> Result<(), RunError> {
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| RunError::UnknownCommand(name.to_string()))?;
        command.execute(self, args)
    }

    /// Runs `name` unless it already ran during this run.
    pub fn call_once(&mut self, name: &str) -> Result<(), RunError> {
        if self.called.contains(name) {
            self.reporter
                .info(&format!("Already invoked {}, skipping.", name));
            return Ok(());
        }
        self.reporter.info(&format!("Invoking {}...", name));
        self.called.insert(name.to_string());
        self.call_command(name, &[])
    }

    /// Validates and runs `invocations` in order, then disconnects every host.
    pub fn execute(&mut self, invocations: &[CommandInvocation]) -> Result<(), RunError> {
        if invocations.is_empty() {
            return Err(RunError::NoCommands);
        }
        if let Some(unknown) = invocations
            .iter()
            .find(|invocation| self.commands.get(&invocation.name).is_none())
        {
            return Err(RunError::UnknownCommand(unknown.name.clone()));
        }

        let manager = self.connections.clone();
        let _disconnect = scopeguard::guard((), move |_| manager.disconnect_all());

        for invocation in invocations {
            if self.token.load(Ordering::SeqCst) {
                return Err(RunError::Interrupted);
            }
            self.env.insert_raw(keys::CUR_COMMAND, invocation.name.as_str());
            self.reporter
                .info(&format!("Running {}...", invocation.name));
            self.called.insert(invocation.name.clone());
            self.call_command(&invocation.name, &invocation.args)?;
        }
        Ok(())
    }
}
