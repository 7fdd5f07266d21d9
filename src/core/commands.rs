// src/core/commands.rs

//! # Commands
//!
//! A command is what the user names on the command line (`fab deploy`). The
//! registry holds three kinds:
//!
//! - the built-in `set` command,
//! - every registered operation, invocable ad hoc (`fab run:uptime`),
//! - the user commands declared in the fabfile.

use crate::{
    core::{
        fabfile::{CommandSpec, Fabfile, StepSpec},
        interpolator,
        operation::{OperationArgs, OperationRegistry},
        orchestrator::{Orchestrator, RunError},
    },
    models::Value,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One command named on the command line, with its `key[=value]` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Command name.
    pub name: String,
    /// Arguments in the order given; `None` for bare keys.
    pub args: Vec<(String, Option<String>)>,
}

/// Something the user can run by name.
pub trait Command: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;
    /// Help text, if any.
    fn doc(&self) -> Option<&str> {
        None
    }
    /// Runs the command.
    fn execute(
        &self,
        orchestrator: &mut Orchestrator,
        args: &[(String, Option<String>)],
    ) -> Result<(), RunError>;
}

/// Commands by name.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn Command>>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.commands.keys()).finish()
    }
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `set` plus one ad-hoc command per operation.
    pub fn standard(operations: &OperationRegistry) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SetCommand));
        for operation in operations.iter() {
            registry.register(Arc::new(OperationCommand {
                name: operation.name(),
                doc: operation.description(),
            }));
        }
        registry
    }

    /// Adds (or replaces) a command.
    pub fn register(&mut self, command: Arc<dyn Command>) {
        self.commands.insert(command.name().to_string(), command);
    }

    /// Registers every command declared in `fabfile`.
    pub fn register_fabfile(&mut self, fabfile: &Fabfile) {
        for (name, spec) in &fabfile.commands {
            if self.commands.contains_key(name) {
                log::debug!("Fabfile command '{}' replaces a built-in command", name);
            }
            self.register(Arc::new(FabfileCommand {
                name: name.clone(),
                spec: spec.clone(),
            }));
        }
    }

    /// Looks a command up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    /// All command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }
}

/// `fab set:fab_user=billy,other=value` sets global variables.
#[derive(Debug)]
pub struct SetCommand;

impl Command for SetCommand {
    fn name(&self) -> &str {
        "set"
    }

    fn doc(&self) -> Option<&str> {
        Some("Set a variable.")
    }

    fn execute(
        &self,
        orchestrator: &mut Orchestrator,
        args: &[(String, Option<String>)],
    ) -> Result<(), RunError> {
        for (key, value) in args {
            let value = orchestrator.resolve_argument(value.as_deref().unwrap_or(key))?;
            orchestrator.set(key, value)?;
        }
        Ok(())
    }
}

/// An operation invoked directly from the command line.
#[derive(Debug)]
pub struct OperationCommand {
    name: &'static str,
    doc: &'static str,
}

impl Command for OperationCommand {
    fn name(&self) -> &str {
        self.name
    }

    fn doc(&self) -> Option<&str> {
        Some(self.doc)
    }

    fn execute(
        &self,
        orchestrator: &mut Orchestrator,
        args: &[(String, Option<String>)],
    ) -> Result<(), RunError> {
        let resolved = args
            .iter()
            .map(|(key, value)| {
                Ok((
                    key.clone(),
                    value
                        .as_deref()
                        .map(|v| orchestrator.resolve_argument(v))
                        .transpose()?,
                ))
            })
            .collect::<Result<Vec<_>, RunError>>()?;
        let operation_args = OperationArgs::from_pairs(&resolved)?;
        orchestrator.run_operation(self.name, &operation_args)
    }
}

/// A user command declared in the fabfile.
#[derive(Debug)]
pub struct FabfileCommand {
    name: String,
    spec: CommandSpec,
}

impl FabfileCommand {
    fn run_step(orchestrator: &mut Orchestrator, step: &StepSpec) -> Result<(), RunError> {
        match step {
            StepSpec::Operation {
                op,
                args,
                fail,
                confirm,
            } => {
                // Eager `%(name)s` now; `$(name)` stays for each host's scope.
                let eager = |raw: &str| interpolator::eager_substitute(raw, orchestrator.env(), false);
                let positional = args
                    .iter()
                    .map(|arg| eager(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let confirm = confirm.as_deref().map(eager).transpose()?;
                let args = OperationArgs::new(positional)
                    .with_fail(*fail)
                    .with_confirm(confirm);
                orchestrator.run_operation(op, &args)
            }
            StepSpec::Set { set } => {
                for (key, value) in set {
                    orchestrator.set(key, Value::from_toml(value))?;
                }
                Ok(())
            }
            StepSpec::Prompt {
                prompt,
                message,
                default,
                validate,
            } => orchestrator.prompt(prompt, message, default.as_deref(), validate.as_deref()),
            StepSpec::Require {
                require,
                used_for,
                provided_by,
            } => orchestrator.require(require, used_for.as_deref(), provided_by),
            StepSpec::Call { call } => orchestrator.call_once(call),
        }
    }
}

impl Command for FabfileCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn doc(&self) -> Option<&str> {
        self.spec.doc.as_deref()
    }

    fn execute(
        &self,
        orchestrator: &mut Orchestrator,
        args: &[(String, Option<String>)],
    ) -> Result<(), RunError> {
        for (key, value) in args {
            let value = orchestrator.resolve_argument(value.as_deref().unwrap_or(key))?;
            orchestrator.set(key, value)?;
        }
        if !self.spec.requires.is_empty() {
            orchestrator.require(
                &self.spec.requires,
                self.spec.used_for.as_deref(),
                &self.spec.provided_by,
            )?;
        }
        for dependency in &self.spec.depends {
            orchestrator.call_once(dependency)?;
        }
        for step in &self.spec.steps {
            Self::run_step(orchestrator, step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::keys,
        core::environment::Environment,
        testing::{FakeTransport, RecordingReporter, ScriptedPrompter},
    };
    use std::sync::atomic::AtomicBool;

    const FABFILE: &str = r#"
[settings]
app = "shop"

[commands.build]
steps = [{ set = { built = "%(app)s-build" } }]

[commands.deploy]
doc = "Ship it"
requires = ["target"]
provided_by = ["staging"]
depends = ["build"]
steps = [
  { op = "run", args = ["deploy $(built) to $(target)"] },
  { call = "build" },
]

[commands.staging]
steps = [{ set = { target = "staging" } }]

[commands.hello]
steps = [{ op = "run", args = ["echo %(app)s on $(fab_host) as $(fab_user)"] }]
"#;

    fn orchestrator(
        transport: &Arc<FakeTransport>,
        reporter: &Arc<RecordingReporter>,
    ) -> Orchestrator {
        let mut env = Environment::with_defaults();
        env.insert_raw(keys::USER, "alice");
        env.insert_raw(keys::HOSTS, "web1");
        let mut orchestrator = Orchestrator::new(
            env,
            transport.clone(),
            Arc::new(ScriptedPrompter::default()),
            reporter.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        orchestrator
            .load_fabfile(&Fabfile::parse(FABFILE, "inline").unwrap())
            .unwrap();
        orchestrator
    }

    fn invocation(name: &str, args: &[(&str, Option<&str>)]) -> CommandInvocation {
        CommandInvocation {
            name: name.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                .collect(),
        }
    }

    #[test]
    fn test_standard_registry_has_set_and_operations() {
        let registry = CommandRegistry::standard(&OperationRegistry::with_builtins());
        let names = registry.names();
        assert!(names.contains(&"set"));
        assert!(names.contains(&"run"));
        assert!(names.contains(&"upload_project"));
        assert_eq!(registry.get("run").unwrap().doc(), Some("Run a shell command on the current hosts."));
    }

    #[test]
    fn test_set_command_bare_key_uses_key_as_value() {
        let transport = Arc::new(FakeTransport::default());
        let reporter = Arc::new(RecordingReporter::default());
        let mut orchestrator = orchestrator(&transport, &reporter);
        orchestrator
            .execute(&[invocation(
                "set",
                &[("fab_user", Some("billy")), ("verbose", None), ("where", Some("/srv/%(app)s"))],
            )])
            .unwrap();
        let env = orchestrator.env();
        assert_eq!(env.get(keys::USER), Some(&Value::from("billy")));
        assert_eq!(env.get("verbose"), Some(&Value::from("verbose")));
        assert_eq!(env.get("where"), Some(&Value::from("/srv/shop")));
    }

    #[test]
    fn test_fabfile_command_reports_missing_requirement() {
        let transport = Arc::new(FakeTransport::default());
        let reporter = Arc::new(RecordingReporter::default());
        let mut orchestrator = orchestrator(&transport, &reporter);
        let err = orchestrator
            .execute(&[invocation("deploy", &[])])
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("The 'deploy' command requires a 'target' variable."));
        assert!(err.contains("\tstaging"));
        assert_eq!(transport.total_handshakes(), 0);
    }

    #[test]
    fn test_fabfile_command_runs_dependencies_once_then_steps() {
        let transport = Arc::new(FakeTransport::default());
        let reporter = Arc::new(RecordingReporter::default());
        let mut orchestrator = orchestrator(&transport, &reporter);
        orchestrator
            .execute(&[
                invocation("staging", &[]),
                invocation("deploy", &[]),
            ])
            .unwrap();

        assert_eq!(
            transport.commands_on("web1"),
            vec![r#"/bin/bash -l -c "deploy shop-build to staging""#.to_string()]
        );
        let infos = reporter.infos();
        assert!(infos.contains(&"Invoking build...".to_string()));
        assert!(infos.contains(&"Already invoked build, skipping.".to_string()));
        assert_eq!(orchestrator.env().get(keys::CUR_COMMAND), Some(&Value::from("deploy")));
    }

    #[test]
    fn test_fabfile_command_arguments_become_variables() {
        let transport = Arc::new(FakeTransport::default());
        let reporter = Arc::new(RecordingReporter::default());
        let mut orchestrator = orchestrator(&transport, &reporter);
        orchestrator
            .execute(&[invocation("deploy", &[("target", Some("prod-%(app)s"))])])
            .unwrap();
        assert_eq!(
            transport.commands_on("web1"),
            vec![r#"/bin/bash -l -c "deploy shop-build to prod-shop""#.to_string()]
        );
    }

    #[test]
    fn test_fabfile_step_arguments_get_eager_then_host_substitution() {
        let transport = Arc::new(FakeTransport::default());
        let reporter = Arc::new(RecordingReporter::default());
        let mut orchestrator = orchestrator(&transport, &reporter);
        orchestrator
            .execute(&[invocation("hello", &[])])
            .unwrap();
        assert_eq!(
            transport.commands_on("web1"),
            vec![r#"/bin/bash -l -c "echo shop on web1 as alice""#.to_string()]
        );
    }

    #[test]
    fn test_operation_command_passes_fail_policy() {
        let transport = Arc::new(FakeTransport::default().with_exit_status_on("web1", 3));
        let reporter = Arc::new(RecordingReporter::default());
        let mut orchestrator = orchestrator(&transport, &reporter);
        orchestrator
            .execute(&[invocation("run", &[("false", None), ("fail", Some("ignore"))])])
            .unwrap();
        assert!(reporter.errors().is_empty());
        assert!(reporter.warnings().is_empty());
    }
}
