// src/core/operation.rs

//! # Operation Invocation Protocol
//!
//! An [`Operation`] is handed everything it may touch through an
//! [`InvocationContext`]: the host name, the live session (remote operations
//! only), the merged [`Scope`] for that host, its arguments and the output
//! sinks. It answers with an [`Outcome`]; any error it returns (or panic it
//! raises) is turned into a failed outcome by [`invoke`], so nothing escapes
//! the per-host boundary except through the failure policy.

use crate::{
    CancellationToken,
    core::{
        environment::{Environment, Scope},
        interpolator::InterpolationError,
        output::Reporter,
    },
    models::{FailurePolicy, Outcome},
    system::{
        executor::ExecutionError,
        prompt::{PromptError, Prompter},
        transport::{Session, TransportError},
    },
};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("The {operation} operation needs a '{name}' argument.")]
    MissingArgument { operation: String, name: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("No session is available for {0}.")]
    NoSession(String),
    #[error("'fab_shell' must contain a '%s' placeholder, got '{0}'.")]
    InvalidShell(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How the orchestrator schedules an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Once per connected host, through the selected strategy.
    Remote,
    /// Once, on this machine, without connecting.
    Local,
    /// Once per target host, on this machine, without connecting.
    LocalPerHost,
    /// A fixed sequence of other operations, see [`Operation::expand`].
    Composite,
}

/// Arguments of one operation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationArgs {
    /// Positional arguments, in order.
    pub positional: Vec<String>,
    /// Named arguments other than `fail` and `confirm`.
    pub named: BTreeMap<String, String>,
    /// Per-call failure policy override.
    pub fail: Option<FailurePolicy>,
    /// Question to confirm before running on each host.
    pub confirm: Option<String>,
}

impl OperationArgs {
    /// Arguments with the given positional values.
    pub fn new<I, S>(positional: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            positional: positional.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the per-call failure policy.
    pub fn with_fail(mut self, fail: Option<FailurePolicy>) -> Self {
        self.fail = fail;
        self
    }

    /// Sets the confirmation question.
    pub fn with_confirm(mut self, confirm: Option<String>) -> Self {
        self.confirm = confirm;
        self
    }

    /// Builds arguments from `key[=value]` pairs. Keys without a value are
    /// positional; `fail` and `confirm` are recognized by name.
    pub fn from_pairs(pairs: &[(String, Option<String>)]) -> Result<Self, OperationError> {
        let mut args = Self::default();
        for (key, value) in pairs {
            match (key.as_str(), value) {
                (_, None) => args.positional.push(key.clone()),
                ("fail", Some(policy)) => {
                    args.fail = Some(policy.parse().map_err(OperationError::InvalidArgument)?);
                }
                ("confirm", Some(question)) => args.confirm = Some(question.clone()),
                (_, Some(value)) => {
                    args.named.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(args)
    }

    /// The argument at `index`, or the named argument `name`.
    pub fn arg(&self, operation: &str, index: usize, name: &str) -> Result<&str, OperationError> {
        self.positional
            .get(index)
            .or_else(|| self.named.get(name))
            .map(String::as_str)
            .ok_or_else(|| OperationError::MissingArgument {
                operation: operation.to_string(),
                name: name.to_string(),
            })
    }
}

/// Everything an operation may use while running for one host.
pub struct InvocationContext<'a> {
    /// Host identifier used in output prefixes (`localhost` for local operations).
    pub host: &'a str,
    /// The live session, for remote operations.
    pub session: Option<&'a dyn Session>,
    /// Merged variables for this host.
    pub scope: &'a Scope,
    /// Call arguments.
    pub args: &'a OperationArgs,
    /// Output sink.
    pub reporter: &'a Arc<dyn Reporter>,
    /// Interactive questions (confirmations).
    pub prompter: &'a dyn Prompter,
    /// Set when the run is being stopped.
    pub token: &'a CancellationToken,
}

impl fmt::Debug for InvocationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("host", &self.host)
            .field("session", &self.session.is_some())
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl InvocationContext<'_> {
    /// The session, or an error for operations scheduled without one.
    pub fn session(&self) -> Result<&dyn Session, OperationError> {
        self.session
            .ok_or_else(|| OperationError::NoSession(self.host.to_string()))
    }
}

/// A unit of orchestrated work.
pub trait Operation: Send + Sync {
    /// Registry name, also the ad-hoc command name.
    fn name(&self) -> &'static str;
    /// One-line description.
    fn description(&self) -> &'static str;
    /// How the orchestrator schedules it.
    fn kind(&self) -> OperationKind;
    /// Runs the operation for one host.
    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError>;
    /// The steps of a [`OperationKind::Composite`] operation.
    fn expand(
        &self,
        _args: &OperationArgs,
        _env: &Environment,
    ) -> Result<Vec<(&'static str, OperationArgs)>, OperationError> {
        Ok(Vec::new())
    }
}

/// Runs `operation`, converting any error or panic into a failed outcome.
pub fn invoke(operation: &dyn Operation, ctx: &InvocationContext<'_>) -> Outcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| operation.invoke(ctx)));
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            log::debug!("[{}] {} raised: {:?}", ctx.host, operation.name(), e);
            Outcome::failed_with(e.to_string())
        }
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "operation panicked".to_string());
            Outcome::failed_with(detail)
        }
    }
}

/// Named operations known to the orchestrator.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    operations: BTreeMap<&'static str, Arc<dyn Operation>>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.operations.keys()).finish()
    }
}

impl OperationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in operation.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for operation in super::operations::builtins() {
            registry.register(operation);
        }
        registry
    }

    /// Adds (or replaces) an operation.
    pub fn register(&mut self, operation: Arc<dyn Operation>) {
        self.operations.insert(operation.name(), operation);
    }

    /// Looks an operation up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    /// All operations, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Operation>> {
        self.operations.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutcomeStatus;
    use crate::testing::{RecordingReporter, ScriptedPrompter};
    use std::sync::atomic::AtomicBool;

    struct Exploding;

    impl Operation for Exploding {
        fn name(&self) -> &'static str {
            "explode"
        }
        fn description(&self) -> &'static str {
            "Always errors."
        }
        fn kind(&self) -> OperationKind {
            OperationKind::Local
        }
        fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
            ctx.args.arg("explode", 0, "what")?;
            panic!("boom");
        }
    }

    fn with_context<R>(args: &OperationArgs, f: impl FnOnce(&InvocationContext<'_>) -> R) -> R {
        let scope = Scope::default();
        let reporter: Arc<dyn Reporter> = Arc::new(RecordingReporter::default());
        let prompter = ScriptedPrompter::default();
        let token = Arc::new(AtomicBool::new(false));
        let ctx = InvocationContext {
            host: "web1",
            session: None,
            scope: &scope,
            args,
            reporter: &reporter,
            prompter: &prompter,
            token: &token,
        };
        f(&ctx)
    }

    #[test]
    fn test_errors_become_failed_outcomes() {
        let outcome = with_context(&OperationArgs::default(), |ctx| invoke(&Exploding, ctx));
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(
            outcome.message.as_deref(),
            Some("The explode operation needs a 'what' argument.")
        );
    }

    #[test]
    fn test_panics_become_failed_outcomes() {
        let outcome = with_context(&OperationArgs::new(["it"]), |ctx| invoke(&Exploding, ctx));
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_args_from_pairs() {
        let pairs = vec![
            ("uptime".to_string(), None),
            ("fail".to_string(), Some("warn".to_string())),
            ("confirm".to_string(), Some("Sure?".to_string())),
            ("user".to_string(), Some("bob".to_string())),
        ];
        let args = OperationArgs::from_pairs(&pairs).unwrap();
        assert_eq!(args.positional, vec!["uptime".to_string()]);
        assert_eq!(args.fail, Some(FailurePolicy::Warn));
        assert_eq!(args.confirm.as_deref(), Some("Sure?"));
        assert_eq!(args.arg("x", 1, "user").unwrap(), "bob");

        let bad = vec![("fail".to_string(), Some("never".to_string()))];
        assert!(OperationArgs::from_pairs(&bad).is_err());
    }

    #[test]
    fn test_registry_holds_builtins() {
        let registry = OperationRegistry::with_builtins();
        for name in ["run", "sudo", "put", "download", "local", "local_per_host", "upload_project"] {
            assert!(registry.get(name).is_some(), "missing {}", name);
        }
        assert!(registry.get("explode").is_none());
    }
}
