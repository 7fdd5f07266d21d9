// src/core/failure.rs

//! # Failure Policy Engine
//!
//! Every failed outcome, on every host, under every strategy, goes through
//! [`handle_outcome`]. The policy is resolved per invocation from the explicit
//! `fail=` argument, then `fab_fail` in the host's environment, then `abort`.
//!
//! An abort never exits the process from here; it is returned as
//! [`Verdict::Abort`] so the strategy driver can stop the run in one place.

use crate::{
    constants::keys,
    core::{
        environment::Scope,
        interpolator::Lookup,
        output::{Reporter, indent},
    },
    models::{FailurePolicy, Outcome},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureError {
    #[error("Invalid value for 'fab_fail': {0}")]
    InvalidPolicy(String),
}

/// What the caller must do after an outcome has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Keep going.
    Continue,
    /// Stop the whole run. Carries the message that was already reported.
    Abort(String),
}

impl Verdict {
    /// True for [`Verdict::Abort`].
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }
}

/// Resolves the policy for one invocation.
pub fn resolve_policy<L: Lookup + ?Sized>(
    per_call: Option<FailurePolicy>,
    env: &L,
) -> Result<FailurePolicy, FailureError> {
    if let Some(policy) = per_call {
        return Ok(policy);
    }
    match env.lookup(keys::FAIL) {
        Some(value) if value.is_truthy() => value
            .to_string()
            .parse()
            .map_err(FailureError::InvalidPolicy),
        _ => Ok(FailurePolicy::Abort),
    }
}

/// Applies `policy` to an already formatted failure message.
pub fn apply(policy: FailurePolicy, message: &str, reporter: &dyn Reporter) -> Verdict {
    match policy {
        FailurePolicy::Ignore => {
            log::debug!("Ignoring failure: {}", message);
            Verdict::Continue
        }
        FailurePolicy::Warn => {
            reporter.warn(message);
            Verdict::Continue
        }
        FailurePolicy::Abort => {
            reporter.error(message);
            Verdict::Abort(message.to_string())
        }
    }
}

/// Builds the standard "operation failed on host" message for `scope`.
pub fn failure_message(scope: &Scope, detail: Option<&str>) -> String {
    let template = "The $(fab_current_operation) operation failed on $(fab_host)";
    let headline = scope
        .lazy_format(template)
        .unwrap_or_else(|_| template.to_string());
    match detail {
        Some(detail) if !detail.trim().is_empty() => {
            format!("{}:\n{}", headline, indent(detail, 4))
        }
        _ => format!("{}.", headline),
    }
}

/// Routes one outcome through the policy. Successes and skips always continue.
pub fn handle_outcome(
    outcome: &Outcome,
    per_call: Option<FailurePolicy>,
    scope: &Scope,
    reporter: &dyn Reporter,
) -> Result<Verdict, FailureError> {
    if !outcome.is_failure() {
        return Ok(Verdict::Continue);
    }
    let policy = resolve_policy(per_call, scope)?;
    let message = failure_message(scope, outcome.message.as_deref());
    Ok(apply(policy, &message, reporter))
}
