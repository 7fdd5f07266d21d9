// src/core/interpolator.rs

//! Variable substitution.
//!
//! Two syntaxes are supported:
//!
//! - **Eager** `%(name)s` references are expanded once, when a value is written
//!   through [`Environment::set`](crate::core::environment::Environment::set).
//!   `%%` is a literal percent sign.
//! - **Lazy** `$(name)` references survive until a string is consumed by an
//!   operation. They are then resolved recursively against the environment of
//!   the host being worked on. Names that are not defined stay verbatim.

use crate::{constants::MAX_LAZY_DEPTH, models::{Layer, Value}};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use thiserror::Error;

lazy_static! {
    static ref LAZY_TOKEN: Regex = Regex::new(r"\$\((\w+?)\)").expect("lazy token pattern is valid");
    static ref EAGER_TOKEN: Regex =
        Regex::new(r"%(?:(%)|\((\w+)\)[sdirf])").expect("eager token pattern is valid");
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("Unknown variable '{name}' referenced in '{template}'.")]
    UnknownVariable { name: String, template: String },
    #[error("Cyclical variable reference detected: {0}")]
    Cycle(String),
    #[error("Maximum substitution depth ({0}) exceeded. Check for indirect cycles.")]
    DepthExceeded(u32),
}

/// Read access to a set of variables. Implemented by every environment view.
pub trait Lookup {
    /// Returns the value bound to `key`, if any.
    fn lookup(&self, key: &str) -> Option<&Value>;
}

impl Lookup for Layer {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.get(key)
    }
}

/// Expands `%(name)s` references against `env`.
///
/// With `strict` set, a reference to an undefined variable is an error (this is
/// what `set` uses). Otherwise it is left untouched.
pub fn eager_substitute<L: Lookup + ?Sized>(
    template: &str,
    env: &L,
    strict: bool,
) -> Result<String, InterpolationError> {
    let mut failure = None;
    let expanded = EAGER_TOKEN.replace_all(template, |caps: &Captures<'_>| {
        if caps.get(1).is_some() {
            return "%".to_string();
        }
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let name = caps.get(2).map_or("", |m| m.as_str());
        match env.lookup(name) {
            Some(value) => value.to_string(),
            None => {
                if strict && failure.is_none() {
                    failure = Some(InterpolationError::UnknownVariable {
                        name: name.to_string(),
                        template: template.to_string(),
                    });
                }
                whole.to_string()
            }
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(expanded.into_owned()),
    }
}

/// Resolves every `$(name)` reference in `template` against `env`.
///
/// Referenced values are eagerly substituted first and then lazily formatted
/// themselves, until no resolvable reference remains. The environment is never
/// modified.
pub fn lazy_format<L: Lookup + ?Sized>(template: &str, env: &L) -> Result<String, InterpolationError> {
    Interpolator::new(env).expand(template)
}

/// Like [`lazy_format`], but an absent template passes through unchanged.
pub fn lazy_format_opt<L: Lookup + ?Sized>(
    template: Option<&str>,
    env: &L,
) -> Result<Option<String>, InterpolationError> {
    template.map(|t| lazy_format(t, env)).transpose()
}

struct Interpolator<'a, L: Lookup + ?Sized> {
    env: &'a L,
    // For direct cycle detection (a -> b -> a)
    recursion_stack: Vec<String>,
    // For runaway recursion protection (a -> b -> c -> ...)
    recursion_depth: u32,
}

impl<'a, L: Lookup + ?Sized> Interpolator<'a, L> {
    fn new(env: &'a L) -> Self {
        Self {
            env,
            recursion_stack: Vec::new(),
            recursion_depth: 0,
        }
    }

    fn expand(&mut self, template: &str) -> Result<String, InterpolationError> {
        if self.recursion_depth >= MAX_LAZY_DEPTH {
            return Err(InterpolationError::DepthExceeded(MAX_LAZY_DEPTH));
        }
        if !template.contains("$(") {
            return Ok(template.to_string());
        }

        let mut failure = None;
        let expanded = LAZY_TOKEN.replace_all(template, |caps: &Captures<'_>| {
            let whole = caps.get(0).map_or("", |m| m.as_str());
            if failure.is_some() {
                return whole.to_string();
            }
            let name = caps.get(1).map_or("", |m| m.as_str());
            match self.resolve(name) {
                Ok(Some(value)) => value,
                Ok(None) => whole.to_string(),
                Err(err) => {
                    failure = Some(err);
                    whole.to_string()
                }
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(expanded.into_owned()),
        }
    }

    /// Returns `None` when the variable is undefined, so the reference stays verbatim.
    fn resolve(&mut self, name: &str) -> Result<Option<String>, InterpolationError> {
        let Some(value) = self.env.lookup(name) else {
            return Ok(None);
        };

        if self.recursion_stack.iter().any(|seen| seen == name) {
            let mut path = self.recursion_stack.clone();
            path.push(name.to_string());
            return Err(InterpolationError::Cycle(path.join(" -> ")));
        }

        let eager = eager_substitute(&value.to_string(), self.env, false)?;

        self.recursion_stack.push(name.to_string());
        self.recursion_depth += 1;
        let result = self.expand(&eager);
        self.recursion_depth -= 1;
        self.recursion_stack.pop();

        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(pairs: &[(&str, &str)]) -> Layer {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_lazy_format_is_identity_without_tokens() {
        let env = layer(&[("a", "x")]);
        for s in ["", "plain text", "100% done", "%(a)s stays", "$ (a) spaced"] {
            assert_eq!(lazy_format(s, &env).unwrap(), s);
        }
    }

    #[test]
    fn test_lazy_format_resolves_single_reference() {
        let env = layer(&[("a", "x")]);
        assert_eq!(lazy_format("$(a)", &env).unwrap(), "x");
    }

    #[test]
    fn test_lazy_format_resolves_recursively() {
        let env = layer(&[("a", "$(b)"), ("b", "y")]);
        assert_eq!(lazy_format("$(a)", &env).unwrap(), "y");
    }

    #[test]
    fn test_lazy_format_leaves_unresolved_names() {
        let env = Layer::new();
        assert_eq!(lazy_format("$(missing)", &env).unwrap(), "$(missing)");
    }

    #[test]
    fn test_lazy_format_applies_eager_references_inside_values() {
        let env = layer(&[("dir", "/srv/%(app)s"), ("app", "shop")]);
        assert_eq!(lazy_format("cd $(dir)", &env).unwrap(), "cd /srv/shop");
    }

    #[test]
    fn test_lazy_format_detects_cycles() {
        let env = layer(&[("a", "$(b)"), ("b", "$(a)")]);
        let err = lazy_format("$(a)", &env).unwrap_err();
        assert_eq!(err, InterpolationError::Cycle("a -> b -> a".to_string()));
    }

    #[test]
    fn test_lazy_format_detects_self_reference() {
        let env = layer(&[("a", "again $(a)")]);
        assert!(matches!(
            lazy_format("$(a)", &env),
            Err(InterpolationError::Cycle(_))
        ));
    }

    #[test]
    fn test_lazy_format_opt_passes_none_through() {
        let env = Layer::new();
        assert_eq!(lazy_format_opt(None, &env).unwrap(), None);
    }

    #[test]
    fn test_eager_substitute_strict_rejects_unknown() {
        let env = layer(&[("user", "alice")]);
        assert_eq!(
            eager_substitute("%(user)s at 100%%", &env, true).unwrap(),
            "alice at 100%"
        );
        assert!(eager_substitute("%(nope)s", &env, true).is_err());
        assert_eq!(eager_substitute("%(nope)s", &env, false).unwrap(), "%(nope)s");
    }

    /// `v0 -> v1 -> ... -> v{len-1} = "end"`, with no cycle.
    fn chain(len: usize) -> Layer {
        (0..len)
            .map(|i| {
                let value = if i + 1 == len {
                    "end".to_string()
                } else {
                    format!("$(v{})", i + 1)
                };
                (format!("v{}", i), Value::from(value))
            })
            .collect()
    }

    #[test]
    fn test_long_chain_hits_depth_bound() {
        assert_eq!(lazy_format("$(v0)", &chain(31)).unwrap(), "end");
        assert_eq!(
            lazy_format("$(v0)", &chain(33)),
            Err(InterpolationError::DepthExceeded(MAX_LAZY_DEPTH))
        );
    }
}
