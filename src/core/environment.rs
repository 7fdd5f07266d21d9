// src/core/environment.rs

//! # Environment Store
//!
//! Variables live in three layers, merged at read time (later wins):
//!
//! 1. **global**: process-wide defaults, user settings, fabfile settings, `set`.
//! 2. **identity**: overrides shared by every host logged into as one identity
//!    (e.g. a password captured once). Owned by the connection manager.
//! 3. **host**: overrides for one `host:port` pair (`fab_host`, `fab_port`, ...).
//!
//! The [`Environment`] value itself is the global layer. A [`Scope`] is the
//! flattened, read-only view handed to an operation for one host.

use crate::{
    constants::{DEFAULT_SHELL, keys},
    core::interpolator::{self, InterpolationError, Lookup},
    models::{Layer, Value},
};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("Could not set '{key}': {source}")]
    Substitution {
        key: String,
        #[source]
        source: InterpolationError,
    },
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
    #[error("{0}")]
    MissingVariables(String),
    #[error("Variable '{key}' must be {expected}, found '{found}'.")]
    InvalidType {
        key: String,
        expected: &'static str,
        found: String,
    },
}

/// The global variable layer, passed explicitly through the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    global: Layer,
}

impl Lookup for Environment {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.global.get(key)
    }
}

impl Environment {
    /// An empty environment, without any defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// An environment seeded with the built-in defaults.
    pub fn with_defaults() -> Self {
        let mut global = Layer::new();
        global.insert(keys::VERSION.into(), env!("CARGO_PKG_VERSION").into());
        global.insert(keys::AUTHOR.into(), env!("CARGO_PKG_AUTHORS").into());
        global.insert(keys::MODE.into(), "rolling".into());
        global.insert(keys::PORT.into(), Value::Int(22));
        global.insert(keys::USER.into(), default_identity().into());
        global.insert(keys::PASSWORD.into(), Value::Null);
        global.insert(keys::KEY_FILENAME.into(), Value::Null);
        global.insert(keys::NEW_HOST_KEY.into(), "accept".into());
        global.insert(keys::SHELL.into(), DEFAULT_SHELL.into());
        global.insert(keys::TIMESTAMP.into(), timestamp().into());
        global.insert(keys::PRINT_REAL_SUDO.into(), Value::Bool(false));
        global.insert(keys::FAIL.into(), "abort".into());
        Self { global }
    }

    /// Returns the value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.global.get(key)
    }

    /// Returns the rendered value of `key`, or `otherwise` when it is unset.
    pub fn get_or(&self, key: &str, otherwise: &str) -> String {
        self.global
            .get(key)
            .map_or_else(|| otherwise.to_string(), Value::to_string)
    }

    /// Returns the first of `names` that is defined and truthy.
    pub fn get_any(&self, names: &[&str]) -> Option<&Value> {
        names
            .iter()
            .filter_map(|name| self.global.get(*name))
            .find(|value| value.is_truthy())
    }

    /// Sets a global variable. String values get eager `%(name)s` substitution
    /// against the environment as it is right now.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<(), EnvError> {
        let value = match value.into() {
            Value::Str(raw) => Value::Str(
                interpolator::eager_substitute(&raw, self, true).map_err(|source| {
                    EnvError::Substitution {
                        key: key.to_string(),
                        source,
                    }
                })?,
            ),
            other => other,
        };
        log::trace!("set {} = {:?}", key, value);
        self.global.insert(key.to_string(), value);
        Ok(())
    }

    /// Stores a value as-is, without substitution. Used for user settings.
    pub fn insert_raw(&mut self, key: &str, value: impl Into<Value>) {
        self.global.insert(key.to_string(), value.into());
    }

    /// Fails with a descriptive message unless every name in `names` is set.
    pub fn require(
        &self,
        names: &[String],
        used_for: Option<&str>,
        provided_by: &[String],
    ) -> Result<(), EnvError> {
        let missing: Vec<&String> = names
            .iter()
            .filter(|name| !self.global.contains_key(name.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let vars_msg = match missing.as_slice() {
            [single] => format!("a '{}' variable.", single),
            many => format!(
                "the variables {}.",
                many.iter()
                    .map(|name| format!("'{}'", name))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let mut message = format!(
            "The '{}' command requires {}",
            self.get_or(keys::CUR_COMMAND, "current"),
            vars_msg
        );
        if let Some(used_for) = interpolator::lazy_format_opt(used_for, self)? {
            message.push_str(&format!("\nThis variable is used for {}", used_for));
        }
        if !provided_by.is_empty() {
            message.push_str("\nGet the variable by running one of these commands:");
            for command in provided_by {
                message.push_str(&format!("\n\t{}", command));
            }
        }
        Err(EnvError::MissingVariables(message))
    }

    /// Lazily formats `template` against the global layer.
    pub fn lazy_format(&self, template: &str) -> Result<String, InterpolationError> {
        interpolator::lazy_format(template, self)
    }

    /// Flattens global, identity and host layers into the view for one host.
    pub fn merge(&self, identity: &Layer, host: &Layer) -> Scope {
        let mut vars = self.global.clone();
        vars.extend(identity.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.extend(host.iter().map(|(k, v)| (k.clone(), v.clone())));
        Scope { vars }
    }

    /// A view of the global layer alone, for local operations.
    pub fn view(&self) -> Scope {
        Scope {
            vars: self.global.clone(),
        }
    }

    /// Reads `key` as a port-like integer.
    pub fn get_port(&self, key: &str) -> Result<u16, EnvError> {
        match self.global.get(key) {
            Some(value) => value_to_port(key, value),
            None => Ok(22),
        }
    }
}

/// A flattened, read-only set of variables for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    vars: Layer,
}

impl Lookup for Scope {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }
}

impl Scope {
    /// Returns the value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Returns the rendered value of `key` when it is set and truthy.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .filter(|value| value.is_truthy())
            .map(Value::to_string)
    }

    /// Returns the rendered value of `key`, or `otherwise`.
    pub fn get_or(&self, key: &str, otherwise: &str) -> String {
        self.vars
            .get(key)
            .map_or_else(|| otherwise.to_string(), Value::to_string)
    }

    /// Reads `key` as a boolean flag.
    pub fn flag(&self, key: &str) -> bool {
        self.vars.get(key).is_some_and(Value::as_flag)
    }

    /// The host this view was built for, or `localhost` for global views.
    pub fn host(&self) -> String {
        self.get_or(keys::HOST, "localhost")
    }

    /// Lazily formats `template` against this view.
    pub fn lazy_format(&self, template: &str) -> Result<String, InterpolationError> {
        interpolator::lazy_format(template, self)
    }

    /// Adds a per-invocation variable (e.g. `fab_current_operation`).
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }
}

pub(crate) fn value_to_port(key: &str, value: &Value) -> Result<u16, EnvError> {
    let invalid = || EnvError::InvalidType {
        key: key.to_string(),
        expected: "a port number",
        found: value.to_string(),
    };
    match value {
        Value::Int(i) => u16::try_from(*i).map_err(|_| invalid()),
        Value::Str(s) => s.trim().parse::<u16>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn default_identity() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

fn timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_layer_wins_over_global() {
        let mut env = Environment::new();
        env.set("greeting", "global").unwrap();
        let identity: Layer = [("greeting".to_string(), Value::from("identity"))].into();
        let host: Layer = [("greeting".to_string(), Value::from("host"))].into();

        assert_eq!(env.merge(&identity, &host).get_or("greeting", ""), "host");
        assert_eq!(env.merge(&identity, &Layer::new()).get_or("greeting", ""), "identity");
        assert_eq!(env.merge(&Layer::new(), &Layer::new()).get_or("greeting", ""), "global");
    }

    #[test]
    fn test_set_applies_eager_substitution_to_strings_only() {
        let mut env = Environment::with_defaults();
        env.set(keys::USER, "joe").unwrap();
        env.set("home", "/home/%(fab_user)s/$(later)").unwrap();
        env.set("retries", Value::Int(3)).unwrap();

        assert_eq!(env.get("home"), Some(&Value::from("/home/joe/$(later)")));
        assert_eq!(env.get("retries"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_set_rejects_unknown_eager_reference() {
        let mut env = Environment::new();
        let err = env.set("path", "%(nope)s").unwrap_err();
        assert!(matches!(err, EnvError::Substitution { .. }));
        assert!(env.get("path").is_none());
    }

    #[test]
    fn test_get_any_skips_falsy_values() {
        let mut env = Environment::new();
        env.insert_raw("hostname", "");
        env.insert_raw("ipv4", "10.0.0.1");
        assert_eq!(env.get_any(&["hostname", "ipv4"]), Some(&Value::from("10.0.0.1")));
        assert_eq!(env.get_any(&["nothing"]), None);
    }

    #[test]
    fn test_require_reports_missing_variables() {
        let mut env = Environment::new();
        env.insert_raw(keys::CUR_COMMAND, "deploy");
        env.insert_raw("project", "shop");

        assert!(env.require(&["project".to_string()], None, &[]).is_ok());

        let err = env
            .require(
                &["project".to_string(), "install_dir".to_string()],
                Some("finding the $(project) dir"),
                &["staging".to_string()],
            )
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("The 'deploy' command requires a 'install_dir' variable."));
        assert!(err.contains("used for finding the shop dir"));
        assert!(err.contains("\tstaging"));
    }

    #[test]
    fn test_scope_lazy_format_sees_host_values() {
        let env = Environment::with_defaults();
        let host: Layer = [(keys::HOST.to_string(), Value::from("web1"))].into();
        let scope = env.merge(&Layer::new(), &host);
        assert_eq!(scope.lazy_format("[$(fab_host)]").unwrap(), "[web1]");
        assert_eq!(scope.host(), "web1");
    }

    #[test]
    fn test_port_parsing() {
        let mut env = Environment::new();
        env.insert_raw(keys::PORT, "2222");
        assert_eq!(env.get_port(keys::PORT).unwrap(), 2222);
        env.insert_raw(keys::PORT, "ssh");
        assert!(env.get_port(keys::PORT).is_err());
    }
}
