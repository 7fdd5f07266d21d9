// src/models.rs

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// --- ENVIRONMENT VALUES ---

/// A single environment value.
///
/// Most variables are strings, but a few well-known ones carry richer types
/// (`fab_port` is an integer, `fab_hosts` a list, `fab_print_real_sudo` a flag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Explicitly unset. Renders as an empty string.
    Null,
    /// Plain text; the only kind eager substitution touches.
    Str(String),
    /// Integer, rendered in decimal.
    Int(i64),
    /// Boolean, rendered as `true`/`false`.
    Bool(bool),
    /// List of strings, rendered comma-separated.
    List(Vec<String>),
}

impl Value {
    /// Returns the string payload of a `Str` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by `get_any` and by `prompt` to decide whether a value is present.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Str(s) => !s.is_empty(),
            Self::Int(i) => *i != 0,
            Self::Bool(b) => *b,
            Self::List(items) => !items.is_empty(),
        }
    }

    /// Interprets the value as a flag. Strings such as `"true"`, `"yes"` and `"1"` count as set.
    pub fn as_flag(&self) -> bool {
        match self {
            Self::Str(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1" | "on"),
            other => other.is_truthy(),
        }
    }

    /// Interprets the value as a list of items. Strings are split on `,`, `;` and whitespace.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::Null => Vec::new(),
            Self::List(items) => items.clone(),
            Self::Str(s) => s
                .split(|c: char| c.is_whitespace() || c == ';' || c == ',')
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
            other => vec![other.to_string()],
        }
    }

    /// Converts a TOML value read from a fabfile.
    pub fn from_toml(value: &toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::Str(s.clone()),
            toml::Value::Integer(i) => Self::Int(*i),
            toml::Value::Boolean(b) => Self::Bool(*b),
            toml::Value::Array(items) => Self::List(
                items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => Self::Str(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Bool(b) => write!(f, "{}", b),
            Self::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

/// One scope of variables (global, identity or host).
pub type Layer = BTreeMap<String, Value>;

// --- FAILURE POLICY ---

/// What happens when an operation fails on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Nothing observable.
    Ignore,
    /// Print a warning and continue.
    Warn,
    /// Print an error and stop the whole run.
    Abort,
}

impl FailurePolicy {
    /// All valid names, in severity order.
    pub const NAMES: &'static [&'static str] = &["ignore", "warn", "abort"];

    /// Prefix printed in front of failure messages.
    pub fn message_prefix(self) -> &'static str {
        match self {
            Self::Ignore => "",
            Self::Warn => "Warning: ",
            Self::Abort => "Error: ",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "warn" => Ok(Self::Warn),
            "abort" => Ok(Self::Abort),
            other => Err(format!(
                "Unknown failure policy '{}'. Valid policies are: {}",
                other,
                Self::NAMES.join(", ")
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ignore => "ignore",
            Self::Warn => "warn",
            Self::Abort => "abort",
        })
    }
}

// --- OPERATION OUTCOMES ---

/// Result tag of one operation invocation on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// The operation did what it was asked to.
    Succeeded,
    /// The operation ran and failed, or raised a fault.
    Failed,
    /// The operation chose not to run (e.g. a declined confirmation).
    Skipped,
}

/// Outcome of one operation invocation, with an optional diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// What happened.
    pub status: OutcomeStatus,
    /// Extra detail, shown when the failure policy reports the outcome.
    pub message: Option<String>,
}

impl Outcome {
    /// A successful outcome.
    pub fn succeeded() -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            message: None,
        }
    }

    /// A failed outcome without diagnostic text.
    pub fn failed() -> Self {
        Self {
            status: OutcomeStatus::Failed,
            message: None,
        }
    }

    /// A failed outcome carrying a diagnostic.
    pub fn failed_with(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            message: Some(message.into()),
        }
    }

    /// A skipped outcome.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            message: Some(reason.into()),
        }
    }

    /// Maps a boolean success flag onto an outcome.
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::succeeded()
        } else {
            Self::failed()
        }
    }

    /// True when the outcome must be handed to the failure policy.
    pub fn is_failure(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }
}

// --- HOSTS ---

/// A parsed `[identity@]host[:port]` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostSpec {
    /// Remote identity (login user).
    pub identity: String,
    /// Hostname or address.
    pub hostname: String,
    /// SSH port.
    pub port: u16,
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.identity, self.hostname, self.port)
    }
}
