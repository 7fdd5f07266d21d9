// src/core/fabfile.rs

//! # Fabfile Loader
//!
//! A fabfile is a TOML document with a `[settings]` table, applied in file
//! order through the eager `set`, and a `[commands]` table of user commands.
//!
//! ```toml
//! [settings]
//! fab_hosts = ["web1", "dev@web2:2222"]
//! install_dir = "/srv/%(app)s"
//!
//! [commands.deploy]
//! doc = "Build and ship"
//! requires = ["install_dir"]
//! depends = ["build"]
//! steps = [
//!   { op = "put", args = ["dist/app.tgz", "/tmp/app.tgz"], fail = "warn" },
//!   { op = "run", args = ["tar xzf /tmp/app.tgz -C $(install_dir)"] },
//! ]
//! ```

use crate::{
    constants::FABFILE_CANDIDATES,
    core::environment::{EnvError, Environment},
    models::{FailurePolicy, Value},
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabfileError {
    #[error("Could not read fabfile '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Could not parse fabfile '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid setting '{key}' in fabfile: {source}")]
    Setting {
        key: String,
        #[source]
        source: EnvError,
    },
}

/// A parsed fabfile.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fabfile {
    /// Variables, in file order.
    #[serde(default)]
    pub settings: toml::Table,
    /// User commands by name.
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSpec>,
}

/// A user command as written in the fabfile.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    /// Help text.
    #[serde(default)]
    pub doc: Option<String>,
    /// Variables that must be set before the steps run.
    #[serde(default)]
    pub requires: Vec<String>,
    /// What the required variables are used for, lazily formatted.
    #[serde(default)]
    pub used_for: Option<String>,
    /// Commands that set the required variables.
    #[serde(default)]
    pub provided_by: Vec<String>,
    /// Commands run once (per run) before this one.
    #[serde(default)]
    pub depends: Vec<String>,
    /// The body of the command.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// One step of a user command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    /// Invoke an operation.
    Operation {
        op: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        fail: Option<FailurePolicy>,
        #[serde(default)]
        confirm: Option<String>,
    },
    /// Set variables (eager substitution).
    Set { set: toml::Table },
    /// Ask for a variable unless it is already set.
    Prompt {
        prompt: String,
        message: String,
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        validate: Option<String>,
    },
    /// Fail unless the variables are set.
    Require {
        require: Vec<String>,
        #[serde(default)]
        used_for: Option<String>,
        #[serde(default)]
        provided_by: Vec<String>,
    },
    /// Run another command once.
    Call { call: String },
}

impl Fabfile {
    /// Parses fabfile text; `origin` is only used in error messages.
    pub fn parse(content: &str, origin: &str) -> Result<Self, FabfileError> {
        toml::from_str(content).map_err(|source| FabfileError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Reads and parses the fabfile at `path`.
    pub fn load(path: &Path) -> Result<Self, FabfileError> {
        let content = fs::read_to_string(path).map_err(|source| FabfileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let fabfile = Self::parse(&content, &path.display().to_string())?;
        log::debug!(
            "Loaded fabfile {} ({} setting(s), {} command(s))",
            path.display(),
            fabfile.settings.len(),
            fabfile.commands.len()
        );
        Ok(fabfile)
    }

    /// Applies `[settings]` to the global layer, in file order.
    pub fn apply_settings(&self, env: &mut Environment) -> Result<(), FabfileError> {
        for (key, value) in &self.settings {
            env.set(key, Value::from_toml(value))
                .map_err(|source| FabfileError::Setting {
                    key: key.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// Picks the fabfile: the explicit path when given, else the first candidate
/// name present in `dir`.
pub fn find_fabfile(explicit: Option<&Path>, dir: &Path) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(PathBuf::from(
            shellexpand::tilde(&path.display().to_string()).into_owned(),
        )),
        None => FABFILE_CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file()),
    }
}
