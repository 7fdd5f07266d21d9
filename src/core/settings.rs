// src/core/settings.rs

//! User default settings: a `key=value` file (`~/.fabric`, or `$FAB_SETTINGS`)
//! merged into the global layer at startup, before the fabfile and the
//! command line.

use crate::{
    constants::{USER_SETTINGS_ENV, USER_SETTINGS_FILENAME},
    core::environment::Environment,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Could not read settings file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Where the user settings file is expected.
pub fn settings_path() -> Option<PathBuf> {
    match std::env::var(USER_SETTINGS_ENV) {
        Ok(custom) if !custom.trim().is_empty() => {
            Some(PathBuf::from(shellexpand::tilde(custom.trim()).into_owned()))
        }
        _ => dirs::home_dir().map(|home| home.join(USER_SETTINGS_FILENAME)),
    }
}

/// Parses `key=value` lines. Blank lines and `#` comments are skipped, as are
/// lines without `=` (with a warning).
pub fn parse_settings(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            match line.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Some((key.trim().to_string(), value.trim().to_string()))
                }
                _ => {
                    log::warn!("Ignoring malformed settings line {}: '{}'", index + 1, line);
                    None
                }
            }
        })
        .collect()
}

/// Loads `path` into the global layer. Values are stored as-is.
pub fn load_settings_file(path: &Path, env: &mut Environment) -> Result<usize, SettingsError> {
    let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let settings = parse_settings(&content);
    for (key, value) in &settings {
        env.insert_raw(key, value.as_str());
    }
    log::debug!("Loaded {} setting(s) from {}", settings.len(), path.display());
    Ok(settings.len())
}

/// Loads the user settings file when it exists.
pub fn load_user_settings(env: &mut Environment) -> Result<Option<PathBuf>, SettingsError> {
    let Some(path) = settings_path() else {
        log::debug!("No home directory, skipping user settings.");
        return Ok(None);
    };
    if !path.is_file() {
        log::trace!("No user settings at {}", path.display());
        return Ok(None);
    }
    load_settings_file(&path, env)?;
    Ok(Some(path))
}
