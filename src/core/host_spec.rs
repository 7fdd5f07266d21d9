// src/core/host_spec.rs

use crate::{
    constants::keys,
    core::environment::{EnvError, Environment},
    models::HostSpec,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostSpecError {
    #[error("No hosts to connect to. Set 'fab_hosts' (e.g. `fab -H web1,web2 ...`).")]
    EmptyHostList,
    #[error("Host '{0}' has an empty hostname.")]
    EmptyHostname(String),
    #[error("Host '{host}' has an invalid port '{port}'.")]
    InvalidPort { host: String, port: String },
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Parses `[identity@]host[:port]`.
///
/// The identity is everything before the last `@`; the port is everything after
/// the first `:` that follows it. Missing parts fall back to the given defaults.
pub fn parse(
    raw: &str,
    default_identity: &str,
    default_port: u16,
) -> Result<HostSpec, HostSpecError> {
    let raw = raw.trim();
    let (identity, host_and_port) = match raw.rsplit_once('@') {
        Some((identity, rest)) => (identity, rest),
        None => ("", raw),
    };
    let (hostname, port) = match host_and_port.split_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (host_and_port, None),
    };

    if hostname.is_empty() {
        return Err(HostSpecError::EmptyHostname(raw.to_string()));
    }

    let port = match port {
        Some(p) if !p.is_empty() => p.parse::<u16>().map_err(|_| HostSpecError::InvalidPort {
            host: raw.to_string(),
            port: p.to_string(),
        })?,
        _ => default_port,
    };

    let identity = if identity.is_empty() {
        default_identity
    } else {
        identity
    };

    Ok(HostSpec {
        identity: identity.to_string(),
        hostname: hostname.to_string(),
        port,
    })
}

/// Parses every entry of `fab_hosts`, using `fab_user` and `fab_port` as defaults.
/// An empty or missing host list is a hard error.
pub fn parse_host_list(env: &Environment) -> Result<Vec<HostSpec>, HostSpecError> {
    let raw_hosts = env
        .get(keys::HOSTS)
        .map(|value| value.to_list())
        .unwrap_or_default();
    if raw_hosts.is_empty() {
        return Err(HostSpecError::EmptyHostList);
    }

    let default_identity = env.get_or(keys::USER, "root");
    let default_port = env.get_port(keys::PORT)?;

    raw_hosts
        .iter()
        .map(|raw| parse(raw, &default_identity, default_port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    #[test]
    fn test_parse_full_spec() {
        let spec = parse("dev@host2:2222", "alice", 22).unwrap();
        assert_eq!(spec.identity, "dev");
        assert_eq!(spec.hostname, "host2");
        assert_eq!(spec.port, 2222);
    }

    #[test]
    fn test_parse_uses_defaults() {
        let spec = parse("host3", "alice", 22).unwrap();
        assert_eq!(
            (spec.identity.as_str(), spec.hostname.as_str(), spec.port),
            ("alice", "host3", 22)
        );
    }

    #[test]
    fn test_parse_splits_identity_on_last_at() {
        let spec = parse("ci@corp@build:2200", "alice", 22).unwrap();
        assert_eq!(spec.identity, "ci@corp");
        assert_eq!(spec.hostname, "build");
        assert_eq!(spec.port, 2200);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            parse("web:http", "alice", 22),
            Err(HostSpecError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse("dev@:22", "alice", 22),
            Err(HostSpecError::EmptyHostname(_))
        ));
    }

    #[test]
    fn test_parse_host_list_requires_hosts() {
        let mut env = Environment::with_defaults();
        assert_eq!(parse_host_list(&env), Err(HostSpecError::EmptyHostList));

        env.insert_raw(keys::HOSTS, Value::List(Vec::new()));
        assert_eq!(parse_host_list(&env), Err(HostSpecError::EmptyHostList));

        env.insert_raw(keys::USER, "alice");
        env.insert_raw(keys::HOSTS, Value::List(vec!["a".into(), "bob@b:2200".into()]));
        let specs = parse_host_list(&env).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].identity, "alice");
        assert_eq!(specs[1].port, 2200);
    }
}
