// src/core/connection.rs

//! # Connection Manager
//!
//! Owns every live session of a run. Connections are created lazily the first
//! time an operation needs a host, grouped by identity so that all hosts logged
//! into as the same user share one identity-scoped variable layer, and closed
//! exactly once by [`ConnectionManager::disconnect_all`].
//!
//! Authentication first tries the credentials already known (key or password).
//! On an authentication failure the user is asked for a password until the
//! login succeeds; the accepted password is stored in the identity and host
//! layers so sibling hosts under the same identity do not ask again.

use crate::{
    constants::keys,
    core::{
        environment::{EnvError, Environment, Scope},
        host_spec::{self, HostSpecError},
        interpolator::InterpolationError,
        output::{Reporter, indent},
    },
    models::{HostSpec, Layer, Value},
    system::{
        prompt::{PromptError, Prompter},
        transport::{ConnectParams, Session, SessionTransport, TransportError},
    },
};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const PASSWORD_PROMPT: &str = "Password for $(fab_user)@$(fab_host)$(fab_passprompt_suffix)";
const SUFFIX_WITH_PREVIOUS: &str = " [Enter for previous]: ";
const SUFFIX_PLAIN: &str = ": ";

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    HostSpec(#[from] HostSpecError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
    #[error("Could not connect to {host}: {source}")]
    Transport {
        host: String,
        #[source]
        source: TransportError,
    },
    #[error("Could not read a password: {0}")]
    Prompt(#[source] io::Error),
    #[error("Login cancelled.")]
    Interrupted,
    #[error("Connections were already closed for this run.")]
    AlreadyDisconnected,
}

/// Lifecycle of one connection. Never goes back once `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, no attempt made yet.
    Unconnected,
    /// A login is in progress.
    Authenticating,
    /// A session is live.
    Connected,
    /// Closed at the end of the run.
    Disconnected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Variables shared by every host logged into as one identity.
#[derive(Debug)]
pub struct IdentityScope {
    name: String,
    layer: Mutex<Layer>,
    // Serializes logins under one identity so a captured password is reused.
    auth_lock: Mutex<()>,
}

impl IdentityScope {
    fn new(name: &str) -> Self {
        let mut layer = Layer::new();
        layer.insert(keys::USER.to_string(), Value::from(name));
        Self {
            name: name.to_string(),
            layer: Mutex::new(layer),
            auth_lock: Mutex::new(()),
        }
    }

    /// The identity (login user) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A copy of the identity layer.
    pub fn snapshot(&self) -> Layer {
        lock(&self.layer).clone()
    }
}

/// One host of the run and its session.
pub struct Connection {
    spec: HostSpec,
    identity: Arc<IdentityScope>,
    host_layer: Mutex<Layer>,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("spec", &self.spec)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec.hostname)
    }
}

impl Connection {
    fn new(spec: HostSpec, identity: Arc<IdentityScope>) -> Self {
        let mut host_layer = Layer::new();
        host_layer.insert(keys::HOST.to_string(), Value::from(spec.hostname.as_str()));
        host_layer.insert(keys::PORT.to_string(), Value::from(spec.port));
        Self {
            spec,
            identity,
            host_layer: Mutex::new(host_layer),
            state: Mutex::new(ConnectionState::Unconnected),
            session: Mutex::new(None),
        }
    }

    /// The host this connection targets.
    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// The hostname, used as the output prefix.
    pub fn hostname(&self) -> &str {
        &self.spec.hostname
    }

    /// The identity scope shared with sibling hosts.
    pub fn identity(&self) -> &Arc<IdentityScope> {
        &self.identity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Builds the merged view for this host: global, then identity, then host.
    pub fn scope(&self, env: &Environment) -> Scope {
        let identity = self.identity.snapshot();
        let host = lock(&self.host_layer).clone();
        env.merge(&identity, &host)
    }

    /// Sets a host-scoped variable.
    pub fn set_host_var(&self, key: &str, value: impl Into<Value>) {
        lock(&self.host_layer).insert(key.to_string(), value.into());
    }

    /// The live session, or `Closed` when there is none.
    pub fn session(&self) -> Result<Arc<dyn Session>, TransportError> {
        lock(&self.session)
            .clone()
            .ok_or_else(|| TransportError::Closed(self.spec.to_string()))
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("{}: {:?} -> {:?}", self.spec, self.state(), state);
        *lock(&self.state) = state;
    }

    fn connect(
        &self,
        env: &Environment,
        transport: &dyn SessionTransport,
        prompter: &dyn Prompter,
        reporter: &dyn Reporter,
    ) -> Result<(), ConnectionError> {
        let _auth_guard = lock(&self.identity.auth_lock);
        if self.state() == ConnectionState::Disconnected {
            return Err(ConnectionError::Interrupted);
        }
        self.set_state(ConnectionState::Authenticating);

        let result = self.authenticate(env, transport, prompter, reporter);
        // The state lock is held from the check to the store, so a concurrent
        // `disconnect` either sees the session or is seen here.
        let mut state = lock(&self.state);
        if *state == ConnectionState::Disconnected {
            drop(state);
            if let Ok(session) = result {
                log::debug!("{}: closed during login, dropping new session", self.spec);
                close_session(&self.spec, session.as_ref());
            }
            return Err(ConnectionError::Interrupted);
        }
        match result {
            Ok(session) => {
                *lock(&self.session) = Some(Arc::from(session));
                *state = ConnectionState::Connected;
                log::debug!("{}: connected", self.spec);
                Ok(())
            }
            Err(e) => {
                *state = ConnectionState::Unconnected;
                Err(e)
            }
        }
    }

    fn authenticate(
        &self,
        env: &Environment,
        transport: &dyn SessionTransport,
        prompter: &dyn Prompter,
        reporter: &dyn Reporter,
    ) -> Result<Box<dyn Session>, ConnectionError> {
        let scope = self.scope(env);
        let mut params = connect_params(&self.spec, &scope);
        let transport_error = |source| ConnectionError::Transport {
            host: self.spec.to_string(),
            source,
        };

        match transport.connect(&params) {
            Ok(session) => return Ok(session),
            Err(e) if e.is_authentication() => {
                log::debug!("Direct login to {} failed: {}", self.spec, e);
            }
            Err(e) => return Err(transport_error(e)),
        }

        let mut suffix = if params.password.is_some() {
            SUFFIX_WITH_PREVIOUS
        } else {
            SUFFIX_PLAIN
        };

        loop {
            let prompt = scope
                .clone()
                .with(keys::PASSPROMPT_SUFFIX, suffix)
                .lazy_format(PASSWORD_PROMPT)?;
            let answer = prompter.password(&prompt).map_err(|e| match e {
                PromptError::EndOfInput => ConnectionError::Interrupted,
                PromptError::Io(e) => ConnectionError::Prompt(e),
            })?;
            // An empty answer keeps the previous password when one was offered.
            if !(answer.is_empty() && suffix == SUFFIX_WITH_PREVIOUS) {
                params.password = Some(answer);
            }

            match transport.connect(&params) {
                Ok(session) => {
                    if let Some(password) = &params.password {
                        self.remember_password(password);
                    }
                    return Ok(session);
                }
                Err(e) if e.is_authentication() => {
                    reporter.info("Bad password.");
                    suffix = SUFFIX_PLAIN;
                }
                Err(e) => return Err(transport_error(e)),
            }
        }
    }

    fn remember_password(&self, password: &str) {
        lock(&self.identity.layer).insert(keys::PASSWORD.to_string(), Value::from(password));
        lock(&self.host_layer).insert(keys::PASSWORD.to_string(), Value::from(password));
    }

    fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
        let session = lock(&self.session).take();
        if let Some(session) = session {
            close_session(&self.spec, session.as_ref());
        }
    }
}

fn close_session(spec: &HostSpec, session: &dyn Session) {
    if let Err(e) = session.close() {
        log::warn!("Failed to close session to {}: {}", spec, e);
    }
}

fn connect_params(spec: &HostSpec, scope: &Scope) -> ConnectParams {
    ConnectParams {
        hostname: spec.hostname.clone(),
        port: spec.port,
        user: scope.get_or(keys::USER, &spec.identity),
        password: scope.get_str(keys::PASSWORD),
        key_filename: scope
            .get_str(keys::KEY_FILENAME)
            .map(|path| PathBuf::from(shellexpand::tilde(&path).into_owned())),
        accept_new_host_keys: scope.get_or(keys::NEW_HOST_KEY, "accept") == "accept",
    }
}

/// The pool of sessions for one run.
pub struct ConnectionManager {
    transport: Arc<dyn SessionTransport>,
    prompter: Arc<dyn Prompter>,
    reporter: Arc<dyn Reporter>,
    connections: Mutex<Vec<Arc<Connection>>>,
    disconnected: AtomicBool,
    // Held for the whole close loop; later callers wait on it.
    teardown: Mutex<()>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &*lock(&self.connections))
            .field("disconnected", &self.disconnected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates an empty manager.
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        prompter: Arc<dyn Prompter>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            transport,
            prompter,
            reporter,
            connections: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            teardown: Mutex::new(()),
        }
    }

    /// The connections created so far, in host-list order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections).clone()
    }

    /// True once connections exist and all of them are live.
    pub fn is_connected(&self) -> bool {
        let connections = lock(&self.connections);
        !connections.is_empty()
            && connections
                .iter()
                .all(|c| c.state() == ConnectionState::Connected)
    }

    /// Makes sure every host in `fab_hosts` has a live session.
    ///
    /// Idempotent: once every connection is live, later calls return the same
    /// set without touching the transport. The connection list is not locked
    /// while logging in, so [`disconnect_all`](Self::disconnect_all) never
    /// waits on a password prompt.
    pub fn ensure_connections(
        &self,
        env: &Environment,
    ) -> Result<Vec<Arc<Connection>>, ConnectionError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyDisconnected);
        }

        let connections = {
            let mut guard = lock(&self.connections);
            if guard.is_empty() {
                *guard = build_connections(host_spec::parse_host_list(env)?);
            }
            guard.clone()
        };

        for group in group_by_identity(&connections) {
            let pending: Vec<&Arc<Connection>> = group
                .iter()
                .filter(|c| c.state() == ConnectionState::Unconnected)
                .copied()
                .collect();
            let Some(first) = pending.first() else {
                continue;
            };

            let announce = first
                .scope(env)
                .lazy_format("Logging into the following hosts as $(fab_user):")?;
            let names = pending
                .iter()
                .map(|c| c.hostname())
                .collect::<Vec<_>>()
                .join("\n");
            self.reporter.info(&format!("{}\n{}", announce, indent(&names, 4)));

            for connection in pending {
                if self.disconnected.load(Ordering::SeqCst) {
                    return Err(ConnectionError::Interrupted);
                }
                connection.connect(
                    env,
                    self.transport.as_ref(),
                    self.prompter.as_ref(),
                    self.reporter.as_ref(),
                )?;
            }
        }

        Ok(connections)
    }

    /// Closes every live session. Only the first call closes anything; a
    /// concurrent call returns once that first teardown has finished.
    pub fn disconnect_all(&self) {
        let _teardown = lock(&self.teardown);
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections = lock(&self.connections).clone();
        log::debug!("Disconnecting {} connection(s)", connections.len());
        for connection in connections {
            connection.disconnect();
        }
    }

    /// True once [`disconnect_all`](Self::disconnect_all) has run.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

/// One connection per distinct host spec, in input order, sharing one
/// identity scope per identity.
fn build_connections(specs: Vec<HostSpec>) -> Vec<Arc<Connection>> {
    let mut identities: Vec<Arc<IdentityScope>> = Vec::new();
    let mut seen: Vec<HostSpec> = Vec::new();
    let mut connections = Vec::new();

    for spec in specs {
        if seen.contains(&spec) {
            log::debug!("Ignoring duplicate host {}", spec);
            continue;
        }
        seen.push(spec.clone());

        let identity = match identities.iter().find(|i| i.name == spec.identity) {
            Some(existing) => existing.clone(),
            None => {
                let created = Arc::new(IdentityScope::new(&spec.identity));
                identities.push(created.clone());
                created
            }
        };
        connections.push(Arc::new(Connection::new(spec, identity)));
    }
    connections
}

/// Groups connections by identity, in order of first appearance.
fn group_by_identity(connections: &[Arc<Connection>]) -> Vec<Vec<&Arc<Connection>>> {
    let mut groups: Vec<Vec<&Arc<Connection>>> = Vec::new();
    for connection in connections {
        let existing = groups.iter_mut().find(|group| {
            group
                .first()
                .is_some_and(|c| Arc::ptr_eq(&c.identity, &connection.identity))
        });
        match existing {
            Some(group) => group.push(connection),
            None => groups.push(vec![connection]),
        }
    }
    groups
}
