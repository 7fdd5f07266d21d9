// src/core/strategy.rs

//! # Execution Strategies
//!
//! A strategy decides in what order, and with how much concurrency, the hosts
//! of one operation call are visited. It receives the prepared per-host
//! [`HostTask`]s and a `work` closure that invokes the operation and routes the
//! outcome through the failure policy, returning a [`Verdict`].
//!
//! - `rolling`: one host at a time in input order, fail-fast.
//! - `fanout`: every host at once on a dedicated `rayon` pool. An abort sets
//!   the run's cancellation token so in-flight workers stop, and is reported
//!   once every worker has returned.

use crate::{
    CancellationToken,
    constants::keys,
    core::{
        environment::Scope,
        failure::{FailureError, Verdict},
    },
    system::transport::Session,
};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("Unsupported fab_mode: {name}\nSupported modes are: {valid}")]
    Unknown { name: String, valid: String },
    /// Stopped by the failure policy; the message was already reported.
    #[error("{0}")]
    Aborted(String),
    #[error("Run was cancelled.")]
    Cancelled,
    #[error(transparent)]
    Policy(#[from] FailureError),
    #[error("Could not start worker pool: {0}")]
    Pool(String),
}

/// One host's share of an operation call.
#[derive(Clone)]
pub struct HostTask {
    /// Host identifier used in output.
    pub host: String,
    /// Merged variables for this host.
    pub scope: Scope,
    /// Live session, for remote operations.
    pub session: Option<Arc<dyn Session>>,
}

impl fmt::Debug for HostTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTask")
            .field("host", &self.host)
            .field("session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

/// Invokes the operation for one host and applies the failure policy.
pub type HostWork<'a> = dyn Fn(&HostTask) -> Result<Verdict, StrategyError> + Sync + 'a;

/// A per-host dispatch algorithm.
pub trait Strategy: Send + Sync {
    /// Name used in `fab_mode`.
    fn name(&self) -> &'static str;
    /// One-line description.
    fn description(&self) -> &'static str;
    /// Runs `work` for every task.
    fn run(
        &self,
        tasks: &[HostTask],
        work: &HostWork<'_>,
        token: &CancellationToken,
    ) -> Result<(), StrategyError>;
}

/// One host at a time, in input order. An abort stops before the next host.
#[derive(Debug, Default)]
pub struct RollingStrategy;

impl Strategy for RollingStrategy {
    fn name(&self) -> &'static str {
        "rolling"
    }

    fn description(&self) -> &'static str {
        "One-at-a-time fail-fast strategy."
    }

    fn run(
        &self,
        tasks: &[HostTask],
        work: &HostWork<'_>,
        token: &CancellationToken,
    ) -> Result<(), StrategyError> {
        for task in tasks {
            if token.load(Ordering::SeqCst) {
                return Err(StrategyError::Cancelled);
            }
            log::trace!("rolling: {}", task.host);
            if let Verdict::Abort(message) = work(task)? {
                return Err(StrategyError::Aborted(message));
            }
        }
        Ok(())
    }
}

/// Every host concurrently; returns after all workers have finished.
#[derive(Debug, Default)]
pub struct FanoutStrategy;

impl FanoutStrategy {
    fn pool_size(tasks: &[HostTask]) -> usize {
        let limit = tasks
            .first()
            .and_then(|task| task.scope.get(keys::FANOUT_LIMIT))
            .and_then(|value| value.to_string().parse::<usize>().ok())
            .filter(|limit| *limit > 0);
        limit.map_or(tasks.len(), |limit| limit.min(tasks.len())).max(1)
    }
}

impl Strategy for FanoutStrategy {
    fn name(&self) -> &'static str {
        "fanout"
    }

    fn description(&self) -> &'static str {
        "Executes on all hosts in parallel."
    }

    fn run(
        &self,
        tasks: &[HostTask],
        work: &HostWork<'_>,
        token: &CancellationToken,
    ) -> Result<(), StrategyError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(Self::pool_size(tasks))
            .thread_name(|i| format!("fab-fanout-{}", i))
            .build()
            .map_err(|e| StrategyError::Pool(e.to_string()))?;
        log::debug!(
            "fanout: {} host(s) on {} worker(s)",
            tasks.len(),
            pool.current_num_threads()
        );

        let results: Vec<Result<Verdict, StrategyError>> = pool.install(|| {
            tasks
                .par_iter()
                .with_max_len(1)
                .map(|task| {
                    if token.load(Ordering::SeqCst) {
                        return Err(StrategyError::Cancelled);
                    }
                    log::trace!("fanout: {} started", task.host);
                    let result = work(task);
                    if !matches!(result, Ok(Verdict::Continue)) {
                        // Tell the other workers to stop.
                        token.store(true, Ordering::SeqCst);
                    }
                    result
                })
                .collect()
        });

        let mut first_error = None;
        for result in results {
            match result {
                Ok(Verdict::Continue) => {}
                Ok(Verdict::Abort(message)) => return Err(StrategyError::Aborted(message)),
                Err(StrategyError::Aborted(message)) => return Err(StrategyError::Aborted(message)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Strategies by name.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: BTreeMap<&'static str, Arc<dyn Strategy>>,
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.strategies.keys()).finish()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            strategies: BTreeMap::new(),
        };
        registry.register(Arc::new(RollingStrategy));
        registry.register(Arc::new(FanoutStrategy));
        registry
    }
}

impl StrategyRegistry {
    /// A registry holding `rolling` and `fanout`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a strategy.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(strategy.name(), strategy);
    }

    /// Looks a strategy up by name; unknown names list the valid ones.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Strategy>, StrategyError> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| StrategyError::Unknown {
                name: name.to_string(),
                valid: self.strategies.keys().copied().collect::<Vec<_>>().join(", "),
            })
    }

    /// All strategies, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Strategy>> {
        self.strategies.values()
    }
}
