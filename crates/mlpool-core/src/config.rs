//! Runtime configuration assembled from the process environment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PoolError;

const DEFAULT_PARALLEL_WORKERS: usize = 1;
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_QUEUE_DEPTH: usize = 64;
const DEFAULT_MAX_RESPAWNS: u32 = 5;

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// How the orchestrator launches worker processes.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub startup_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// Crash-recovery backoff for a single pool slot.
#[derive(Debug, Clone, Copy)]
pub struct RespawnPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed lives after which a slot is reported failed.
    pub max_consecutive_failures: u32,
    /// A worker alive at least this long resets its slot's failure count.
    pub stable_after: Duration,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_consecutive_failures: DEFAULT_MAX_RESPAWNS,
            stable_after: Duration::from_secs(30),
        }
    }
}

impl RespawnPolicy {
    /// Delay before the `failures`-th consecutive respawn: `base * 2^(n-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) parallel_workers: usize,
    pub(crate) environments_dir: PathBuf,
    pub(crate) queue_depth: usize,
    pub(crate) worker: WorkerConfig,
    pub(crate) respawn: RespawnPolicy,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a variable cannot be parsed or no worker program
    /// can be determined.
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self, PoolError> {
        let parallel_workers = parse_var(
            snapshot,
            "MLPOOL_PARALLEL_WORKERS",
            DEFAULT_PARALLEL_WORKERS,
        )?;
        let environments_dir = match snapshot.var("MLPOOL_ENVIRONMENTS_DIR") {
            Some(path) => PathBuf::from(path),
            None => default_environments_dir()?,
        };
        let program = match snapshot.var("MLPOOL_WORKER_PROGRAM") {
            Some(program) => PathBuf::from(program),
            None => env::current_exe().map_err(|err| {
                PoolError::config(format!("cannot locate the worker executable: {err}"))
            })?,
        };
        let max_respawns = parse_var(snapshot, "MLPOOL_MAX_RESPAWNS", DEFAULT_MAX_RESPAWNS)?;
        let config = Self {
            parallel_workers,
            environments_dir,
            queue_depth: parse_var(snapshot, "MLPOOL_QUEUE_DEPTH", DEFAULT_QUEUE_DEPTH)?,
            worker: WorkerConfig {
                program,
                args: vec!["worker".to_string()],
                startup_timeout: parse_secs(
                    snapshot,
                    "MLPOOL_STARTUP_TIMEOUT_SECS",
                    DEFAULT_STARTUP_TIMEOUT,
                )?,
                dispatch_timeout: parse_secs(
                    snapshot,
                    "MLPOOL_DISPATCH_TIMEOUT_SECS",
                    DEFAULT_DISPATCH_TIMEOUT,
                )?,
                shutdown_timeout: parse_secs(
                    snapshot,
                    "MLPOOL_SHUTDOWN_TIMEOUT_SECS",
                    DEFAULT_SHUTDOWN_TIMEOUT,
                )?,
            },
            respawn: RespawnPolicy {
                max_consecutive_failures: max_respawns,
                ..RespawnPolicy::default()
            },
        };
        config.validate()
    }

    /// Configuration with defaults for everything but the paths that matter.
    #[must_use]
    pub fn new(environments_dir: impl Into<PathBuf>, worker_program: impl Into<PathBuf>) -> Self {
        Self {
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            environments_dir: environments_dir.into(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            worker: WorkerConfig {
                program: worker_program.into(),
                args: vec!["worker".to_string()],
                startup_timeout: DEFAULT_STARTUP_TIMEOUT,
                dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
                shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            },
            respawn: RespawnPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers;
        self
    }

    #[must_use]
    pub fn with_environments_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.environments_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker.args = args;
        self
    }

    #[must_use]
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.worker.dispatch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.worker.startup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    #[must_use]
    pub fn with_respawn(mut self, respawn: RespawnPolicy) -> Self {
        self.respawn = respawn;
        self
    }

    /// Rejects configurations a pool cannot run with.
    ///
    /// # Errors
    /// Returns [`PoolError::Config`] when the worker count is zero.
    pub fn validate(self) -> Result<Self, PoolError> {
        if self.parallel_workers == 0 {
            return Err(PoolError::config("MLPOOL_PARALLEL_WORKERS must be at least 1"));
        }
        Ok(self)
    }

    #[must_use]
    pub fn parallel_workers(&self) -> usize {
        self.parallel_workers
    }

    #[must_use]
    pub fn environments_dir(&self) -> &std::path::Path {
        &self.environments_dir
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    #[must_use]
    pub fn worker(&self) -> &WorkerConfig {
        &self.worker
    }

    #[must_use]
    pub fn respawn(&self) -> &RespawnPolicy {
        &self.respawn
    }
}

fn parse_var<T: std::str::FromStr>(
    snapshot: &EnvSnapshot,
    key: &str,
    default: T,
) -> Result<T, PoolError> {
    match snapshot.var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| PoolError::config(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn parse_secs(snapshot: &EnvSnapshot, key: &str, default: Duration) -> Result<Duration, PoolError> {
    match snapshot.var(key) {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| PoolError::config(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}

pub(crate) fn default_environments_dir() -> Result<PathBuf, PoolError> {
    let home = dirs_next::home_dir().ok_or_else(|| PoolError::config("HOME not set"))?;
    Ok(home.join(".mlpool").join("envs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_overrides_defaults() {
        let snapshot = EnvSnapshot::testing(&[
            ("MLPOOL_PARALLEL_WORKERS", "3"),
            ("MLPOOL_ENVIRONMENTS_DIR", "/tmp/mlpool-envs"),
            ("MLPOOL_WORKER_PROGRAM", "/usr/bin/worker"),
            ("MLPOOL_DISPATCH_TIMEOUT_SECS", "2.5"),
            ("MLPOOL_QUEUE_DEPTH", "8"),
            ("MLPOOL_MAX_RESPAWNS", "2"),
        ]);
        let config = Config::from_snapshot(&snapshot).expect("config");
        assert_eq!(config.parallel_workers(), 3);
        assert_eq!(config.environments_dir(), PathBuf::from("/tmp/mlpool-envs"));
        assert_eq!(config.worker().program, PathBuf::from("/usr/bin/worker"));
        assert_eq!(config.worker().dispatch_timeout, Duration::from_millis(2500));
        assert_eq!(config.worker().startup_timeout, DEFAULT_STARTUP_TIMEOUT);
        assert_eq!(config.queue_depth(), 8);
        assert_eq!(config.respawn().max_consecutive_failures, 2);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let snapshot = EnvSnapshot::testing(&[
            ("MLPOOL_PARALLEL_WORKERS", "0"),
            ("MLPOOL_ENVIRONMENTS_DIR", "/tmp/envs"),
            ("MLPOOL_WORKER_PROGRAM", "/usr/bin/worker"),
        ]);
        let err = Config::from_snapshot(&snapshot).expect_err("zero workers");
        assert!(matches!(err, PoolError::Config { .. }));
    }

    #[test]
    fn malformed_values_are_reported() {
        let snapshot = EnvSnapshot::testing(&[
            ("MLPOOL_STARTUP_TIMEOUT_SECS", "soon"),
            ("MLPOOL_ENVIRONMENTS_DIR", "/tmp/envs"),
            ("MLPOOL_WORKER_PROGRAM", "/usr/bin/worker"),
        ]);
        let err = Config::from_snapshot(&snapshot).expect_err("bad timeout");
        assert!(err.to_string().contains("MLPOOL_STARTUP_TIMEOUT_SECS"));
    }

    #[test]
    #[serial_test::serial]
    fn from_env_reads_process_variables() {
        env::set_var("MLPOOL_PARALLEL_WORKERS", "4");
        env::set_var("MLPOOL_ENVIRONMENTS_DIR", "/tmp/mlpool-from-env");
        env::remove_var("MLPOOL_WORKER_PROGRAM");
        let config = Config::from_env();
        env::remove_var("MLPOOL_PARALLEL_WORKERS");
        env::remove_var("MLPOOL_ENVIRONMENTS_DIR");

        let config = config.expect("config");
        assert_eq!(config.parallel_workers(), 4);
        assert_eq!(config.environments_dir(), PathBuf::from("/tmp/mlpool-from-env"));
        assert_eq!(
            config.worker().program,
            env::current_exe().expect("current exe")
        );
        assert_eq!(config.worker().args, vec!["worker".to_string()]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RespawnPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(30), Duration::from_secs(5));
    }
}
