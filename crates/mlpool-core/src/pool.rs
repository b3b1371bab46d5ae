//! Fixed-size pools of supervised workers.
//!
//! Idle workers wait in a FIFO queue of `(slot, generation)` tokens: a worker
//! that finishes a request goes to the back, so dispatch is least recently
//! used and no slot starves. Tokens from a previous generation of a slot are
//! stale and discarded on sight.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use mlpool_domain::{ModelSettings, PoolKey, WorkerCommand, WorkerPayload};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, watch, Semaphore},
    task::JoinSet,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::env::{Environment, EnvironmentLease};
use crate::error::{PoolError, WorkerError};
use crate::events::{WorkerEvent, WorkerExit};
use crate::worker::{Worker, WorkerSpec};

type IdleToken = (usize, u64);

#[derive(Default)]
struct Slot {
    worker: Option<Arc<Worker>>,
    generation: u64,
    failures: u32,
    failed: bool,
}

struct PoolInner {
    key: PoolKey,
    size: usize,
    config: Config,
    environment: Option<Environment>,
    lease: Mutex<Option<EnvironmentLease>>,
    slots: Mutex<Vec<Slot>>,
    models: Mutex<BTreeMap<String, ModelSettings>>,
    /// Serializes model binding changes with respawn replays.
    model_ops: tokio::sync::Mutex<()>,
    idle_tx: mpsc::UnboundedSender<IdleToken>,
    idle_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IdleToken>>,
    admission: Semaphore,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    events: broadcast::Sender<WorkerEvent>,
    /// Bumped whenever waiters must re-check pool state.
    wake: watch::Sender<u64>,
    stopped: AtomicBool,
}

/// Cheaply cloneable handle to a running pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("key", &self.inner.key)
            .field("size", &self.inner.size)
            .field("refcount", &self.refcount())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts `config.parallel_workers()` workers bound to the leased
    /// environment (or the ambient context).
    ///
    /// Startup is all-or-nothing: if any worker fails to become ready the
    /// others are stopped, the lease is released, and nothing is returned.
    ///
    /// # Errors
    /// Returns [`PoolError::PoolStartupFailed`].
    pub(crate) async fn create(
        key: PoolKey,
        config: &Config,
        lease: Option<EnvironmentLease>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Result<Self, PoolError> {
        let size = config.parallel_workers();
        let environment = lease.as_ref().map(|lease| lease.environment().clone());
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();

        let mut starting = JoinSet::new();
        for slot in 0..size {
            let worker_config = config.worker().clone();
            let environment = environment.clone();
            let key = key.clone();
            let exits = exits_tx.clone();
            starting.spawn(async move {
                let spec = WorkerSpec {
                    config: &worker_config,
                    environment: environment.as_ref(),
                    pool: &key,
                    slot,
                    generation: 0,
                };
                Worker::start(spec, exits).await
            });
        }

        let mut started = Vec::with_capacity(size);
        let mut failure: Option<String> = None;
        while let Some(joined) = starting.join_next().await {
            match joined {
                Ok(Ok(worker)) => started.push(worker),
                Ok(Err(err)) => {
                    failure.get_or_insert_with(|| err.to_string());
                }
                Err(err) => {
                    failure.get_or_insert_with(|| format!("worker startup task failed: {err}"));
                }
            }
        }
        if let Some(reason) = failure {
            warn!(pool = %key, %reason, "tearing down partially started pool");
            for worker in &started {
                worker.stop().await;
            }
            if let Some(lease) = lease {
                release_lease(lease).await?;
            }
            return Err(PoolError::PoolStartupFailed {
                key: key.to_string(),
                reason,
            });
        }

        started.sort_by_key(|worker| worker.slot());
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let mut slots = Vec::with_capacity(size);
        for worker in started {
            let _ = idle_tx.send((worker.slot(), worker.generation()));
            let _ = events.send(WorkerEvent::Started {
                pool: key.clone(),
                slot: worker.slot(),
                pid: worker.pid(),
            });
            slots.push(Slot {
                worker: Some(worker),
                ..Slot::default()
            });
        }

        let (wake, _) = watch::channel(0);
        let inner = Arc::new(PoolInner {
            key,
            size,
            config: config.clone(),
            environment,
            lease: Mutex::new(lease),
            slots: Mutex::new(slots),
            models: Mutex::new(BTreeMap::new()),
            model_ops: tokio::sync::Mutex::new(()),
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            admission: Semaphore::new(size + config.queue_depth()),
            exits_tx,
            events,
            wake,
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), exits_rx));
        info!(pool = %inner.key, size, "pool ready");
        Ok(Self { inner })
    }

    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.inner.key
    }

    /// Configured worker count; never changes for the pool's lifetime.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    #[must_use]
    pub fn environment(&self) -> Option<&Environment> {
        self.inner.environment.as_ref()
    }

    /// Live workers keyed by process id.
    #[must_use]
    pub fn workers(&self) -> BTreeMap<u32, Arc<Worker>> {
        self.inner
            .lock_slots()
            .iter()
            .filter_map(|slot| slot.worker.as_ref())
            .filter(|worker| worker.is_alive())
            .map(|worker| (worker.pid(), Arc::clone(worker)))
            .collect()
    }

    /// Number of distinct models bound to this pool.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.inner.lock_models().len()
    }

    #[must_use]
    pub fn models(&self) -> Vec<ModelSettings> {
        self.inner.lock_models().values().cloned().collect()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Binds a model: every live worker loads it. Binding a model id that
    /// is already bound replaces its settings without changing the refcount.
    ///
    /// # Errors
    /// Returns [`PoolError::Inference`] when a worker rejects the model; the
    /// workers that accepted it are told to unload it again. Returns
    /// [`PoolError::WorkerUnavailable`] when no live worker took it.
    pub async fn load_model(&self, settings: &ModelSettings) -> Result<(), PoolError> {
        let _ops = self.inner.model_ops.lock().await;
        self.ensure_running()?;
        let mut loaded: Vec<Arc<Worker>> = Vec::new();
        for worker in self.workers().into_values() {
            let command = WorkerCommand::LoadModel {
                settings: settings.clone(),
            };
            match worker.dispatch(command).await {
                Ok(WorkerPayload::Error { message }) => {
                    for worker in loaded {
                        unload_from(&worker, settings).await;
                    }
                    return Err(PoolError::Inference {
                        model: settings.model_id(),
                        message,
                    });
                }
                Ok(_) => loaded.push(worker),
                // A replacement replays the model once it is ready.
                Err(err) => debug!(pool = %self.inner.key, %err, "skipping dead worker"),
            }
        }
        if loaded.is_empty() {
            warn!(pool = %self.inner.key, model = %settings.model_id(), "no live worker accepted the model");
            return Err(PoolError::WorkerUnavailable {
                key: self.inner.key.to_string(),
            });
        }
        let previous = self
            .inner
            .lock_models()
            .insert(settings.model_id(), settings.clone());
        debug!(
            pool = %self.inner.key,
            model = %settings.model_id(),
            replaced = previous.is_some(),
            "model bound"
        );
        Ok(())
    }

    /// Unbinds a model and tells every live worker to unload it.
    ///
    /// # Errors
    /// Returns [`PoolError::RefcountUnderflow`] when the model is not bound.
    pub async fn unload_model(&self, settings: &ModelSettings) -> Result<(), PoolError> {
        let _ops = self.inner.model_ops.lock().await;
        let model_id = settings.model_id();
        if self.inner.lock_models().remove(&model_id).is_none() {
            return Err(PoolError::underflow(format!(
                "model {model_id} in pool {}",
                self.inner.key
            )));
        }
        if !self.is_stopped() {
            for worker in self.workers().into_values() {
                unload_from(&worker, settings).await;
            }
        }
        debug!(pool = %self.inner.key, model = %model_id, "model unbound");
        Ok(())
    }

    /// Routes one command to an idle worker, retrying on another worker when
    /// the chosen one turns out to be dead or unresponsive.
    ///
    /// # Errors
    /// Returns [`PoolError::QueueFull`] when too many requests are already
    /// waiting, [`PoolError::PoolStopped`] after `stop`, and
    /// [`PoolError::WorkerUnavailable`] once every attempt has failed.
    pub async fn dispatch(&self, command: WorkerCommand) -> Result<WorkerPayload, PoolError> {
        let inner = &self.inner;
        let _admitted = inner
            .admission
            .try_acquire()
            .map_err(|_| PoolError::QueueFull {
                key: inner.key.to_string(),
                depth: inner.config.queue_depth(),
            })?;

        let mut attempts = 0;
        loop {
            let worker = inner.next_idle().await?;
            attempts += 1;
            match worker.dispatch(command.clone()).await {
                Ok(payload) => {
                    inner.return_idle(&worker);
                    return Ok(payload);
                }
                Err(err) if attempts <= inner.size => {
                    debug!(pool = %inner.key, pid = worker.pid(), %err, attempts, "retrying on another worker");
                }
                Err(err) => {
                    warn!(pool = %inner.key, %err, attempts, "no worker could serve the request");
                    return Err(PoolError::WorkerUnavailable {
                        key: inner.key.to_string(),
                    });
                }
            }
        }
    }

    /// Runs a prediction for a bound model.
    ///
    /// # Errors
    /// Dispatch errors, plus [`PoolError::Inference`] when the model itself
    /// reports a failure.
    pub async fn predict(&self, settings: &ModelSettings, payload: Value) -> Result<Value, PoolError> {
        let command = WorkerCommand::Predict {
            name: settings.name.clone(),
            version: settings.parameters.version.clone(),
            payload,
        };
        match self.dispatch(command).await? {
            WorkerPayload::Prediction { outputs, .. } => Ok(outputs),
            WorkerPayload::Error { message } => Err(PoolError::Inference {
                model: settings.model_id(),
                message,
            }),
            other => Err(PoolError::Inference {
                model: settings.model_id(),
                message: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Gracefully stops every worker and releases the environment lease.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    /// Propagates [`PoolError::RefcountUnderflow`] from the environment store.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.wake.send_modify(|epoch| *epoch += 1);
        let workers: Vec<Arc<Worker>> = inner
            .lock_slots()
            .iter_mut()
            .filter_map(|slot| slot.worker.take())
            .collect();
        let mut stopping = JoinSet::new();
        for worker in workers {
            stopping.spawn(async move { worker.stop().await });
        }
        while stopping.join_next().await.is_some() {}
        info!(pool = %inner.key, "pool stopped");

        let lease = inner
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match lease {
            Some(lease) => release_lease(lease).await,
            None => Ok(()),
        }
    }

    /// Polls until the pool has `size` live workers again or `within`
    /// elapses.
    pub async fn wait_until_full(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if self.workers().len() == self.size() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    fn ensure_running(&self) -> Result<(), PoolError> {
        if self.is_stopped() {
            return Err(PoolError::PoolStopped {
                key: self.inner.key.to_string(),
            });
        }
        Ok(())
    }
}

impl PoolInner {
    fn lock_slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_models(&self) -> MutexGuard<'_, BTreeMap<String, ModelSettings>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn worker_for(&self, (slot, generation): IdleToken) -> Option<Arc<Worker>> {
        let slots = self.lock_slots();
        let slot = slots.get(slot)?;
        if slot.generation != generation {
            return None;
        }
        slot.worker.as_ref().filter(|worker| worker.is_alive()).cloned()
    }

    fn all_slots_failed(&self) -> bool {
        self.lock_slots().iter().all(|slot| slot.failed)
    }

    /// Waits for the next idle live worker. Waiters are served in arrival
    /// order; the wait is bounded by the dispatch timeout.
    async fn next_idle(&self) -> Result<Arc<Worker>, PoolError> {
        let deadline = Instant::now() + self.config.worker().dispatch_timeout;
        let mut wake = self.wake.subscribe();
        let mut idle = self.idle_rx.lock().await;
        loop {
            if self.is_stopped() {
                return Err(PoolError::PoolStopped {
                    key: self.key.to_string(),
                });
            }
            if self.all_slots_failed() {
                return Err(PoolError::WorkerUnavailable {
                    key: self.key.to_string(),
                });
            }
            tokio::select! {
                token = idle.recv() => match token {
                    Some(token) => {
                        if let Some(worker) = self.worker_for(token) {
                            return Ok(worker);
                        }
                    }
                    None => {
                        return Err(PoolError::PoolStopped {
                            key: self.key.to_string(),
                        })
                    }
                },
                changed = wake.changed() => {
                    if changed.is_err() {
                        return Err(PoolError::PoolStopped {
                            key: self.key.to_string(),
                        });
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::WorkerUnavailable {
                        key: self.key.to_string(),
                    });
                }
            }
        }
    }

    fn return_idle(&self, worker: &Worker) {
        if worker.is_alive() && !self.is_stopped() {
            let _ = self.idle_tx.send((worker.slot(), worker.generation()));
        }
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_exit(self: Arc<Self>, exit: WorkerExit) {
        self.emit(WorkerEvent::Exited {
            pool: self.key.clone(),
            slot: exit.slot,
            pid: exit.pid,
            cause: exit.cause.clone(),
            expected: exit.expected,
        });
        if exit.expected || self.is_stopped() {
            debug!(pool = %self.key, slot = exit.slot, pid = exit.pid, "worker exited");
            return;
        }
        warn!(
            pool = %self.key,
            slot = exit.slot,
            pid = exit.pid,
            cause = %exit.cause,
            "worker with PID {} exited unexpectedly",
            exit.pid
        );

        let policy = *self.config.respawn();
        let mut failures = {
            let mut slots = self.lock_slots();
            let Some(slot) = slots.get_mut(exit.slot) else {
                return;
            };
            if slot.generation != exit.generation {
                return;
            }
            slot.worker = None;
            if exit.uptime >= policy.stable_after {
                slot.failures = 0;
            }
            slot.failures += 1;
            slot.failures
        };

        loop {
            if failures > policy.max_consecutive_failures {
                self.fail_slot(exit.slot, failures, &exit.cause);
                return;
            }
            sleep(policy.delay_for(failures)).await;
            if self.is_stopped() {
                return;
            }
            match self.respawn(exit.slot, exit.pid).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(pool = %self.key, slot = exit.slot, %err, "respawn failed");
                    failures = {
                        let mut slots = self.lock_slots();
                        let Some(slot) = slots.get_mut(exit.slot) else {
                            return;
                        };
                        slot.failures += 1;
                        slot.failures
                    };
                }
            }
        }
    }

    async fn respawn(self: &Arc<Self>, slot: usize, old_pid: u32) -> Result<(), WorkerError> {
        let generation = {
            let mut slots = self.lock_slots();
            let Some(entry) = slots.get_mut(slot) else {
                return Ok(());
            };
            entry.generation += 1;
            entry.generation
        };
        let spec = WorkerSpec {
            config: self.config.worker(),
            environment: self.environment.as_ref(),
            pool: &self.key,
            slot,
            generation,
        };
        let worker = Worker::start(spec, self.exits_tx.clone()).await?;

        let _ops = self.model_ops.lock().await;
        let models: Vec<ModelSettings> = self.lock_models().values().cloned().collect();
        for settings in models {
            let model = settings.model_id();
            match worker.dispatch(WorkerCommand::LoadModel { settings }).await {
                Ok(WorkerPayload::Error { message }) => {
                    warn!(pool = %self.key, pid = worker.pid(), %model, %message, "replay rejected");
                }
                Ok(_) => {}
                // The dispatch killed the worker; its exit drives the next attempt.
                Err(err) => {
                    warn!(pool = %self.key, pid = worker.pid(), %err, "replacement died during replay");
                    return Ok(());
                }
            }
        }
        let installed = {
            let mut slots = self.lock_slots();
            match slots.get_mut(slot) {
                Some(entry) if !self.is_stopped() => {
                    entry.worker = Some(Arc::clone(&worker));
                    true
                }
                _ => false,
            }
        };
        if !installed {
            worker.stop().await;
            return Ok(());
        }
        let _ = self.idle_tx.send((slot, generation));
        info!(
            pool = %self.key,
            slot,
            pid = worker.pid(),
            "replaced worker with PID {old_pid} by PID {}",
            worker.pid()
        );
        self.emit(WorkerEvent::Respawned {
            pool: self.key.clone(),
            slot,
            old_pid,
            pid: worker.pid(),
        });
        Ok(())
    }

    fn fail_slot(&self, slot: usize, failures: u32, cause: &str) {
        if let Some(entry) = self.lock_slots().get_mut(slot) {
            entry.failed = true;
        }
        error!(
            pool = %self.key,
            slot,
            failures,
            "slot keeps crashing; giving up on respawns"
        );
        self.emit(WorkerEvent::SlotFailed {
            pool: self.key.clone(),
            slot,
            failures,
            reason: cause.to_string(),
        });
        self.wake.send_modify(|epoch| *epoch += 1);
    }
}

/// Releases a lease off the async workers; the last release deletes the
/// environment directory.
async fn release_lease(lease: EnvironmentLease) -> Result<(), PoolError> {
    match tokio::task::spawn_blocking(move || lease.release()).await {
        Ok(released) => released,
        Err(err) => {
            error!(%err, "environment release task failed");
            Ok(())
        }
    }
}

async fn unload_from(worker: &Worker, settings: &ModelSettings) {
    let command = WorkerCommand::UnloadModel {
        name: settings.name.clone(),
        version: settings.parameters.version.clone(),
    };
    match worker.dispatch(command).await {
        Ok(WorkerPayload::Error { message }) => {
            warn!(pid = worker.pid(), model = %settings.model_id(), %message, "unload rejected");
        }
        Ok(_) => {}
        Err(err) => debug!(pid = worker.pid(), %err, "skipping dead worker"),
    }
}

async fn supervise(pool: Weak<PoolInner>, mut exits: mpsc::UnboundedReceiver<WorkerExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        tokio::spawn(inner.handle_exit(exit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_program(dir: &std::path::Path, program: &str, args: &[&str]) -> Config {
        Config::new(dir.join("envs"), program)
            .with_worker_args(args.iter().map(|arg| (*arg).to_string()).collect())
            .with_parallel_workers(2)
            .with_startup_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn startup_is_all_or_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_with_program(temp.path(), "sh", &["-c", "exit 3"]);
        let (events, _) = broadcast::channel(16);
        let err = WorkerPool::create(PoolKey::Default, &config, None, events)
            .await
            .expect_err("workers never become ready");
        assert!(matches!(err, PoolError::PoolStartupFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn silent_worker_hits_startup_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_with_program(temp.path(), "sh", &["-c", "sleep 5"]);
        let (events, _) = broadcast::channel(16);
        let started = Instant::now();
        let err = WorkerPool::create(PoolKey::Default, &config, None, events)
            .await
            .expect_err("startup timeout");
        assert!(matches!(err, PoolError::PoolStartupFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn failed_startup_releases_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_with_program(temp.path(), "sh", &["-c", "exit 1"]);
        let store = crate::env::EnvironmentStore::new(temp.path().join("envs"));
        let archive = crate::env::testing::write_tarball(temp.path(), "env.tar.gz", &[("VERSION", "1\n")]);
        let source = crate::env::EnvironmentSource::Archive(archive);
        let hash = crate::env::EnvironmentStore::hash_of(&source).await.expect("hash");
        let lease = store.ensure(&source, &hash).await.expect("ensure");
        let (events, _) = broadcast::channel(16);

        let key = PoolKey::derive(Some(&hash), None);
        assert!(WorkerPool::create(key, &config, Some(lease), events).await.is_err());
        assert_eq!(store.refcount(&hash), 0);
        assert!(!store.env_path(&hash).exists());
    }
}
