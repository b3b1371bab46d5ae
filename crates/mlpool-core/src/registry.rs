//! Pool registry: maps models to pools keyed by environment and group id.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use mlpool_domain::{ModelSettings, PoolKey};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::env::{EnvironmentSource, EnvironmentStore};
use crate::error::PoolError;
use crate::events::WorkerEvent;
use crate::pool::WorkerPool;

const EVENT_CAPACITY: usize = 256;

/// A model as loaded by the registry, carrying the pool key it resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    settings: ModelSettings,
    binding: Option<PoolKey>,
}

impl Model {
    #[must_use]
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Key recorded at load time; `None` for a model that was never bound.
    #[must_use]
    pub fn pool_key(&self) -> Option<&PoolKey> {
        self.binding.as_ref()
    }
}

type PoolMap = HashMap<PoolKey, WorkerPool>;

pub struct PoolRegistry {
    config: Config,
    store: Arc<EnvironmentStore>,
    default_pool: WorkerPool,
    /// Serializes load, unload, reload and close. Lookups never take it.
    lifecycle: Mutex<()>,
    /// Running pools; only held for map reads and writes, never across an await.
    pools: RwLock<PoolMap>,
    events: broadcast::Sender<WorkerEvent>,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("store", &self.store)
            .field("default_pool", &self.default_pool)
            .finish_non_exhaustive()
    }
}

impl PoolRegistry {
    /// Starts the registry and its default pool.
    ///
    /// # Errors
    /// Returns [`PoolError::Config`] for an invalid configuration and
    /// [`PoolError::PoolStartupFailed`] when the default pool cannot start.
    pub async fn start(config: Config) -> Result<Self, PoolError> {
        let config = config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = EnvironmentStore::new(config.environments_dir());
        let default_pool =
            WorkerPool::create(PoolKey::Default, &config, None, events.clone()).await?;
        info!(
            workers = config.parallel_workers(),
            environments = %store.root().display(),
            "registry started"
        );
        Ok(Self {
            config,
            store,
            default_pool,
            lifecycle: Mutex::new(()),
            pools: RwLock::new(HashMap::new()),
            events,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<EnvironmentStore> {
        &self.store
    }

    #[must_use]
    pub fn default_pool(&self) -> &WorkerPool {
        &self.default_pool
    }

    /// Worker lifecycle events of every pool, including pools created later.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Number of running pools, the default pool included.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.read_pools().len() + 1
    }

    #[must_use]
    pub fn pool_keys(&self) -> Vec<PoolKey> {
        let mut keys: Vec<PoolKey> = self.read_pools().keys().cloned().collect();
        keys.push(PoolKey::Default);
        keys.sort();
        keys
    }

    /// Resolves the model's pool key, creating its pool (and environment)
    /// when this is the first model for that key, and binds the model.
    ///
    /// # Errors
    /// [`PoolError::ArchiveUnreadable`], [`PoolError::ExtractionFailed`],
    /// [`PoolError::PoolStartupFailed`], or [`PoolError::Inference`] when the
    /// workers reject the model. No binding is created on failure.
    pub async fn load_model(&self, settings: ModelSettings) -> Result<Model, PoolError> {
        let (key, source) = resolve(&settings).await?;
        let _lifecycle = self.lifecycle.lock().await;
        self.bind(&key, source.as_ref(), &settings).await?;
        info!(model = %settings.model_id(), pool = %key, "model loaded");
        Ok(Model {
            settings,
            binding: Some(key),
        })
    }

    /// Unbinds a model; a non-default pool left with no models is stopped
    /// and its environment released.
    ///
    /// # Errors
    /// [`PoolError::ModelNotLoaded`] for a model that was never bound, and
    /// [`PoolError::RefcountUnderflow`] when it was already unloaded.
    pub async fn unload_model(&self, model: &Model) -> Result<(), PoolError> {
        let key = bound_key(model)?;
        let _lifecycle = self.lifecycle.lock().await;
        self.unbind(key, &model.settings).await?;
        info!(model = %model.settings.model_id(), pool = %key, "model unloaded");
        Ok(())
    }

    /// Replaces `old` with `new`. The new binding is live before the old one
    /// is released, so a failure loading `new` leaves `old` serving.
    ///
    /// # Errors
    /// Any error of [`Self::load_model`] (with `old` untouched), or of
    /// [`Self::unload_model`] for `old`.
    pub async fn reload_model(&self, old: &Model, new: ModelSettings) -> Result<Model, PoolError> {
        let old_key = bound_key(old)?;
        let (key, source) = resolve(&new).await?;
        let _lifecycle = self.lifecycle.lock().await;

        self.bind(&key, source.as_ref(), &new).await?;
        // Same key and id: the bind above replaced the settings in place.
        if key != *old_key || new.model_id() != old.settings.model_id() {
            self.unbind(old_key, &old.settings).await?;
        }
        info!(
            old = %old.settings.model_id(),
            new = %new.model_id(),
            pool = %key,
            "model reloaded"
        );
        Ok(Model {
            settings: new,
            binding: Some(key),
        })
    }

    /// The pool a model is bound to. Never waits on a load or unload that is
    /// in progress for another model.
    ///
    /// # Errors
    /// [`PoolError::ModelNotLoaded`] for an unbound model, and
    /// [`PoolError::EnvironmentNotFound`] when its recorded key names no pool.
    pub fn find_pool(&self, model: &Model) -> Result<WorkerPool, PoolError> {
        let key = bound_key(model)?;
        if key.is_default() {
            return Ok(self.default_pool.clone());
        }
        self.read_pools()
            .get(key)
            .cloned()
            .ok_or_else(|| PoolError::EnvironmentNotFound {
                key: key.to_string(),
            })
    }

    /// Dispatches a prediction to the model's pool.
    ///
    /// # Errors
    /// Errors of [`Self::find_pool`] and [`WorkerPool::predict`].
    pub async fn predict(&self, model: &Model, payload: Value) -> Result<Value, PoolError> {
        let pool = self.find_pool(model)?;
        pool.predict(&model.settings, payload).await
    }

    #[must_use]
    pub fn env_path(&self, hash: &str) -> std::path::PathBuf {
        self.store.env_path(hash)
    }

    /// Stops every pool, the default pool last. Idempotent.
    ///
    /// # Errors
    /// Returns the first error raised while releasing an environment; the
    /// remaining pools are still stopped.
    pub async fn close(&self) -> Result<(), PoolError> {
        let _lifecycle = self.lifecycle.lock().await;
        let drained: Vec<WorkerPool> = self
            .write_pools()
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        let mut first_error = None;
        for pool in drained {
            if let Err(err) = pool.stop().await {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.default_pool.stop().await {
            first_error.get_or_insert(err);
        }
        info!("registry closed");
        first_error.map_or(Ok(()), Err)
    }

    fn read_pools(&self) -> RwLockReadGuard<'_, PoolMap> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pools(&self) -> RwLockWriteGuard<'_, PoolMap> {
        self.pools.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds under the lifecycle lock. A new pool is started without holding
    /// the map lock and only published once its first model is loaded.
    async fn bind(
        &self,
        key: &PoolKey,
        source: Option<&EnvironmentSource>,
        settings: &ModelSettings,
    ) -> Result<(), PoolError> {
        if key.is_default() {
            return self.default_pool.load_model(settings).await;
        }
        let existing = self.read_pools().get(key).cloned();
        if let Some(pool) = existing {
            return pool.load_model(settings).await;
        }

        let lease = match (source, key.environment_hash()) {
            (Some(source), Some(hash)) => Some(self.store.ensure(source, hash).await?),
            _ => None,
        };
        let pool =
            WorkerPool::create(key.clone(), &self.config, lease, self.events.clone()).await?;
        if let Err(err) = pool.load_model(settings).await {
            if let Err(stop_err) = pool.stop().await {
                warn!(pool = %key, err = %stop_err, "failed to tear down pool after a failed load");
            }
            return Err(err);
        }
        debug!(pool = %key, "pool created");
        self.write_pools().insert(key.clone(), pool);
        Ok(())
    }

    async fn unbind(&self, key: &PoolKey, settings: &ModelSettings) -> Result<(), PoolError> {
        if key.is_default() {
            return self.default_pool.unload_model(settings).await;
        }
        let existing = self.read_pools().get(key).cloned();
        let Some(pool) = existing else {
            return Err(PoolError::underflow(format!(
                "pool {key} for model {}",
                settings.model_id()
            )));
        };
        pool.unload_model(settings).await?;
        if pool.refcount() == 0 {
            self.write_pools().remove(key);
            pool.stop().await?;
            debug!(pool = %key, "pool torn down");
        }
        Ok(())
    }
}

fn bound_key(model: &Model) -> Result<&PoolKey, PoolError> {
    model
        .binding
        .as_ref()
        .ok_or_else(|| PoolError::ModelNotLoaded {
            model: model.settings.model_id(),
        })
}

/// Environment source and pool key a model's settings resolve to.
async fn resolve(
    settings: &ModelSettings,
) -> Result<(PoolKey, Option<EnvironmentSource>), PoolError> {
    let params = &settings.parameters;
    let source = match (&params.environment_path, &params.environment_tarball) {
        (Some(path), _) => Some(EnvironmentSource::Existing(path.clone())),
        (None, Some(tarball)) => Some(EnvironmentSource::Archive(tarball.clone())),
        (None, None) => None,
    };
    let hash = match &source {
        Some(source) => Some(EnvironmentStore::hash_of(source).await?),
        None => None,
    };
    Ok((PoolKey::derive(hash.as_deref(), settings.gid()), source))
}
