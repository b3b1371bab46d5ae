use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::archive::{hash_of_file, hash_of_path_identity, materialize_archive, STAGING_PREFIX};
use super::ENVIRONMENT_VAR;
use crate::error::PoolError;

/// Where an environment's contents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentSource {
    /// Archive extracted into `<root>/<hash>` and removed on last release.
    Archive(PathBuf),
    /// Directory materialized elsewhere; used in place and never removed.
    Existing(PathBuf),
}

impl EnvironmentSource {
    fn describe(&self) -> String {
        match self {
            Self::Archive(path) | Self::Existing(path) => path.display().to_string(),
        }
    }
}

/// One isolated execution context materialized on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    hash: String,
    path: PathBuf,
}

impl Environment {
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.path.join("bin")
    }

    /// Variables a worker process is launched with to run inside this
    /// environment.
    #[must_use]
    pub fn activation_vars(&self) -> Vec<(String, String)> {
        let mut path_entries = vec![self.bin_dir()];
        if let Some(current) = std::env::var_os("PATH") {
            path_entries.extend(std::env::split_paths(&current));
        }
        let joined = std::env::join_paths(path_entries)
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_else(|_| self.bin_dir().display().to_string());
        vec![
            (
                ENVIRONMENT_VAR.to_string(),
                self.path.display().to_string(),
            ),
            ("PATH".to_string(), joined),
        ]
    }
}

struct Entry {
    refcount: usize,
    environment: Option<Environment>,
    owned: bool,
    /// Serializes materialization of one hash; concurrent `ensure` calls
    /// wait here for the in-flight extraction.
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    fn new(owned: bool) -> Self {
        Self {
            refcount: 0,
            environment: None,
            owned,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Content-addressed cache of extracted environments under `<root>/<hash>`.
pub struct EnvironmentStore {
    root: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for EnvironmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl EnvironmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            entries: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn env_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Content hash of a source: SHA-256 of the archive bytes, or of the
    /// canonical path for an existing directory.
    ///
    /// # Errors
    /// Returns [`PoolError::ArchiveUnreadable`] when the source cannot be read.
    pub async fn hash_of(source: &EnvironmentSource) -> Result<String, PoolError> {
        let owned = source.clone();
        let described = source.describe();
        tokio::task::spawn_blocking(move || match &owned {
            EnvironmentSource::Archive(path) => hash_of_file(path),
            EnvironmentSource::Existing(path) => hash_of_path_identity(path),
        })
        .await
        .map_err(|err| PoolError::ArchiveUnreadable {
            path: described.clone(),
            reason: err.to_string(),
        })?
        .map_err(|err| PoolError::ArchiveUnreadable {
            path: described,
            reason: format!("{err:#}"),
        })
    }

    /// Materializes (or reuses) the environment for `hash` and takes a
    /// reference on it.
    ///
    /// Concurrent callers for the same hash share a single extraction.
    ///
    /// # Errors
    /// Returns [`PoolError::ExtractionFailed`] when the archive cannot be
    /// unpacked; no directory is left behind in that case.
    pub async fn ensure(
        self: &Arc<Self>,
        source: &EnvironmentSource,
        hash: &str,
    ) -> Result<EnvironmentLease, PoolError> {
        let owned = matches!(source, EnvironmentSource::Archive(_));
        let gate = {
            let mut entries = self.lock_entries();
            let entry = entries
                .entry(hash.to_string())
                .or_insert_with(|| Entry::new(owned));
            if let Some(environment) = Self::acquire_live(entry) {
                return Ok(self.lease(environment));
            }
            Arc::clone(&entry.gate)
        };

        let _in_flight = gate.lock().await;
        {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.get_mut(hash) {
                if let Some(environment) = Self::acquire_live(entry) {
                    debug!(%hash, "environment materialized by a concurrent caller");
                    return Ok(self.lease(environment));
                }
            }
        }

        let path = match source {
            EnvironmentSource::Existing(path) => path.clone(),
            EnvironmentSource::Archive(archive) => {
                let root = self.env_path(hash);
                if root.is_dir() {
                    debug!(%hash, path = %root.display(), "reusing environment left on disk");
                } else {
                    info!(%hash, archive = %archive.display(), "extracting environment");
                    let archive = archive.clone();
                    let target = root.clone();
                    tokio::task::spawn_blocking(move || materialize_archive(&archive, &target))
                        .await
                        .map_err(|err| PoolError::ExtractionFailed {
                            hash: hash.to_string(),
                            reason: err.to_string(),
                        })?
                        .map_err(|err| PoolError::ExtractionFailed {
                            hash: hash.to_string(),
                            reason: format!("{err:#}"),
                        })?;
                }
                root
            }
        };

        let environment = Environment {
            hash: hash.to_string(),
            path,
        };
        let mut entries = self.lock_entries();
        let entry = entries
            .entry(hash.to_string())
            .or_insert_with(|| Entry::new(owned));
        entry.owned = owned;
        entry.refcount = 1;
        entry.environment = Some(environment.clone());
        Ok(self.lease(environment))
    }

    /// Drops one reference on `hash`, removing its directory from disk when
    /// the last reference goes away. Under the entry lock the directory is
    /// only renamed out of `<root>`; the recursive delete runs after.
    ///
    /// # Errors
    /// Returns [`PoolError::RefcountUnderflow`] for an unknown hash or when
    /// every reference has already been released.
    pub fn release(&self, hash: &str) -> Result<(), PoolError> {
        let detached = {
            let mut entries = self.lock_entries();
            let Some(entry) = entries.get_mut(hash) else {
                return Err(PoolError::underflow(format!("environment {hash}")));
            };
            if entry.refcount == 0 {
                return Err(PoolError::underflow(format!("environment {hash}")));
            }
            entry.refcount -= 1;
            if entry.refcount > 0 {
                return Ok(());
            }
            match (entry.owned, entry.environment.take()) {
                (true, Some(environment)) => self.detach(hash, &environment.path),
                _ => None,
            }
        };
        if let Some(detached) = detached {
            info!(%hash, "removing environment");
            if let Err(err) = detached.close() {
                warn!(%hash, %err, "failed to remove environment directory");
            }
        }
        Ok(())
    }

    /// Moves an environment directory into a fresh staging directory so a
    /// concurrent `ensure` never reuses a directory that is being deleted.
    fn detach(&self, hash: &str, path: &Path) -> Option<TempDir> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root);
        let moved = staging.and_then(|staging| {
            fs::rename(path, staging.path().join(hash))?;
            Ok(staging)
        });
        match moved {
            Ok(staging) => Some(staging),
            Err(err) => {
                debug!(%hash, %err, "could not detach environment, removing in place");
                if let Err(err) = fs::remove_dir_all(path) {
                    warn!(%hash, %err, "failed to remove environment directory");
                }
                None
            }
        }
    }

    #[must_use]
    pub fn refcount(&self, hash: &str) -> usize {
        self.lock_entries()
            .get(hash)
            .map_or(0, |entry| entry.refcount)
    }

    fn acquire_live(entry: &mut Entry) -> Option<Environment> {
        if entry.refcount == 0 {
            return None;
        }
        let environment = entry.environment.clone()?;
        entry.refcount += 1;
        Some(environment)
    }

    fn lease(self: &Arc<Self>, environment: Environment) -> EnvironmentLease {
        EnvironmentLease {
            store: Arc::clone(self),
            environment,
            released: false,
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One counted reference on an environment. Released explicitly, or on drop
/// if the holder bails out early.
#[derive(Debug)]
pub struct EnvironmentLease {
    store: Arc<EnvironmentStore>,
    environment: Environment,
    released: bool,
}

impl EnvironmentLease {
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// # Errors
    /// Propagates [`PoolError::RefcountUnderflow`] from the store.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.released = true;
        self.store.release(&self.environment.hash)
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.store.release(&self.environment.hash) {
            warn!(%err, "environment lease dropped after its store entry was released");
        }
    }
}
