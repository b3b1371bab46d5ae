//! Typed failures surfaced by the orchestration layer.

pub mod codes {
    pub const EXTRACTION_FAILED: &str = "MP101";
    pub const ARCHIVE_UNREADABLE: &str = "MP102";
    pub const WORKER_STARTUP: &str = "MP201";
    pub const POOL_STARTUP_FAILED: &str = "MP301";
    pub const WORKER_UNAVAILABLE: &str = "MP302";
    pub const QUEUE_FULL: &str = "MP303";
    pub const POOL_STOPPED: &str = "MP304";
    pub const INFERENCE: &str = "MP305";
    pub const ENVIRONMENT_NOT_FOUND: &str = "MP401";
    pub const MODEL_NOT_LOADED: &str = "MP402";
    pub const CONFIG: &str = "MP501";
    pub const REFCOUNT_UNDERFLOW: &str = "MP900";
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("[MP401] no pool is registered for environment key '{key}'")]
    EnvironmentNotFound { key: String },
    #[error("[MP402] model '{model}' is not loaded")]
    ModelNotLoaded { model: String },
    #[error("[MP101] failed to materialize environment {hash}: {reason}")]
    ExtractionFailed { hash: String, reason: String },
    #[error("[MP102] cannot read environment source {path}: {reason}")]
    ArchiveUnreadable { path: String, reason: String },
    #[error("[MP301] pool '{key}' failed to start: {reason}")]
    PoolStartupFailed { key: String, reason: String },
    #[error("[MP302] no worker in pool '{key}' is available")]
    WorkerUnavailable { key: String },
    #[error("[MP303] pool '{key}' has {depth} requests waiting; rejecting more")]
    QueueFull { key: String, depth: usize },
    #[error("[MP304] pool '{key}' has been stopped")]
    PoolStopped { key: String },
    #[error("[MP305] model '{model}' returned an error: {message}")]
    Inference { model: String, message: String },
    #[error("[MP900] reference count underflow on {resource}")]
    RefcountUnderflow { resource: String },
    #[error("[MP501] invalid configuration: {message}")]
    Config { message: String },
}

impl PoolError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn underflow(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        tracing::error!(%resource, "reference count underflow; a binding was released twice");
        Self::RefcountUnderflow { resource }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EnvironmentNotFound { .. } => codes::ENVIRONMENT_NOT_FOUND,
            Self::ModelNotLoaded { .. } => codes::MODEL_NOT_LOADED,
            Self::ExtractionFailed { .. } => codes::EXTRACTION_FAILED,
            Self::ArchiveUnreadable { .. } => codes::ARCHIVE_UNREADABLE,
            Self::PoolStartupFailed { .. } => codes::POOL_STARTUP_FAILED,
            Self::WorkerUnavailable { .. } => codes::WORKER_UNAVAILABLE,
            Self::QueueFull { .. } => codes::QUEUE_FULL,
            Self::PoolStopped { .. } => codes::POOL_STOPPED,
            Self::Inference { .. } => codes::INFERENCE,
            Self::RefcountUnderflow { .. } => codes::REFCOUNT_UNDERFLOW,
            Self::Config { .. } => codes::CONFIG,
        }
    }

    /// Caller mistakes as opposed to runtime failures.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::ModelNotLoaded { .. }
                | Self::ArchiveUnreadable { .. }
                | Self::Inference { .. }
                | Self::Config { .. }
        )
    }
}

/// Failures of a single worker process. Absorbed by the pool where possible.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("[MP201] worker failed to start: {0}")]
    Startup(String),
    #[error("worker {pid} is not alive")]
    Dead { pid: u32 },
    #[error("worker {pid} did not answer within {timeout_ms}ms")]
    TimedOut { pid: u32, timeout_ms: u128 },
    #[error("worker {pid} broke protocol: {reason}")]
    Protocol { pid: u32, reason: String },
}
