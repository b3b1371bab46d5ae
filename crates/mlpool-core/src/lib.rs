#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod pool;
pub mod registry;
pub mod worker;

pub use crate::config::{Config, RespawnPolicy, WorkerConfig};
pub use crate::env::{
    Environment, EnvironmentLease, EnvironmentSource, EnvironmentStore, ENVIRONMENT_VAR,
};
pub use crate::error::{PoolError, WorkerError};
pub use crate::events::WorkerEvent;
pub use crate::pool::WorkerPool;
pub use crate::registry::{Model, PoolRegistry};
pub use crate::worker::{Worker, WorkerState};

pub use mlpool_domain::{append_gid, ModelParameters, ModelSettings, PoolKey};
