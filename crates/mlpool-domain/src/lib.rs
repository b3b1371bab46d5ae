#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod pool_key;
pub mod protocol;
pub mod settings;

pub use pool_key::{append_gid, PoolKey};
pub use protocol::{WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse, READY_ID};
pub use settings::{ModelParameters, ModelSettings};
