//! Content-addressed, reference-counted execution environments.

mod archive;
mod store;

pub use archive::{hash_of_file, hash_of_path_identity};
pub use store::{Environment, EnvironmentLease, EnvironmentSource, EnvironmentStore};

/// Environment variable naming the environment directory a worker runs in.
pub const ENVIRONMENT_VAR: &str = "MLPOOL_ENVIRONMENT";
