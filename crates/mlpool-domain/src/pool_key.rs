use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PoolKey {
    /// Shared pool for models with no environment and no group id.
    Default,
    /// Isolated pool in the ambient context, selected by group id only.
    Group { gid: String },
    /// Pool bound to a materialized environment.
    Environment { hash: String, gid: Option<String> },
}

impl PoolKey {
    /// Derives the key for an environment hash (if any) and group id (if any).
    pub fn derive(hash: Option<&str>, gid: Option<&str>) -> Self {
        match (hash, gid) {
            (None, None) => Self::Default,
            (None, Some(gid)) => Self::Group {
                gid: gid.to_string(),
            },
            (Some(hash), gid) => Self::Environment {
                hash: hash.to_string(),
                gid: gid.map(ToOwned::to_owned),
            },
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }

    /// Content hash of the environment this key depends on.
    pub fn environment_hash(&self) -> Option<&str> {
        match self {
            Self::Environment { hash, .. } => Some(hash),
            _ => None,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Group { gid } => f.write_str(gid),
            Self::Environment { hash, gid } => f.write_str(&append_gid(hash, gid.as_deref())),
        }
    }
}

/// Suffixes an environment hash with a group id: `hash-gid`.
pub fn append_gid(hash: &str, gid: Option<&str>) -> String {
    match gid {
        Some(gid) => format!("{hash}-{gid}"),
        None => hash.to_string(),
    }
}
