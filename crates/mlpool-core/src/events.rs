use std::time::Duration;

use mlpool_domain::PoolKey;

/// Lifecycle notifications for the workers of every pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started {
        pool: PoolKey,
        slot: usize,
        pid: u32,
    },
    Exited {
        pool: PoolKey,
        slot: usize,
        pid: u32,
        cause: String,
        /// `true` when the exit was requested by `stop`.
        expected: bool,
    },
    Respawned {
        pool: PoolKey,
        slot: usize,
        old_pid: u32,
        pid: u32,
    },
    SlotFailed {
        pool: PoolKey,
        slot: usize,
        failures: u32,
        reason: String,
    },
}

impl WorkerEvent {
    #[must_use]
    pub fn pool(&self) -> &PoolKey {
        match self {
            Self::Started { pool, .. }
            | Self::Exited { pool, .. }
            | Self::Respawned { pool, .. }
            | Self::SlotFailed { pool, .. } => pool,
        }
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Started { pid, .. } | Self::Exited { pid, .. } | Self::Respawned { pid, .. } => {
                Some(*pid)
            }
            Self::SlotFailed { .. } => None,
        }
    }
}

/// Sent by a worker's exit monitor to its owning pool.
#[derive(Debug, Clone)]
pub(crate) struct WorkerExit {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
    pub(crate) pid: u32,
    pub(crate) cause: String,
    pub(crate) expected: bool,
    pub(crate) uptime: Duration,
}
