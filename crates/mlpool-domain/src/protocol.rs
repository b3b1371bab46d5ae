//! Orchestrator ↔ worker IPC messages.
//!
//! JSON Lines (one object per line) over the worker's stdin/stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ModelSettings;

/// Id carried by unsolicited worker messages (the readiness signal).
pub const READY_ID: u64 = 0;

/// Request sent to a worker via stdin.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerRequest {
    pub id: u64,
    pub command: WorkerCommand,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    LoadModel {
        settings: ModelSettings,
    },
    UnloadModel {
        name: String,
        version: Option<String>,
    },
    Predict {
        name: String,
        version: Option<String>,
        payload: Value,
    },
    Ping,
    /// Graceful shutdown; no reply is sent.
    Shutdown,
}

/// Reply sent by a worker via stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerResponse {
    pub id: u64,
    pub payload: WorkerPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    Ready {
        pid: u32,
        environment: Option<String>,
    },
    ModelLoaded {
        name: String,
    },
    ModelUnloaded {
        name: String,
    },
    Prediction {
        model_name: String,
        outputs: Value,
    },
    Pong,
    Error {
        message: String,
    },
}

impl WorkerRequest {
    pub fn new(id: u64, command: WorkerCommand) -> Self {
        Self { id, command }
    }

    pub fn predict(id: u64, settings: &ModelSettings, payload: Value) -> Self {
        Self::new(
            id,
            WorkerCommand::Predict {
                name: settings.name.clone(),
                version: settings.parameters.version.clone(),
                payload,
            },
        )
    }
}

impl WorkerResponse {
    pub fn ok(id: u64, payload: WorkerPayload) -> Self {
        Self { id, payload }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: WorkerPayload::Error {
                message: message.into(),
            },
        }
    }

    pub fn ready(pid: u32, environment: Option<String>) -> Self {
        Self::ok(READY_ID, WorkerPayload::Ready { pid, environment })
    }
}
