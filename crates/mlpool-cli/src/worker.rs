//! The worker side of the pool protocol.
//!
//! Reads one JSON request per line from stdin and answers on stdout. Models
//! are resolved to a handful of built-in runtimes by their `implementation`.

use std::{
    collections::HashMap,
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use mlpool_core::ENVIRONMENT_VAR;
use mlpool_domain::{ModelSettings, WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Runtime {
    Sum,
    Echo,
    Environment,
    Sleep,
}

impl Runtime {
    fn resolve(implementation: &str) -> Option<Self> {
        match implementation {
            "sum" => Some(Self::Sum),
            "echo" => Some(Self::Echo),
            "environment" => Some(Self::Environment),
            "sleep" => Some(Self::Sleep),
            _ => None,
        }
    }

    fn predict(self, environment: Option<&PathBuf>, payload: Value) -> Result<Value> {
        match self {
            Self::Sum => {
                let inputs = payload
                    .get("inputs")
                    .and_then(Value::as_array)
                    .ok_or_else(|| anyhow!("payload needs an `inputs` array"))?;
                let mut total = 0.0;
                for input in inputs {
                    total += input
                        .as_f64()
                        .ok_or_else(|| anyhow!("non-numeric input {input}"))?;
                }
                Ok(json!({ "total": total }))
            }
            Self::Echo => Ok(payload),
            Self::Environment => {
                let dir = environment
                    .cloned()
                    .ok_or_else(|| anyhow!("worker is not running inside an environment"))?;
                let version_file = dir.join("VERSION");
                let version = fs::read_to_string(&version_file)
                    .with_context(|| format!("failed to read {}", version_file.display()))?;
                Ok(json!({
                    "version": version.trim(),
                    "environment": dir.display().to_string(),
                }))
            }
            Self::Sleep => {
                let millis = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
                thread::sleep(Duration::from_millis(millis));
                Ok(payload)
            }
        }
    }
}

struct LoadedModel {
    settings: ModelSettings,
    runtime: Runtime,
}

pub struct WorkerLoop {
    environment: Option<PathBuf>,
    models: HashMap<String, LoadedModel>,
}

impl WorkerLoop {
    pub fn from_env() -> Self {
        Self {
            environment: std::env::var_os(ENVIRONMENT_VAR).map(PathBuf::from),
            models: HashMap::new(),
        }
    }

    /// Announces readiness and serves requests until stdin closes or a
    /// shutdown request arrives.
    pub fn run(mut self) -> Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout().lock();
        let ready = WorkerResponse::ready(
            std::process::id(),
            self.environment
                .as_ref()
                .map(|path| path.display().to_string()),
        );
        write_line(&mut stdout, &ready)?;
        info!(pid = std::process::id(), "worker ready");

        for line in stdin.lock().lines() {
            let line = line.context("failed to read request")?;
            if line.trim().is_empty() {
                continue;
            }
            let request: WorkerRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    warn!(%err, "dropping malformed request");
                    continue;
                }
            };
            if matches!(request.command, WorkerCommand::Shutdown) {
                debug!("shutdown requested");
                break;
            }
            let response = self.handle(request);
            write_line(&mut stdout, &response)?;
        }
        Ok(())
    }

    fn handle(&mut self, request: WorkerRequest) -> WorkerResponse {
        let id = request.id;
        match self.execute(request.command) {
            Ok(payload) => WorkerResponse::ok(id, payload),
            Err(err) => WorkerResponse::error(id, format!("{err:#}")),
        }
    }

    fn execute(&mut self, command: WorkerCommand) -> Result<WorkerPayload> {
        match command {
            WorkerCommand::LoadModel { settings } => {
                let runtime = Runtime::resolve(&settings.implementation).ok_or_else(|| {
                    anyhow!("unknown model implementation '{}'", settings.implementation)
                })?;
                let name = settings.name.clone();
                debug!(model = %settings.model_id(), "model loaded");
                self.models
                    .insert(settings.model_id(), LoadedModel { settings, runtime });
                Ok(WorkerPayload::ModelLoaded { name })
            }
            WorkerCommand::UnloadModel { name, version } => {
                let id = model_id(&name, version.as_deref());
                self.models
                    .remove(&id)
                    .ok_or_else(|| anyhow!("model '{id}' is not loaded"))?;
                Ok(WorkerPayload::ModelUnloaded { name })
            }
            WorkerCommand::Predict {
                name,
                version,
                payload,
            } => {
                let id = model_id(&name, version.as_deref());
                let model = self
                    .models
                    .get(&id)
                    .ok_or_else(|| anyhow!("model '{id}' is not loaded"))?;
                let outputs = model.runtime.predict(self.environment.as_ref(), payload)?;
                Ok(WorkerPayload::Prediction {
                    model_name: model.settings.name.clone(),
                    outputs,
                })
            }
            WorkerCommand::Ping => Ok(WorkerPayload::Pong),
            WorkerCommand::Shutdown => Err(anyhow!("shutdown is not a request")),
        }
    }
}

fn model_id(name: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("{name}:{version}"),
        None => name.to_string(),
    }
}

fn write_line(out: &mut impl Write, response: &WorkerResponse) -> Result<()> {
    let line = serde_json::to_string(response)?;
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}
