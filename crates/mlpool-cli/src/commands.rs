use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use mlpool_core::{env::hash_of_file, Config, Model, PoolError, PoolRegistry};
use mlpool_domain::ModelSettings;
use serde_json::{json, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cli::{HashArgs, MlpoolCli, PredictArgs, PruneArgs};
use crate::outcome::ExecutionOutcome;

const STAGING_PREFIX: &str = ".partial-";

/// Configuration from the environment with command-line overrides applied.
pub fn load_config(cli: &MlpoolCli) -> Result<Config, PoolError> {
    let mut config = Config::from_env()?;
    if let Some(workers) = cli.workers {
        config = config.with_parallel_workers(workers);
    }
    if let Some(dir) = &cli.environments_dir {
        config = config.with_environments_dir(dir);
    }
    config.validate()
}

pub fn hash(args: &HashArgs) -> ExecutionOutcome {
    match hash_of_file(&args.archive) {
        Ok(hash) => ExecutionOutcome::success(
            hash.clone(),
            json!({
                "hash": hash,
                "archive": args.archive.display().to_string(),
                "passthrough": true,
            }),
        ),
        Err(err) => ExecutionOutcome::user_error(
            format!("cannot hash {}", args.archive.display()),
            json!({ "reason": format!("{err:#}") }),
        ),
    }
}

pub async fn predict(config: Config, args: &PredictArgs) -> ExecutionOutcome {
    let payload: Value = match serde_json::from_str(&args.payload) {
        Ok(payload) => payload,
        Err(err) => {
            return ExecutionOutcome::user_error(
                "payload is not valid JSON",
                json!({ "reason": err.to_string() }),
            )
        }
    };
    let mut settings = Vec::with_capacity(args.models.len());
    for path in &args.models {
        match ModelSettings::from_file(path) {
            Ok(loaded) => settings.push(loaded),
            Err(err) => {
                return ExecutionOutcome::user_error(
                    format!("invalid model settings {}", path.display()),
                    json!({ "reason": format!("{err:#}") }),
                )
            }
        }
    }

    let registry = match PoolRegistry::start(config).await {
        Ok(registry) => registry,
        Err(err) => return ExecutionOutcome::from_pool_error(&err),
    };
    let outcome = run_prediction(&registry, settings, args, payload).await;
    if let Err(err) = registry.close().await {
        warn!(%err, "registry did not shut down cleanly");
    }
    match outcome {
        Ok(outcome) => outcome,
        Err(err) => ExecutionOutcome::from_pool_error(&err),
    }
}

async fn run_prediction(
    registry: &PoolRegistry,
    settings: Vec<ModelSettings>,
    args: &PredictArgs,
    payload: Value,
) -> Result<ExecutionOutcome, PoolError> {
    let mut models: Vec<Model> = Vec::with_capacity(settings.len());
    for model in settings {
        models.push(registry.load_model(model).await?);
    }
    let Some(target) = models.iter().find(|model| {
        model.name() == args.target
            && (args.version.is_none() || model.settings().version() == args.version.as_deref())
    }) else {
        return Ok(ExecutionOutcome::user_error(
            format!("no loaded model is named '{}'", args.target),
            json!({
                "loaded": models.iter().map(|m| m.settings().model_id()).collect::<Vec<_>>(),
            }),
        ));
    };

    let outputs = registry.predict(target, payload).await?;
    let pool = target
        .pool_key()
        .map(ToString::to_string)
        .unwrap_or_default();
    debug!(model = %target.settings().model_id(), %pool, "prediction served");
    Ok(ExecutionOutcome::success(
        format!("{} answered", target.settings().model_id()),
        json!({
            "model": target.settings().model_id(),
            "pool": pool,
            "pools": registry.pool_count(),
            "outputs": outputs,
        }),
    ))
}

#[derive(Debug)]
struct EnvironmentDir {
    name: String,
    path: PathBuf,
    bytes: u64,
    staging: bool,
}

fn scan(root: &Path) -> Result<Vec<EnvironmentDir>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to scan {}", root.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        found.push(EnvironmentDir {
            staging: name.starts_with(STAGING_PREFIX),
            bytes: dir_size(entry.path()),
            path: entry.into_path(),
            name,
        });
    }
    Ok(found)
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(std::fs::Metadata::is_file)
        .map(|meta| meta.len())
        .sum()
}

pub fn envs_list(root: &Path) -> ExecutionOutcome {
    let dirs = match scan(root) {
        Ok(dirs) => dirs,
        Err(err) => {
            return ExecutionOutcome::failure(
                "cannot read the environment store",
                json!({ "reason": format!("{err:#}") }),
            )
        }
    };
    let environments: Vec<Value> = dirs
        .iter()
        .filter(|dir| !dir.staging)
        .map(|dir| {
            json!({
                "hash": dir.name,
                "path": dir.path.display().to_string(),
                "bytes": dir.bytes,
            })
        })
        .collect();
    let mut lines = vec![format!("{} environment(s) in {}", environments.len(), root.display())];
    lines.extend(
        dirs.iter()
            .filter(|dir| !dir.staging)
            .map(|dir| format!("  {}  {} bytes", dir.name, dir.bytes)),
    );
    ExecutionOutcome::success(
        lines.join("\n"),
        json!({
            "root": root.display().to_string(),
            "environments": environments,
        }),
    )
}

/// Pools never outlive the process that created them, so every directory in
/// the store is unreferenced from the CLI's point of view.
pub fn envs_prune(root: &Path, args: &PruneArgs) -> ExecutionOutcome {
    let dirs = match scan(root) {
        Ok(dirs) => dirs,
        Err(err) => {
            return ExecutionOutcome::failure(
                "cannot read the environment store",
                json!({ "reason": format!("{err:#}") }),
            )
        }
    };
    let mut removed = Vec::new();
    let mut freed = 0u64;
    for dir in &dirs {
        if !args.dry_run {
            if let Err(err) = fs::remove_dir_all(&dir.path) {
                return ExecutionOutcome::failure(
                    format!("failed to remove {}", dir.path.display()),
                    json!({ "reason": err.to_string(), "removed": removed }),
                );
            }
        }
        freed += dir.bytes;
        removed.push(dir.name.clone());
    }
    let verb = if args.dry_run { "would remove" } else { "removed" };
    ExecutionOutcome::success(
        format!("{verb} {} environment(s), {freed} bytes", removed.len()),
        json!({
            "root": root.display().to_string(),
            "removed": removed,
            "bytes": freed,
            "dry_run": args.dry_run,
        }),
    )
}
