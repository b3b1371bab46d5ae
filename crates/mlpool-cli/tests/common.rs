#![allow(dead_code)]

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::Duration,
};

use flate2::{write::GzEncoder, Compression};
use mlpool_core::{Config, ModelParameters, ModelSettings, WorkerEvent};
use tokio::sync::broadcast;

pub fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mlpool"))
}

/// Registry configuration whose workers are this crate's own binary.
pub fn test_config(root: &Path, workers: usize) -> Config {
    Config::new(root.join("envs"), worker_binary())
        .with_parallel_workers(workers)
        .with_startup_timeout(Duration::from_secs(20))
        .with_dispatch_timeout(Duration::from_secs(20))
}

pub fn write_tarball(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).expect("create archive");
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (entry, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, entry, contents.as_bytes())
            .expect("append");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
    path
}

/// An environment archive whose `VERSION` file holds `version`.
pub fn environment_tarball(dir: &Path, name: &str, version: &str) -> PathBuf {
    write_tarball(
        dir,
        name,
        &[("VERSION", &format!("{version}\n")), ("bin/.keep", "")],
    )
}

pub fn model(name: &str, implementation: &str) -> ModelSettings {
    ModelSettings::new(name, implementation, ModelParameters::default())
}

pub fn model_with(name: &str, implementation: &str, params: ModelParameters) -> ModelSettings {
    ModelSettings::new(name, implementation, params)
}

pub fn tarball_params(tarball: &Path) -> ModelParameters {
    ModelParameters {
        environment_tarball: Some(tarball.to_path_buf()),
        ..ModelParameters::default()
    }
}

pub fn write_settings(dir: &Path, file: &str, settings: &serde_json::Value) -> PathBuf {
    let path = dir.join(file);
    fs::write(&path, serde_json::to_string_pretty(settings).expect("json")).expect("write");
    path
}

pub fn kill_process(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("run kill");
    assert!(status.success(), "kill -9 {pid} failed");
}

/// Waits for the first event matching `predicate`.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<WorkerEvent>,
    within: Duration,
    predicate: F,
) -> Option<WorkerEvent>
where
    F: Fn(&WorkerEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
