//! Model settings as read from model-settings files.

use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Settings describing one model to be served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub name: String,
    /// Name of the runtime implementation the worker resolves.
    pub implementation: String,
    #[serde(default)]
    pub parameters: ModelParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Archive (`.tar.gz`) holding an isolated environment for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_tarball: Option<PathBuf>,
    /// Already materialized environment directory; takes precedence over
    /// `environment_tarball` and is never removed by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_pool_gid: Option<String>,
    #[serde(default)]
    pub autogenerate_inference_pool_gid: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl ModelParameters {
    /// Fills in a group id from `generate` when auto-generation is requested
    /// and none was supplied.
    #[must_use]
    pub fn with_gid_source<F>(mut self, generate: F) -> Self
    where
        F: FnOnce() -> String,
    {
        if self.autogenerate_inference_pool_gid && self.inference_pool_gid.is_none() {
            self.inference_pool_gid = Some(generate());
        }
        self
    }

    #[must_use]
    pub fn with_generated_gid(self) -> Self {
        self.with_gid_source(|| uuid::Uuid::new_v4().to_string())
    }
}

impl ModelSettings {
    pub fn new(
        name: impl Into<String>,
        implementation: impl Into<String>,
        parameters: ModelParameters,
    ) -> Self {
        Self::with_gid_source(name, implementation, parameters, || {
            uuid::Uuid::new_v4().to_string()
        })
    }

    pub fn with_gid_source<F>(
        name: impl Into<String>,
        implementation: impl Into<String>,
        parameters: ModelParameters,
        generate: F,
    ) -> Self
    where
        F: FnOnce() -> String,
    {
        Self {
            name: name.into(),
            implementation: implementation.into(),
            parameters: parameters.with_gid_source(generate),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut settings: Self =
            serde_json::from_str(raw).context("invalid model settings JSON")?;
        settings.parameters = settings.parameters.with_generated_gid();
        Ok(settings)
    }

    /// Loads settings from a JSON file. Relative environment paths are
    /// resolved against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model settings {}", path.display()))?;
        let mut settings = Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if let Some(base) = path.parent() {
            let params = &mut settings.parameters;
            params.environment_tarball = params
                .environment_tarball
                .take()
                .map(|p| if p.is_relative() { base.join(p) } else { p });
            params.environment_path = params
                .environment_path
                .take()
                .map(|p| if p.is_relative() { base.join(p) } else { p });
        }
        Ok(settings)
    }

    pub fn version(&self) -> Option<&str> {
        self.parameters.version.as_deref()
    }

    pub fn gid(&self) -> Option<&str> {
        self.parameters.inference_pool_gid.as_deref()
    }

    /// Identity used to count distinct models bound to a pool.
    pub fn model_id(&self) -> String {
        match self.version() {
            Some(version) => format!("{}:{version}", self.name),
            None => self.name.clone(),
        }
    }
}
