//! Host-side configuration for the module directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting: modules.path")]
    MissingModulesPath,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub modules: ModulesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    /// Directory watched for module files. Required.
    #[serde(default)]
    pub path: PathBuf,

    /// Mirror directory libraries are staged into before loading.
    /// When unset, modules are loaded in place.
    #[serde(default)]
    pub mirror: Option<PathBuf>,

    /// Settle time between the last write to a file and its reload.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl ModulesConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_debounce_ms() -> u64 {
    200
}

/// Read and parse a configuration file.
pub fn load(path: &Path) -> Result<HostConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&raw)
}

/// Parse configuration text. Unknown keys are warned about, not rejected.
pub fn parse(raw: &str) -> Result<HostConfig, ConfigError> {
    let value: toml::Value = raw.parse()?;
    warn_unknown_keys(&value);
    let config: HostConfig = value.try_into()?;
    if config.modules.path.as_os_str().is_empty() {
        return Err(ConfigError::MissingModulesPath);
    }
    Ok(config)
}

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };
    for key in table.keys() {
        if key != "modules" {
            tracing::warn!(key = %key, "unrecognized configuration key");
        }
    }
    if let Some(modules) = table.get("modules").and_then(|v| v.as_table()) {
        for key in modules.keys() {
            if !matches!(key.as_str(), "path" | "mirror" | "debounce_ms") {
                tracing::warn!(key = %format!("modules.{key}"), "unrecognized configuration key");
            }
        }
    }
}
