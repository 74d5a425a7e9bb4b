//! Configuration loading and data folder resolution
//!
//! Services resolve their settings in this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing TOML file is never fatal: the service logs a warning and
//! starts with defaults.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Logging configuration shared by every service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive (e.g. "info" or "stratix_ingest=debug,tower_http=info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the TOML config path for a module
///
/// Priority: explicit path (CLI) → `env_var` → `<config dir>/stratix/<module>.toml`.
/// Returns `None` when no candidate can be determined.
pub fn resolve_config_path(
    module_name: &str,
    cli_path: Option<&Path>,
    env_var_name: &str,
) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir().map(|d| d.join("stratix").join(format!("{}.toml", module_name)))
}

/// Load a TOML config file, falling back to `T::default()` when it is missing
///
/// A file that exists but fails to parse is a configuration error: silently
/// ignoring a typo in a production config is worse than refusing to start.
pub fn load_toml_or_default<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No config file location available, using built-in defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// OS-dependent default data folder (database file, local object storage)
pub fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("stratix"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/stratix"))
    } else {
        dirs::data_dir()
            .map(|d| d.join("stratix"))
            .unwrap_or_else(|| PathBuf::from("./stratix_data"))
    }
}
