//! Typed configuration for the magpie agent.
//!
//! Configuration lives in a single YAML file (platform config dir by default,
//! overridable with `--config-file`). Two environment variables override the
//! corresponding fields at load time: `COS_API_SERVER_URL` and
//! `COS_API_PROJECT_SLUG`. Unknown keys under `mod.conf` are preserved so
//! individual mods can carry their own settings without this crate knowing
//! their shape.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_SERVER_URL: &str = "COS_API_SERVER_URL";
pub const ENV_PROJECT_SLUG: &str = "COS_API_PROJECT_SLUG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Which transport the platform client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Rest,
    Grpc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the data platform, e.g. `https://openapi.example.com`.
    pub server_url: String,
    /// Default project slug (`<warehouse_slug>/<project_slug>`).
    pub project_slug: Option<String>,
    /// Organization slug, used when no project is pinned.
    pub org_slug: Option<String>,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    /// Cache slug lookups and the organization name on disk.
    pub use_cache: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            project_slug: None,
            org_slug: None,
            client_type: ClientType::Rest,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Delete a record's cache dir as soon as its upload completes.
    pub delete_after_upload: bool,
    /// Retention window for cache dirs in hours; negative disables the sweep.
    pub delete_after_interval_in_hours: i64,
    pub scan_interval_in_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            delete_after_upload: true,
            delete_after_interval_in_hours: -1,
            scan_interval_in_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventCodeConfig {
    pub enabled: bool,
    /// code -> max hits per reset interval; -1 means unlimited.
    pub whitelist: BTreeMap<String, i64>,
    pub reset_interval_in_secs: i64,
    /// Where the code table lives: http(s) URL, `cos://` config-map path, or
    /// a local file path.
    pub code_json_url: String,
}

impl Default for EventCodeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            whitelist: BTreeMap::new(),
            reset_interval_in_secs: 86_400,
            code_json_url: String::new(),
        }
    }
}

/// Self-updater settings. The updater itself lives outside the core; only the
/// interface is carried here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub enabled: bool,
    pub interval_in_secs: u64,
    pub artifact_base_url: String,
    pub binary_path: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_in_secs: 86_400,
            artifact_base_url: String::new(),
            binary_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub interval_in_secs: u64,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            interval_in_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModConfig {
    pub name: String,
    /// Open bag of mod-specific settings; the selected mod parses it.
    pub conf: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub collector: CollectorConfig,
    pub event_code: EventCodeConfig,
    pub updater: UpdaterConfig,
    pub device_register: RegisterConfig,
    #[serde(rename = "mod")]
    pub mod_: ModConfig,
}

impl AppConfig {
    /// Load from `path`, or from the platform default location when absent.
    /// A missing file yields the defaults (still subject to env overrides and
    /// validation).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let mut conf = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            AppConfig::default()
        };

        conf.apply_env_overrides();
        Ok(conf)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_SERVER_URL) {
            if !url.is_empty() {
                self.api.server_url = url;
            }
        }
        if let Ok(slug) = std::env::var(ENV_PROJECT_SLUG) {
            if !slug.is_empty() {
                self.api.project_slug = Some(slug);
            }
        }
    }

    /// Schema-level checks that must hold before the agent starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.server_url.is_empty() {
            return Err(ConfigError::Validation(
                "api.server_url must not be empty".into(),
            ));
        }
        if self.api.project_slug.is_none() && self.api.org_slug.is_none() {
            return Err(ConfigError::Validation(
                "api.project_slug and api.org_slug must not both be empty".into(),
            ));
        }
        if self.collector.scan_interval_in_secs == 0 {
            return Err(ConfigError::Validation(
                "collector.scan_interval_in_secs must be positive".into(),
            ));
        }
        if self.event_code.enabled && self.event_code.reset_interval_in_secs <= 0 {
            return Err(ConfigError::Validation(
                "event_code.reset_interval_in_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn write_as_yaml(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let text = serde_yaml::to_string(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `<config dir>/magpie/config.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("magpie")
        .join("config.yaml")
}
