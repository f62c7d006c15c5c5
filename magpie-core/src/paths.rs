//! On-disk layout of the agent's state, cache, and config files.
//!
//! All state lives under the platform user-state dir, caches under the user
//! cache dir. Tests (and embedded deployments) can point everything at a
//! scratch root instead.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "magpie";

/// Resolved filesystem layout shared by every component.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl AgentPaths {
    /// Platform-standard user dirs (`~/.local/state/magpie` etc. on Linux).
    pub fn system() -> Self {
        let state_dir = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME);
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME);
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME);
        Self {
            state_dir,
            cache_dir,
            config_dir,
        }
    }

    /// Everything under one root; used by tests.
    pub fn rooted(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
            config_dir: root.join("config"),
        }
    }

    pub fn api_client_state(&self) -> PathBuf {
        self.state_dir.join("api_client.state.json")
    }

    pub fn install_state(&self) -> PathBuf {
        self.state_dir.join("install.state.json")
    }

    pub fn raw_device_state(&self) -> PathBuf {
        self.state_dir.join("raw_device.state.json")
    }

    pub fn code_limit_state(&self) -> PathBuf {
        self.state_dir.join("code_limit.state.json")
    }

    pub fn file_state(&self) -> PathBuf {
        self.state_dir.join("file.state.json")
    }

    pub fn updater_state(&self) -> PathBuf {
        self.state_dir.join("updater.state.json")
    }

    /// Root of all per-record cache dirs.
    pub fn records_dir(&self) -> PathBuf {
        self.state_dir.join("records")
    }

    /// Per-mod state dir holding `<uuid>.json` upload requests.
    pub fn mod_state_dir(&self, mod_name: &str) -> PathBuf {
        self.state_dir.join("mods").join(mod_name)
    }

    /// Scratch space for materialized cut windows.
    pub fn mod_temp_dir(&self, mod_name: &str) -> PathBuf {
        self.mod_state_dir(mod_name).join("tmp")
    }

    /// Versioned remote-config cache entry. The key may contain path
    /// separators; intermediate directories are the caller's to create.
    pub fn remote_config_cache(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(format!("{cache_key}.json"))
    }

    pub fn code_json_cache(&self) -> PathBuf {
        self.cache_dir.join("code.json")
    }

    /// Fallback serial-number file generated next to the config.
    pub fn generated_sn_file(&self) -> PathBuf {
        self.config_dir.join("sn.txt")
    }
}
