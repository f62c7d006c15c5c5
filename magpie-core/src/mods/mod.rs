//! Pluggable collection strategies ("mods").
//!
//! A mod decides which directories to watch, how to identify the device, and
//! how to map event codes to messages. Mods register a constructor in an
//! explicit name-keyed registry; lookup is by name, with one special case:
//! fleets served from a `gaussian` platform URL (or configured as `gs`) get
//! the `gs` mod.

pub mod default;
pub mod task;

pub use default::DefaultMod;
pub use task::TaskHandler;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::PlatformClient;
use crate::error::{AgentError, Result};
use crate::model::RawDevice;
use crate::paths::AgentPaths;

/// Everything a mod constructor receives.
#[derive(Clone)]
pub struct ModInit {
    pub client: Arc<dyn PlatformClient>,
    /// The open `mod.conf` bag from the app config.
    pub conf: Value,
    pub paths: AgentPaths,
    pub handle: tokio::runtime::Handle,
    /// Set when the agent shuts down; background workers exit on it.
    pub stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for ModInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModInit").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait AgentMod: Send + Sync {
    fn name(&self) -> &'static str;

    /// Discover the device identity on this host.
    fn get_device(&self) -> Result<RawDevice>;

    /// Map the raw remote code table to `code -> message`.
    fn convert_code(&self, code_json: &Value) -> BTreeMap<String, String>;

    /// One collection sweep. Long-lived workers (log tail follower, task
    /// handler) are spawned on the first call.
    async fn run(&self) -> Result<()>;
}

pub type ModFactory = fn(ModInit) -> Result<Arc<dyn AgentMod>>;

pub struct ModRegistry {
    factories: HashMap<&'static str, ModFactory>,
}

impl std::fmt::Debug for ModRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ModRegistry").field("mods", &names).finish()
    }
}

impl ModRegistry {
    /// The built-in mods. `gs` shares the default implementation; it exists
    /// as a distinct name so gaussian fleets can diverge without a config
    /// migration.
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, ModFactory> = HashMap::new();
        factories.insert("default", default::DefaultMod::factory);
        factories.insert("gs", default::DefaultMod::factory);
        Self { factories }
    }

    pub fn build(&self, name: &str, init: ModInit) -> Result<Arc<dyn AgentMod>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| AgentError::ConfigValidation(format!("mod {name:?} not found")))?;
        factory(init)
    }
}

/// The configured mod name, with the gaussian override applied.
pub fn resolve_mod_name(server_url: &str, configured: &str) -> String {
    let configured = configured.to_ascii_lowercase();
    if server_url.contains("gaussian") || configured == "gs" {
        return "gs".to_string();
    }
    if configured.is_empty() {
        return "default".to_string();
    }
    configured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_url_forces_gs_mod() {
        assert_eq!(
            resolve_mod_name("https://api.gaussianrobotics.example", "default"),
            "gs"
        );
        assert_eq!(resolve_mod_name("https://openapi.example.com", "GS"), "gs");
        assert_eq!(
            resolve_mod_name("https://openapi.example.com", "default"),
            "default"
        );
        assert_eq!(resolve_mod_name("https://openapi.example.com", ""), "default");
    }

    #[test]
    fn registry_resolves_builtin_mods() {
        let registry = ModRegistry::builtin();
        assert!(registry.factories.contains_key("default"));
        assert!(registry.factories.contains_key("gs"));
    }
}
