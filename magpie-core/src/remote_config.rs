//! Version-checked fetch-through cache for remote configuration.
//!
//! A source exposes a cache key, a cheap version probe, and the full fetch.
//! `read_config` never fails: any network problem falls back to the last
//! cached value (an empty map when there is none).

use std::fs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::PlatformClient;
use crate::error::Result;
use crate::paths::AgentPaths;

#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    /// Cache key; may contain path separators and is treated as a relative
    /// filesystem path under the cache dir.
    fn cache_key(&self) -> String;
    async fn get_config_version(&self) -> Result<Value>;
    async fn get_config(&self) -> Result<Value>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CacheEntry {
    version: Value,
    value: Value,
}

fn empty_map() -> Value {
    Value::Object(Default::default())
}

/// Read through the cache. See module docs for the fallback rules; when the
/// cached version equals the current one the full fetch is skipped entirely.
pub async fn read_config(source: &dyn RemoteConfigSource, paths: &AgentPaths) -> Value {
    let cache_key = source.cache_key();
    let cache_file = paths.remote_config_cache(&cache_key);

    let cached: CacheEntry = fs::read_to_string(&cache_file)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

    let current_version = match source.get_config_version().await {
        Ok(version) => version,
        Err(err) => {
            tracing::warn!(key = %cache_key, error = %err, "version probe failed, using cached value");
            return non_null(cached.value);
        }
    };

    if !cached.version.is_null() && normalize(&cached.version) == normalize(&current_version) {
        return non_null(cached.value);
    }

    let value = match source.get_config().await {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(key = %cache_key, error = %err, "config fetch failed, using cached value");
            return non_null(cached.value);
        }
    };

    if !value.is_null() {
        let entry = CacheEntry {
            version: current_version,
            value: value.clone(),
        };
        if let Err(err) = persist(&cache_file, &entry) {
            tracing::warn!(key = %cache_key, error = %err, "failed to persist config cache");
        }
    }
    non_null(value)
}

fn persist(cache_file: &std::path::Path, entry: &CacheEntry) -> Result<()> {
    if let Some(parent) = cache_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(cache_file, serde_json::to_string(entry)?)?;
    Ok(())
}

/// Versions may arrive as numbers or strings depending on transport.
fn normalize(version: &Value) -> String {
    match version {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn non_null(value: Value) -> Value {
    if value.is_null() {
        empty_map()
    } else {
        value
    }
}

/// The diagnosis-rule set of one project.
pub struct ProjectRemoteRule<'a> {
    pub client: &'a dyn PlatformClient,
    pub project_name: String,
}

#[async_trait]
impl RemoteConfigSource for ProjectRemoteRule<'_> {
    fn cache_key(&self) -> String {
        format!("{}/diagnosisRules", self.project_name)
    }

    async fn get_config_version(&self) -> Result<Value> {
        let metadata = self
            .client
            .get_diagnosis_rules_metadata(&self.project_name)
            .await?;
        Ok(metadata.get("currentVersion").cloned().unwrap_or(Value::from(-1)))
    }

    async fn get_config(&self) -> Result<Value> {
        self.client.get_diagnosis_rule(&self.project_name).await
    }
}

/// A `cos://<parent>/configMaps/<key>` config map (the event-code table).
pub struct RemoteConfigMap<'a> {
    pub client: &'a dyn PlatformClient,
    /// `<parent>/configMaps/<key>` without the scheme.
    pub config_path: String,
}

impl RemoteConfigMap<'_> {
    /// Split `<parent>/configMaps/<key>` into parent and key.
    pub fn parse_path(path: &str) -> Result<(String, String)> {
        match path.split_once("/configMaps/") {
            Some((parent, key)) if !parent.is_empty() && !key.is_empty() => {
                Ok((parent.to_string(), key.to_string()))
            }
            _ => Err(crate::error::AgentError::InvalidName(format!(
                "invalid config path: {path}"
            ))),
        }
    }
}

#[async_trait]
impl RemoteConfigSource for RemoteConfigMap<'_> {
    fn cache_key(&self) -> String {
        self.config_path.clone()
    }

    async fn get_config_version(&self) -> Result<Value> {
        let (parent, key) = Self::parse_path(&self.config_path)?;
        let metadata = self.client.get_configmap_metadata(&key, &parent).await?;
        Ok(metadata.get("currentVersion").cloned().unwrap_or(Value::from(-1)))
    }

    async fn get_config(&self) -> Result<Value> {
        let (parent, key) = Self::parse_path(&self.config_path)?;
        let config = self.client.get_configmap(&key, &parent).await?;
        Ok(config.get("value").cloned().unwrap_or_else(empty_map))
    }
}

/// Every project the device belongs to, each with its remote rule set.
pub async fn list_device_diagnosis_rules(
    client: &dyn PlatformClient,
    device_name: Option<&str>,
    paths: &AgentPaths,
) -> Vec<Value> {
    let Some(device_name) = device_name else {
        tracing::warn!("device name not found, skip listing diagnosis rules");
        return Vec::new();
    };

    let projects = match client.list_device_projects(device_name).await {
        Ok(projects) => projects,
        Err(err) => {
            tracing::warn!(error = %err, "failed to list device projects");
            return Vec::new();
        }
    };
    if projects.is_empty() {
        tracing::warn!("no projects found, skip listing diagnosis rules");
        return Vec::new();
    }

    let mut rule_sets = Vec::new();
    for project in projects {
        let Some(project_name) = project.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let source = ProjectRemoteRule {
            client,
            project_name: project_name.to_string(),
        };
        let rules = read_config(&source, paths).await;
        let meaningful = rules
            .as_object()
            .map(|map| !map.is_empty())
            .unwrap_or(!rules.is_null());
        if meaningful {
            rule_sets.push(rules);
        }
    }
    rule_sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        version: Result<Value>,
        config: Result<Value>,
        config_calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(version: Result<Value>, config: Result<Value>) -> Self {
            Self {
                version,
                config,
                config_calls: AtomicUsize::new(0),
            }
        }
    }

    fn clone_result(r: &Result<Value>) -> Result<Value> {
        match r {
            Ok(v) => Ok(v.clone()),
            Err(_) => Err(crate::error::AgentError::Api("boom".into())),
        }
    }

    #[async_trait]
    impl RemoteConfigSource for FakeSource {
        fn cache_key(&self) -> String {
            "projects/p1/diagnosisRules".into()
        }

        async fn get_config_version(&self) -> Result<Value> {
            clone_result(&self.version)
        }

        async fn get_config(&self) -> Result<Value> {
            self.config_calls.fetch_add(1, Ordering::SeqCst);
            clone_result(&self.config)
        }
    }

    #[tokio::test]
    async fn fetches_and_caches_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());

        let source = FakeSource::new(Ok(json!(3)), Ok(json!({"rules": [1]})));
        let value = read_config(&source, &paths).await;
        assert_eq!(value, json!({"rules": [1]}));

        // nested cache key creates intermediate dirs
        assert!(paths
            .remote_config_cache("projects/p1/diagnosisRules")
            .exists());
    }

    #[tokio::test]
    async fn equal_version_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());

        let source = FakeSource::new(Ok(json!(3)), Ok(json!({"rules": [1]})));
        read_config(&source, &paths).await;
        assert_eq!(source.config_calls.load(Ordering::SeqCst), 1);

        // same version again: cached value, no second fetch
        let value = read_config(&source, &paths).await;
        assert_eq!(value, json!({"rules": [1]}));
        assert_eq!(source.config_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn version_probe_failure_returns_cached_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());

        let source = FakeSource::new(Ok(json!(1)), Ok(json!({"a": 1})));
        read_config(&source, &paths).await;

        let broken = FakeSource::new(
            Err(crate::error::AgentError::Api("down".into())),
            Ok(json!({"a": 2})),
        );
        let value = read_config(&broken, &paths).await;
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(broken.config_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cold_cache_and_failures_yield_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());

        let broken = FakeSource::new(Err(crate::error::AgentError::Api("down".into())), Ok(json!(1)));
        let value = read_config(&broken, &paths).await;
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn fetch_failure_after_version_bump_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());

        let source = FakeSource::new(Ok(json!(1)), Ok(json!({"a": 1})));
        read_config(&source, &paths).await;

        let bumped = FakeSource::new(
            Ok(json!(2)),
            Err(crate::error::AgentError::Api("down".into())),
        );
        let value = read_config(&bumped, &paths).await;
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn config_path_parses() {
        let (parent, key) =
            RemoteConfigMap::parse_path("organizations/current/configMaps/device/code.json")
                .unwrap();
        assert_eq!(parent, "organizations/current");
        assert_eq!(key, "device/code.json");
        assert!(RemoteConfigMap::parse_path("no-configmaps-here").is_err());
    }
}
