//! Per-event-code hit counters with whitelist caps and aligned resets.
//!
//! Counters reset every `reset_interval_in_secs`; the reset timestamp always
//! advances in whole interval units so restarts do not drift the schedule.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::PlatformClient;
use crate::error::Result;
use crate::model::{load_json, save_json};
use crate::paths::AgentPaths;
use crate::remote_config::{read_config, RemoteConfigMap};
use magpie_config::EventCodeConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CodeLimitState {
    last_reset_timestamp: i64,
    counters: BTreeMap<String, i64>,
}

pub struct EventCodeManager {
    conf: EventCodeConfig,
    state_path: PathBuf,
    /// code -> human readable message, from the configured code table.
    event_codes: BTreeMap<String, String>,
}

impl std::fmt::Debug for EventCodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCodeManager")
            .field("enabled", &self.conf.enabled)
            .field("codes", &self.event_codes.len())
            .finish_non_exhaustive()
    }
}

const DEFAULT_MESSAGE: &str = "未知错误";

impl EventCodeManager {
    /// Build the manager, loading the code table from `code_json_url`
    /// (http(s) URL, `cos://` config map, or local file). `convert` maps the
    /// raw table into `code -> message`; the default mod supplies one.
    pub async fn load(
        conf: EventCodeConfig,
        client: &dyn PlatformClient,
        paths: &AgentPaths,
        convert: impl Fn(&Value) -> BTreeMap<String, String>,
    ) -> Self {
        let mut conf = conf;
        let event_codes = if conf.enabled && !conf.code_json_url.is_empty() {
            match Self::fetch_code_table(&conf.code_json_url, client, paths).await {
                Ok(raw) => convert(&raw),
                Err(err) => {
                    tracing::error!(url = %conf.code_json_url, error = %err, "failed to load code table, disabling limiter");
                    conf.enabled = false;
                    BTreeMap::new()
                }
            }
        } else {
            conf.enabled = false;
            BTreeMap::new()
        };

        Self {
            conf,
            state_path: paths.code_limit_state(),
            event_codes,
        }
    }

    /// Limiter used in tests and when the table is already in hand.
    pub fn with_table(
        conf: EventCodeConfig,
        state_path: PathBuf,
        event_codes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            conf,
            state_path,
            event_codes,
        }
    }

    async fn fetch_code_table(
        url: &str,
        client: &dyn PlatformClient,
        paths: &AgentPaths,
    ) -> Result<Value> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = reqwest::Client::new().get(url).send().await?;
            let bytes = response.bytes().await?;
            let cache = paths.code_json_cache();
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&cache, &bytes)?;
            Ok(serde_json::from_slice(&bytes)?)
        } else if let Some(path) = url.strip_prefix("cos://") {
            let source = RemoteConfigMap {
                client,
                config_path: path.to_string(),
            };
            Ok(read_config(&source, paths).await)
        } else {
            let text = std::fs::read_to_string(url)?;
            Ok(serde_json::from_str(&text)?)
        }
    }

    pub fn get_message(&self, code: &str) -> String {
        self.event_codes
            .get(code)
            .cloned()
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_string())
    }

    /// Reload state, snapping `last_reset_timestamp` forward in whole
    /// interval units and clearing counters when a reset is due.
    fn create_or_reset_state(&self) -> CodeLimitState {
        let now = Utc::now().timestamp();
        let mut state: CodeLimitState = load_json(&self.state_path)
            .unwrap_or_default()
            .unwrap_or_default();
        let missing = !self.state_path.exists();

        let reset_due = state.last_reset_timestamp + self.conf.reset_interval_in_secs;
        if now > reset_due || missing {
            let intervals = (now - state.last_reset_timestamp) / self.conf.reset_interval_in_secs;
            state.last_reset_timestamp += intervals * self.conf.reset_interval_in_secs;
            state.counters.clear();
            tracing::info!("reset event code limit state");
            if let Err(err) = save_json(&self.state_path, &state) {
                tracing::error!(error = %err, "failed to persist code limit state");
            }
        }
        state
    }

    pub fn hit(&self, code: &str) {
        if !self.conf.enabled || code.is_empty() {
            return;
        }
        let mut state = self.create_or_reset_state();
        *state.counters.entry(code.to_string()).or_insert(0) += 1;
        if let Err(err) = save_json(&self.state_path, &state) {
            tracing::error!(error = %err, "failed to persist code limit state");
        }
    }

    pub fn is_over_limit(&self, code: &str) -> bool {
        if !self.conf.enabled {
            return false;
        }
        let state = self.create_or_reset_state();

        if code.is_empty() {
            tracing::error!("no event code given, regarding as over limit");
            return true;
        }
        let Some(&limit) = self.conf.whitelist.get(code) else {
            tracing::warn!(code, "code not in whitelist, regarding as over limit");
            return true;
        };
        if limit == -1 {
            return false;
        }
        let count = state.counters.get(code).copied().unwrap_or(0);
        tracing::debug!(code, count, limit, "code limit check");
        count >= limit
    }
}
