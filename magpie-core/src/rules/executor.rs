//! Drives the rule engine over a message stream, keeping the rule set fresh.
//!
//! The remote rule set is re-checked once a minute of wall time, and
//! additionally whenever more than 30 seconds pass between two items (a gap
//! usually means the stream sat idle and the rules may have changed
//! meanwhile). The engine is only rebuilt when the fetched configs actually
//! differ.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::engine::{build_engine, Engine, RuleContext};
use super::RuleItem;
use crate::api::PlatformClient;
use crate::auth::ApiClientState;
use crate::error::Result;
use crate::paths::AgentPaths;
use crate::remote_config::list_device_diagnosis_rules;

const CONFIG_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const STREAM_GAP: Duration = Duration::from_secs(30);

/// The cut window an `upload` action requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadWindow {
    /// Seconds since epoch of the triggering item.
    pub trigger_ts: i64,
    pub before_minutes: i64,
    pub after_minutes: i64,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub extra_files: Vec<String>,
    pub project_name: String,
}

/// Writes a cut request somewhere the collector will find it.
pub type UploadFn = Arc<dyn Fn(UploadWindow) -> Result<()> + Send + Sync>;

pub struct RuleExecutor {
    name: String,
    client: Arc<dyn PlatformClient>,
    paths: AgentPaths,
    upload_fn: UploadFn,
    handle: tokio::runtime::Handle,
    configs: Option<Vec<Value>>,
    engine: Option<Engine>,
}

impl std::fmt::Debug for RuleExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleExecutor")
            .field("name", &self.name)
            .field("rules", &self.engine.as_ref().map(Engine::rule_count))
            .finish_non_exhaustive()
    }
}

impl RuleExecutor {
    /// Runs on a worker thread; `handle` is used to block on platform calls.
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn PlatformClient>,
        paths: AgentPaths,
        upload_fn: UploadFn,
        handle: tokio::runtime::Handle,
    ) -> Self {
        let mut executor = Self {
            name: name.into(),
            client,
            paths,
            upload_fn,
            handle,
            configs: None,
            engine: None,
        };
        executor.update_config();
        executor
    }

    /// Re-fetch the rule sets; rebuild the engine only on change.
    pub fn update_config(&mut self) {
        let state = ApiClientState::load(&self.paths);
        let device_name = state.device_name().unwrap_or_default().to_string();

        let configs = self.handle.block_on(list_device_diagnosis_rules(
            self.client.as_ref(),
            state.device_name(),
            &self.paths,
        ));
        if self.configs.as_ref() == Some(&configs) {
            return;
        }

        let ctx = RuleContext {
            client: Arc::clone(&self.client),
            device_name,
            upload_fn: Arc::clone(&self.upload_fn),
            handle: self.handle.clone(),
        };
        let engine = build_engine(&configs, ctx);
        tracing::info!(
            executor = %self.name,
            rules = engine.rule_count(),
            "rule engine rebuilt"
        );
        self.configs = Some(configs);
        self.engine = Some(engine);
    }

    /// Drain a finite stream (or run forever on an infinite one).
    pub fn consume<I>(&mut self, stream: I)
    where
        I: IntoIterator<Item = RuleItem>,
    {
        tracing::info!(executor = %self.name, "consume started");
        let mut refresh_mark = Instant::now();
        let mut last_item_at = Instant::now();

        for item in stream {
            if last_item_at.elapsed() > STREAM_GAP {
                self.update_config();
            }
            if let Some(engine) = &self.engine {
                engine.consume_next(&item);
            }
            if refresh_mark.elapsed() > CONFIG_REFRESH_INTERVAL {
                self.update_config();
                refresh_mark = Instant::now();
            }
            last_item_at = Instant::now();
        }
        tracing::info!(executor = %self.name, "consume ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockPlatformClient;
    use parking_lot::Mutex;
    use serde_json::json;

    fn save_device_state(paths: &AgentPaths) {
        let mut state = ApiClientState::default();
        state.device = json!({"name": "devices/d1"});
        state.save(paths).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executor_builds_engine_once_for_stable_configs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        save_device_state(&paths);

        let mut client = MockPlatformClient::new();
        client
            .expect_list_device_projects()
            .times(2)
            .returning(|_| Ok(vec![json!({"name": "projects/p"})]));
        client
            .expect_get_diagnosis_rules_metadata()
            .returning(|_| Ok(json!({"currentVersion": 1})));
        client.expect_get_diagnosis_rule().returning(|_| {
            Ok(json!({
                "name": "projects/p/diagnosisRule",
                "rules": [{
                    "enabled": true,
                    "rules": [{"when": [{"contains": "E"}], "actions": [{"name": "upload"}]}],
                }],
            }))
        });
        client.expect_hit_diagnosis_rule().returning(|_, _, _, _| Ok(()));

        let upload_fn: UploadFn = Arc::new(|_| Ok(()));
        let seen = Arc::new(Mutex::new(0usize));

        let client: Arc<dyn PlatformClient> = Arc::new(client);
        let handle = tokio::runtime::Handle::current();
        let paths_clone = paths.clone();
        let counter = Arc::clone(&seen);
        tokio::task::spawn_blocking(move || {
            let mut executor =
                RuleExecutor::new("test", client, paths_clone, upload_fn, handle);
            // second update with identical configs keeps the engine
            executor.update_config();
            *counter.lock() = executor.engine.as_ref().map(Engine::rule_count).unwrap_or(0);
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executor_consumes_finite_streams() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        save_device_state(&paths);

        let mut client = MockPlatformClient::new();
        client
            .expect_list_device_projects()
            .returning(|_| Ok(vec![json!({"name": "projects/p"})]));
        client
            .expect_get_diagnosis_rules_metadata()
            .returning(|_| Ok(json!({"currentVersion": 1})));
        client.expect_get_diagnosis_rule().returning(|_| {
            Ok(json!({
                "name": "projects/p/diagnosisRule",
                "rules": [{
                    "enabled": true,
                    "rules": [{"when": [{"contains": "ERROR"}], "actions": [{"name": "upload", "title": "t"}]}],
                }],
            }))
        });
        client.expect_hit_diagnosis_rule().returning(|_, _, _, _| Ok(()));

        let windows = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&windows);
        let upload_fn: UploadFn = Arc::new(move |w| {
            sink.lock().push(w);
            Ok(())
        });

        let client: Arc<dyn PlatformClient> = Arc::new(client);
        let handle = tokio::runtime::Handle::current();
        let paths_clone = paths.clone();
        tokio::task::spawn_blocking(move || {
            let mut executor =
                RuleExecutor::new("file drain", client, paths_clone, upload_fn, handle);
            executor.consume(vec![
                RuleItem::from_log_line("a.log", "ERROR one", 100),
                RuleItem::from_log_line("a.log", "fine", 101),
                RuleItem::from_log_line("a.log", "ERROR two", 102),
            ]);
        })
        .await
        .unwrap();

        let windows = windows.lock();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].trigger_ts, 100);
        assert_eq!(windows[1].trigger_ts, 102);
    }
}
