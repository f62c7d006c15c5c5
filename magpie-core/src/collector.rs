//! The record lifecycle: fresh → created → uploaded (or skipped).
//!
//! `handle_record` drives one cache directory forward as far as it can get
//! this tick. State is persisted before any operation whose effect cannot be
//! re-derived from local files, so a crash (or a dropped link) leaves the
//! machine in a valid state for the next sweep to resume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::api::{create_or_get_record, PlatformClient};
use crate::auth::ApiClientState;
use crate::codes::EventCodeManager;
use crate::error::{AgentError, Result};
use crate::model::{is_image, CompleteOptions, FileInfo, RecordCache};
use crate::netmeter::NetworkMeter;
use crate::paths::AgentPaths;
use crate::uploader::resumable_upload_files;
use magpie_config::CollectorConfig;

pub const FINISH_FLAG: &str = "finish.flag";
const UPLOAD_COMPLETE_LABEL: &str = "上传完成";

pub struct Collector {
    conf: CollectorConfig,
    client: Arc<dyn PlatformClient>,
    code_mgr: Arc<EventCodeManager>,
    paths: AgentPaths,
    meter: Arc<NetworkMeter>,
    agent_version: String,
    device: Value,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("records_root", &self.paths.records_dir())
            .finish_non_exhaustive()
    }
}

/// Hard-link `source` to `target`, falling back to a copy across
/// filesystems. An existing target is left alone.
fn hardlink(source: &Path, target: &Path) -> Result<PathBuf> {
    if target.is_file() {
        tracing::warn!(path = %target.display(), "link target already exists, keeping it");
        return Ok(target.to_path_buf());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::hard_link(source, target).is_err() {
        std::fs::copy(source, target)?;
    }
    Ok(target.to_path_buf())
}

impl Collector {
    pub fn new(
        conf: CollectorConfig,
        client: Arc<dyn PlatformClient>,
        code_mgr: Arc<EventCodeManager>,
        paths: AgentPaths,
        meter: Arc<NetworkMeter>,
        agent_version: String,
    ) -> Self {
        let device = ApiClientState::load(&paths).device;
        Self {
            conf,
            client,
            code_mgr,
            paths,
            meter,
            agent_version,
            device,
        }
    }

    fn device_name(&self) -> Option<&str> {
        self.device.get("name").and_then(|v| v.as_str())
    }

    fn record_title(&self, rc: &RecordCache) -> String {
        if let Some(title) = rc.record.get("title").and_then(|v| v.as_str()) {
            if !title.is_empty() {
                return title.to_string();
            }
        }
        if let Some(title) = rc.task.get("title").and_then(|v| v.as_str()) {
            if !title.is_empty() {
                return title.to_string();
            }
        }

        let code = rc.event_code.as_deref().unwrap_or_default();
        let message = self.code_mgr.get_message(code);
        let trigger = Utc
            .timestamp_opt(rc.timestamp / 1000, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_default();
        format!("{message} ({code}) @ {trigger}")
    }

    fn record_description(&self, title: &str, rc: &RecordCache) -> String {
        if let Some(description) = rc.record.get("description").and_then(|v| v.as_str()) {
            if !description.is_empty() {
                return description.to_string();
            }
        }

        let mut description = format!(
            "### {title}\nthe record is triggered @ {}\nthe files are from {}\non robot:\n",
            rc.timestamp,
            rc.base_dir().display(),
        );
        for label in self
            .device
            .get("labels")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            if let Some(display) = label.get("displayName").and_then(|v| v.as_str()) {
                description.push('\n');
                description.push_str(display);
            }
        }
        description
    }

    async fn upload_record_thumbnail(&self, record_name: &str, rc: &RecordCache) {
        let Some(image) = rc.file_infos.iter().find(|f| is_image(&f.filename)) else {
            return;
        };
        let result = async {
            let url = self
                .client
                .generate_record_thumbnail_upload_url(record_name, 3600)
                .await?;
            if let Some(url) = url {
                self.client.upload_file(&image.filepath, &url).await?;
            }
            Ok::<_, AgentError>(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(record = record_name, error = %err, "thumbnail upload failed");
        }
    }

    async fn create_record_and_events(&self, rc: &RecordCache) -> Result<Value> {
        let title = self.record_title(rc);
        let description = self.record_description(&title, rc);
        let record = create_or_get_record(
            self.client.as_ref(),
            &title,
            &description,
            &rc.labels,
            self.device_name(),
            rc.record_name(),
        )
        .await?;
        let record_name = record
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Api("created record has no name".into()))?;

        self.upload_record_thumbnail(record_name, rc).await;

        for moment in &rc.moments {
            let display_name = if moment.title.is_empty() {
                title.as_str()
            } else {
                moment.title.as_str()
            };
            let moment_description = if moment.description.is_empty() {
                title.as_str()
            } else {
                moment.description.as_str()
            };
            self.client
                .create_event(
                    record_name,
                    display_name,
                    moment.timestamp as f64 / 1000.0,
                    moment_description,
                    &moment.metadata,
                    self.device_name(),
                    moment.duration as f64 / 1000.0,
                )
                .await?;

            if let Some(task) = &moment.task {
                self.client
                    .create_task(
                        record_name,
                        display_name,
                        moment_description,
                        task.assignee.as_deref(),
                    )
                    .await?;
            }
        }
        Ok(record)
    }

    /// Collect source files into the cache dir as hardlinks and freeze their
    /// size and hash.
    fn collect_files(&self, rc: &mut RecordCache) -> Result<()> {
        let base_dir = rc.base_dir();
        let mut collected = Vec::new();
        for info in &rc.file_infos {
            if !info.filepath.is_file() || info.filename == FINISH_FLAG {
                continue;
            }
            let target = hardlink(&info.filepath, &base_dir.join(&info.filename))?;
            let mut linked = FileInfo::with_filename(target, info.filename.clone());
            linked.complete(CompleteOptions::default())?;
            collected.push(linked);
        }
        rc.file_infos = collected;
        Ok(())
    }

    async fn upload_finish_flag(&self, record_name: &str, rc: &RecordCache) -> Result<bool> {
        let flag_path = rc.base_dir().join(FINISH_FLAG);
        if !flag_path.exists() {
            std::fs::write(&flag_path, serde_json::to_string_pretty(&rc.files)?)?;
        }

        let mut info = FileInfo::new(&flag_path);
        info.complete(CompleteOptions::default())?;
        resumable_upload_files(
            self.client.as_ref(),
            Arc::clone(&self.meter),
            record_name,
            std::slice::from_mut(&mut info),
            true,
        )
        .await
    }

    /// Close out a record that has nothing (left) to upload.
    async fn skip_record(&self, rc: &mut RecordCache, reason: &str) -> Result<()> {
        tracing::warn!(key = %rc.key(), reason, "skipping record");
        if let Some(task_name) = rc.task_name().map(str::to_string) {
            if let Err(err) = self.client.update_task_state(&task_name, "SUCCEEDED").await {
                tracing::warn!(task = %task_name, error = %err, "failed to close task");
            }
        }
        rc.skipped = true;
        rc.save_state()?;
        rc.delete_cache_dir(self.conf.delete_after_interval_in_hours);
        Ok(())
    }

    /// Advance one record as far as possible this tick.
    pub async fn handle_record(&self, rc: &mut RecordCache) -> Result<()> {
        tracing::debug!(key = %rc.key(), "checking record");
        self.client.set_active_project(rc.project_name.clone());

        if rc.skipped {
            tracing::debug!(key = %rc.key(), "record previously skipped");
            return Ok(());
        }

        let over_limit = rc.record_name().is_none()
            && rc
                .event_code
                .as_deref()
                .is_some_and(|code| self.code_mgr.is_over_limit(code));
        if over_limit {
            return self.skip_record(rc, "event code over limit").await;
        }

        if rc.record_name().is_none() {
            self.collect_files(rc)?;
            if rc.file_infos.is_empty() {
                // sources vanished before materialization finished
                return self.skip_record(rc, "no files left to collect").await;
            }

            let record = self.create_record_and_events(rc).await?;
            rc.record = record;
            // persist immediately: losing the link now must not create a
            // second remote record on the next sweep
            rc.save_state()?;
            if let Some(code) = rc.event_code.clone() {
                self.code_mgr.hit(&code);
            }
        }

        if !rc.uploaded {
            let record_name = rc
                .record_name()
                .map(str::to_string)
                .ok_or_else(|| AgentError::Internal("record in created state has no name".into()))?;

            let present: std::collections::HashSet<PathBuf> =
                rc.list_files().into_iter().collect();
            rc.file_infos.retain(|f| present.contains(&f.filepath));

            let all_completed = resumable_upload_files(
                self.client.as_ref(),
                Arc::clone(&self.meter),
                &record_name,
                &mut rc.file_infos,
                true,
            )
            .await?;
            if !all_completed {
                return Ok(());
            }

            if !self.upload_finish_flag(&record_name, rc).await? {
                tracing::error!(key = %rc.key(), "failed to upload finish flag");
                return Ok(());
            }

            let mut labels = rc.labels.clone();
            labels.push(UPLOAD_COMPLETE_LABEL.to_string());
            self.client
                .update_record(&record_name, None, None, &labels)
                .await?;

            if let Some(task_name) = rc.task_name().map(str::to_string) {
                self.client
                    .put_task_tags(
                        &task_name,
                        &BTreeMap::from([("recordName".to_string(), record_name.clone())]),
                    )
                    .await?;
                self.client.update_task_state(&task_name, "SUCCEEDED").await?;
            }

            rc.uploaded = true;
            rc.save_state()?;
            tracing::info!(key = %rc.key(), "record handled");

            if self.conf.delete_after_upload {
                rc.delete_cache_dir(0);
            }
        }
        Ok(())
    }

    /// One sweep over every record dir. Per-record failures are isolated;
    /// only `Unauthorized` escapes so the outer loop can re-auth.
    pub async fn run(&self) -> Result<usize> {
        let records_root = self.paths.records_dir();
        tracing::info!(root = %records_root.display(), "searching for records");

        let mut total_records = 0usize;
        for mut rc in RecordCache::find_all(&records_root)? {
            match self.handle_record(&mut rc).await {
                Ok(()) => total_records += 1,
                Err(AgentError::Unauthorized) => {
                    tracing::error!(key = %rc.key(), "unauthorized while handling record");
                    return Err(AgentError::Unauthorized);
                }
                Err(err) => {
                    tracing::error!(key = %rc.key(), error = %err, "error handling record");
                }
            }
            // regardless of the outcome, expire old cache dirs
            rc.delete_cache_dir(self.conf.delete_after_interval_in_hours);
        }

        if let Some(device_name) = self.device_name() {
            let usage = self.meter.snapshot();
            match self
                .client
                .send_heartbeat(device_name, &self.agent_version, usage)
                .await
            {
                Ok(()) => self.meter.reset(),
                Err(err) => tracing::warn!(error = %err, "heartbeat failed"),
            }
        }

        if let Err(err) = self
            .client
            .counter("coscout_collector_run_successful_total", 1)
            .await
        {
            tracing::debug!(error = %err, "counter emit failed");
        }
        if let Err(err) = self
            .client
            .gauge("coscout_collector_record_cache_count", total_records as f64)
            .await
        {
            tracing::debug!(error = %err, "gauge emit failed");
        }
        Ok(total_records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockPlatformClient;
    use magpie_config::EventCodeConfig;
    use serde_json::json;

    fn over_limit_mgr(dir: &Path, codes: &[(&str, i64)]) -> Arc<EventCodeManager> {
        let conf = EventCodeConfig {
            enabled: true,
            whitelist: codes
                .iter()
                .map(|(code, limit)| (code.to_string(), *limit))
                .collect(),
            reset_interval_in_secs: 86_400,
            code_json_url: String::new(),
        };
        Arc::new(EventCodeManager::with_table(
            conf,
            dir.join("code_limit.state.json"),
            Default::default(),
        ))
    }

    fn collector(
        paths: &AgentPaths,
        client: MockPlatformClient,
        code_mgr: Arc<EventCodeManager>,
    ) -> Collector {
        Collector::new(
            CollectorConfig::default(),
            Arc::new(client),
            code_mgr,
            paths.clone(),
            NetworkMeter::new(),
            "0.1.0-test".into(),
        )
    }

    #[tokio::test]
    async fn over_limit_record_is_skipped_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        let code_mgr = over_limit_mgr(dir.path(), &[("X", 0)]);

        let mut client = MockPlatformClient::new();
        client.expect_set_active_project().return_const(());
        client.expect_create_record().never();
        client
            .expect_update_task_state()
            .times(1)
            .returning(|task, state| {
                assert_eq!(task, "projects/p/tasks/t1");
                assert_eq!(state, "SUCCEEDED");
                Ok(())
            });

        let mut rc = RecordCache::new(&paths.records_dir(), 1_700_000_000_000, Some("X".into()));
        rc.task = json!({"name": "projects/p/tasks/t1"});
        rc.save_state().unwrap();

        let collector = collector(&paths, client, code_mgr);
        collector.handle_record(&mut rc).await.unwrap();

        assert!(rc.skipped);
        let on_disk = RecordCache::load_from_disk(&rc.state_path(), &paths.records_dir()).unwrap();
        assert!(on_disk.skipped);
    }

    #[tokio::test]
    async fn empty_file_set_skips_and_closes_task() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        let code_mgr = over_limit_mgr(dir.path(), &[]);

        let mut client = MockPlatformClient::new();
        client.expect_set_active_project().return_const(());
        client.expect_create_record().never();
        client
            .expect_update_task_state()
            .times(1)
            .returning(|_, state| {
                assert_eq!(state, "SUCCEEDED");
                Ok(())
            });

        let mut rc = RecordCache::new(&paths.records_dir(), 1_700_000_000_000, None);
        rc.task = json!({"name": "projects/p/tasks/t2"});
        rc.files = vec!["/nonexistent/source.bag".into()];
        rc.sync_files();
        rc.save_state().unwrap();

        let collector = collector(&paths, client, code_mgr);
        collector.handle_record(&mut rc).await.unwrap();
        assert!(rc.skipped);
    }

    #[tokio::test]
    async fn record_creation_persists_before_upload_failures() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        let code_mgr = over_limit_mgr(dir.path(), &[("42", 5)]);

        let source = dir.path().join("payload.bag");
        std::fs::write(&source, "bag data").unwrap();

        let mut client = MockPlatformClient::new();
        client.expect_set_active_project().return_const(());
        client.expect_create_record().times(1).returning(|title, _, _, _| {
            assert!(title.contains("(42)"));
            Ok(json!({"name": "projects/p/records/r1", "title": title, "head": {}}))
        });
        client
            .expect_generate_record_thumbnail_upload_url()
            .never();
        // the store endpoint is unreachable: upload fails after creation
        client
            .expect_generate_security_token()
            .returning(|_, _| Err(AgentError::Connection("store down".into())));

        let mut rc = RecordCache::new(&paths.records_dir(), 1_700_000_000_000, Some("42".into()));
        rc.file_infos = vec![FileInfo::new(&source)];
        rc.sync_files();
        rc.save_state().unwrap();

        let collector = collector(&paths, client, code_mgr);
        let err = collector.handle_record(&mut rc).await.unwrap_err();
        assert!(matches!(err, AgentError::Connection(_)));

        // the created record survived on disk: no second create next sweep
        let on_disk = RecordCache::load_from_disk(&rc.state_path(), &paths.records_dir()).unwrap();
        assert_eq!(on_disk.record_name(), Some("projects/p/records/r1"));
        assert!(!on_disk.uploaded);
        // the payload was hardlinked into the cache dir and frozen
        assert_eq!(on_disk.file_infos.len(), 1);
        assert!(on_disk.file_infos[0].filepath.starts_with(rc.base_dir()));
        assert!(on_disk.file_infos[0].is_completed());
    }

    #[tokio::test]
    async fn title_prefers_record_then_task() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        let code_mgr = over_limit_mgr(dir.path(), &[]);
        let collector = collector(&paths, MockPlatformClient::new(), code_mgr);

        let mut rc = RecordCache::new(&paths.records_dir(), 1_234_567_890_000, Some("7".into()));
        rc.record = json!({"title": "from record"});
        rc.task = json!({"title": "from task"});
        assert_eq!(collector.record_title(&rc), "from record");

        rc.record = json!({});
        assert_eq!(collector.record_title(&rc), "from task");

        rc.task = json!({});
        assert_eq!(
            collector.record_title(&rc),
            "未知错误 (7) @ 2009-02-13T23:31:30"
        );
    }

    #[tokio::test]
    async fn description_embeds_device_labels() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());

        let mut state = ApiClientState::default();
        state.device = json!({
            "name": "devices/d1",
            "labels": [{"displayName": "fleet::beta"}],
        });
        state.save(&paths).unwrap();

        let code_mgr = over_limit_mgr(dir.path(), &[]);
        let collector = collector(&paths, MockPlatformClient::new(), code_mgr);

        let rc = RecordCache::new(&paths.records_dir(), 1_700_000_000_000, None);
        let description = collector.record_description("my title", &rc);
        assert!(description.starts_with("### my title\n"));
        assert!(description.contains("fleet::beta"));
    }
}
