//! Platform-dispatched upload tasks.
//!
//! Operators can request an upload window from the platform side; the task
//! arrives with a start/end time. The handler resolves the configured
//! upload paths against that window (directories filtered by mtime) and
//! materializes a record cache the collector then drives like any other.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::Utc;
use serde_json::{json, Value};

use crate::api::PlatformClient;
use crate::auth::{iso_to_timestamp, ApiClientState};
use crate::error::Result;
use crate::model::{FileInfo, RecordCache};
use crate::paths::AgentPaths;

pub struct TaskHandler {
    client: Arc<dyn PlatformClient>,
    paths: AgentPaths,
    upload_files: Vec<String>,
}

impl std::fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandler")
            .field("upload_files", &self.upload_files)
            .finish_non_exhaustive()
    }
}

impl TaskHandler {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        paths: AgentPaths,
        upload_files: Vec<String>,
    ) -> Self {
        Self {
            client,
            paths,
            upload_files,
        }
    }

    /// One poll: fetch pending tasks and materialize each.
    pub async fn run(&self) -> Result<()> {
        let state = ApiClientState::load(&self.paths);
        let Some(device_name) = state.device_name() else {
            tracing::debug!("device name not found, skipping task poll");
            return Ok(());
        };

        let tasks = self.client.list_device_tasks(device_name, "PENDING").await?;
        tracing::info!(count = tasks.len(), "checked pending upload tasks");
        for task in tasks {
            if let Err(err) = self.handle_upload_task(&task).await {
                tracing::error!(error = %err, "failed to handle upload task");
            }
        }
        Ok(())
    }

    async fn handle_upload_task(&self, task: &Value) -> Result<()> {
        let Some(task_name) = task.get("name").and_then(|v| v.as_str()) else {
            tracing::warn!("task without name, skipping");
            return Ok(());
        };

        let detail = task.get("uploadTaskDetail").cloned().unwrap_or(Value::Null);
        let start_time = parse_time(detail.get("startTime"));
        let end_time = parse_time(detail.get("endTime"));

        self.client.update_task_state(task_name, "PROCESSING").await?;

        let mut files = Vec::new();
        for entry in &self.upload_files {
            let path = PathBuf::from(entry);
            if !path.exists() {
                tracing::warn!(path = %path.display(), "upload path not found, skipping");
                continue;
            }
            if path.is_dir() {
                files.extend(resolve_dir(&path, start_time, end_time));
            } else if path.is_file() {
                files.push(FileInfo::new(&path));
            }
        }

        if files.is_empty() {
            tracing::info!(task = task_name, "no files found, closing task");
            self.client.update_task_state(task_name, "SUCCEEDED").await?;
            return Ok(());
        }
        let files = unique_by_filename(files);

        // task: warehouses/x/projects/y/tasks/z; the project prefix scopes
        // the record
        let project_name = task_name
            .split("/tasks/")
            .next()
            .unwrap_or_default()
            .to_string();
        let task_id = task_name.rsplit('/').next().unwrap_or_default().to_string();

        let mut rc = RecordCache::new(
            &self.paths.records_dir(),
            Utc::now().timestamp_millis(),
            Some(task_id),
        );
        rc.load_existing_state()?;
        rc.project_name = Some(project_name);
        rc.task = json!({
            "name": task_name,
            "title": task.get("title").and_then(|v| v.as_str()).unwrap_or_default(),
        });
        rc.file_infos = files;
        rc.sync_files();
        rc.save_state()?;
        tracing::info!(task = task_name, state = %rc.state_path().display(), "materialized upload task");
        Ok(())
    }
}

fn parse_time(value: Option<&Value>) -> f64 {
    value
        .and_then(|v| v.as_str())
        .and_then(iso_to_timestamp)
        .unwrap_or(0) as f64
}

/// Files under `dir` whose mtime falls inside the task window, named
/// relative to the directory.
fn resolve_dir(dir: &Path, start_time: f64, end_time: f64) -> Vec<FileInfo> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        let mtime = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        if mtime < start_time || mtime > end_time {
            continue;
        }
        let filename = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        files.push(FileInfo::with_filename(entry.path(), filename));
    }
    files
}

/// First occurrence of each filename wins.
fn unique_by_filename(files: Vec<FileInfo>) -> Vec<FileInfo> {
    let mut seen = std::collections::HashSet::new();
    files
        .into_iter()
        .filter(|f| seen.insert(f.filename.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockPlatformClient;
    use std::fs;

    fn save_device_state(paths: &AgentPaths) {
        let mut state = ApiClientState::default();
        state.device = json!({"name": "devices/d1"});
        state.save(paths).unwrap();
    }

    #[tokio::test]
    async fn missing_device_skips_poll() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        let client = MockPlatformClient::new();
        let handler = TaskHandler::new(Arc::new(client), paths, vec![]);
        handler.run().await.unwrap();
    }

    #[tokio::test]
    async fn task_with_no_files_succeeds_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        save_device_state(&paths);

        let mut client = MockPlatformClient::new();
        client.expect_list_device_tasks().returning(|_, state| {
            assert_eq!(state, "PENDING");
            Ok(vec![json!({"name": "warehouses/w/projects/p/tasks/t1", "title": "grab data"})])
        });
        let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        client
            .expect_update_task_state()
            .times(2)
            .returning(move |_, state| {
                sink.lock().push(state.to_string());
                Ok(())
            });

        let handler = TaskHandler::new(Arc::new(client), paths.clone(), vec![]);
        handler.run().await.unwrap();

        assert_eq!(*states.lock(), vec!["PROCESSING", "SUCCEEDED"]);
        assert!(RecordCache::find_all(&paths.records_dir()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_materializes_record_with_window_filtered_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        save_device_state(&paths);

        let data_dir = dir.path().join("data");
        fs::create_dir_all(data_dir.join("sub")).unwrap();
        fs::write(data_dir.join("recent.bag"), "x").unwrap();
        fs::write(data_dir.join("sub/nested.log"), "y").unwrap();
        let single = dir.path().join("robot.cfg");
        fs::write(&single, "z").unwrap();

        let mut client = MockPlatformClient::new();
        client.expect_list_device_tasks().returning(|_, _| {
            Ok(vec![json!({
                "name": "warehouses/w/projects/p/tasks/t9",
                "title": "grab data",
                "uploadTaskDetail": {
                    "startTime": "2020-01-01T00:00:00Z",
                    "endTime": "2099-01-01T00:00:00Z",
                },
            })])
        });
        client
            .expect_update_task_state()
            .times(1)
            .returning(|_, state| {
                assert_eq!(state, "PROCESSING");
                Ok(())
            });

        let handler = TaskHandler::new(
            Arc::new(client),
            paths.clone(),
            vec![
                data_dir.to_string_lossy().into_owned(),
                single.to_string_lossy().into_owned(),
            ],
        );
        handler.run().await.unwrap();

        let records = RecordCache::find_all(&paths.records_dir()).unwrap();
        assert_eq!(records.len(), 1);
        let rc = &records[0];
        assert_eq!(rc.event_code.as_deref(), Some("t9"));
        assert_eq!(rc.project_name.as_deref(), Some("warehouses/w/projects/p"));
        assert_eq!(rc.task["name"], "warehouses/w/projects/p/tasks/t9");

        let names: Vec<_> = rc.file_infos.iter().map(|f| f.filename.clone()).collect();
        assert!(names.contains(&"recent.bag".to_string()));
        assert!(names.iter().any(|n| n.ends_with("nested.log")));
        assert!(names.contains(&"robot.cfg".to_string()));
    }

    #[test]
    fn duplicate_filenames_keep_first() {
        let files = vec![
            FileInfo::with_filename("/a/x.log", "x.log"),
            FileInfo::with_filename("/b/x.log", "x.log"),
            FileInfo::with_filename("/b/y.log", "y.log"),
        ];
        let unique = unique_by_filename(files);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].filepath, PathBuf::from("/a/x.log"));
    }
}
