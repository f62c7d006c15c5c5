//! The default collection mod.
//!
//! Watches the configured base dirs, keeps the file-state index current,
//! streams unprocessed static files and live log lines through the rule
//! pipeline, and turns the pipeline's upload requests into record cache
//! dirs once their cut window has closed.
//!
//! Upload requests are JSON files named `<uuid>.json` in the mod state dir.
//! `flag=false` means the window is assigned but files are not yet gathered;
//! materialization flips it to `true` after copying/slicing/zipping the
//! overlapping files into a per-request temp dir.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{AgentMod, ModInit};
use crate::api::PlatformClient;
use crate::error::{AgentError, Result};
use crate::index::{log, FileStateIndex};
use crate::model::{FileInfo, RawDevice, RecordCache};
use crate::paths::AgentPaths;
use crate::rules::{LogTailFollower, RuleExecutor, UploadFn, UploadWindow};

const MOD_DIR_NAME: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DefaultModConfig {
    enabled: bool,
    base_dirs: Vec<String>,
    sn_file: Option<String>,
    sn_field: Option<String>,
    ros2_customized_msgs_dirs: Vec<String>,
    upload_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequestRecordSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CutSpec {
    /// Seconds since epoch.
    pub start: i64,
    pub end: i64,
    #[serde(rename = "extraFiles")]
    pub extra_files: Vec<String>,
}

/// The on-disk upload-request schema shared between the rule pipeline (the
/// producer) and this mod's materializer (the consumer).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadRequest {
    pub flag: bool,
    #[serde(rename = "projectName", skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Milliseconds since epoch; assigned at materialization.
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    pub record: RequestRecordSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cut: Option<CutSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bag: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dirs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub zips: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paths_to_delete: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
}

impl UploadRequest {
    fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, path: &Path) -> Result<()> {
        crate::model::save_json(path, self)
    }
}

/// Write a pending upload request for a cut window; consumed by
/// [`DefaultMod::run`] once the window closes.
pub fn dump_upload_request(state_dir: &Path, window: &UploadWindow) -> Result<()> {
    if window.before_minutes < 0 && window.after_minutes < 0 {
        return Err(AgentError::Internal(
            "upload window must extend in at least one direction".into(),
        ));
    }
    let request = UploadRequest {
        flag: false,
        project_name: Some(window.project_name.clone()),
        record: RequestRecordSpec {
            title: (!window.title.is_empty()).then(|| window.title.clone()),
            description: (!window.description.is_empty()).then(|| window.description.clone()),
            labels: (!window.labels.is_empty()).then(|| window.labels.clone()),
        },
        cut: Some(CutSpec {
            start: window.trigger_ts - window.before_minutes * 60,
            end: window.trigger_ts + window.after_minutes * 60,
            extra_files: window.extra_files.clone(),
        }),
        ..Default::default()
    };
    request.save(&state_dir.join(format!("{}.json", Uuid::new_v4())))
}

pub struct DefaultMod {
    client: Arc<dyn PlatformClient>,
    conf: DefaultModConfig,
    paths: AgentPaths,
    index: Arc<FileStateIndex>,
    handle: tokio::runtime::Handle,
    stop: Arc<AtomicBool>,
    workers_started: AtomicBool,
}

impl std::fmt::Debug for DefaultMod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultMod")
            .field("enabled", &self.conf.enabled)
            .field("base_dirs", &self.conf.base_dirs)
            .finish_non_exhaustive()
    }
}

impl DefaultMod {
    pub fn factory(init: ModInit) -> Result<Arc<dyn AgentMod>> {
        let conf: DefaultModConfig = if init.conf.is_null() {
            DefaultModConfig::default()
        } else {
            serde_json::from_value(init.conf.clone())
                .map_err(|err| AgentError::ConfigValidation(format!("mod.conf: {err}")))?
        };
        let index = FileStateIndex::new(
            init.paths.file_state(),
            &conf.ros2_customized_msgs_dirs,
        );
        Ok(Arc::new(Self {
            client: init.client,
            conf,
            paths: init.paths,
            index,
            handle: init.handle,
            stop: init.stop,
            workers_started: AtomicBool::new(false),
        }))
    }

    fn state_dir(&self) -> PathBuf {
        self.paths.mod_state_dir(MOD_DIR_NAME)
    }

    fn temp_dir(&self) -> PathBuf {
        self.paths.mod_temp_dir(MOD_DIR_NAME)
    }

    fn base_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for dir in &self.conf.base_dirs {
            let path = PathBuf::from(dir);
            fs::create_dir_all(&path)?;
            dirs.push(path);
        }
        Ok(dirs)
    }

    fn upload_fn(&self) -> UploadFn {
        let state_dir = self.state_dir();
        Arc::new(move |window| dump_upload_request(&state_dir, &window))
    }

    fn spawn_workers(&self, base_dirs: &[PathBuf]) {
        if self.workers_started.swap(true, Ordering::SeqCst) {
            return;
        }

        // log tail follower: lives on a worker thread for the agent's
        // lifetime, feeding live lines through its own rule executor
        let follower = LogTailFollower::new(base_dirs.to_vec(), Arc::clone(&self.stop));
        let client = Arc::clone(&self.client);
        let paths = self.paths.clone();
        let upload_fn = self.upload_fn();
        let handle = self.handle.clone();
        self.handle.spawn_blocking(move || {
            let mut executor = RuleExecutor::new(
                "log tail executor",
                client,
                paths,
                upload_fn,
                handle,
            );
            executor.consume(follower);
            tracing::info!("log tail executor stopped");
        });
        tracing::info!("started log tail worker");

        // task handler: polls pending platform upload tasks
        let handler = super::TaskHandler::new(
            Arc::clone(&self.client),
            self.paths.clone(),
            self.conf.upload_files.clone(),
        );
        let stop = Arc::clone(&self.stop);
        self.handle.spawn(async move {
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = handler.run().await {
                    tracing::warn!(error = %err, "task handler pass failed");
                }
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
            tracing::info!("task handler stopped");
        });
        tracing::info!("started task handler worker");
    }

    /// Drain unprocessed static files through the rule pipeline.
    async fn diagnose_static_files(&self, base_dirs: &[PathBuf]) {
        for dir in base_dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Some(stream) = self.index.take_unprocessed(&path) else {
                    continue;
                };

                let client = Arc::clone(&self.client);
                let paths = self.paths.clone();
                let upload_fn = self.upload_fn();
                let handle = self.handle.clone();
                let name = format!("{} rule executor", path.display());
                let result = tokio::task::spawn_blocking(move || {
                    let mut executor =
                        RuleExecutor::new(name, client, paths, upload_fn, handle);
                    executor.consume(stream);
                })
                .await;
                if let Err(err) = result {
                    tracing::error!(path = %path.display(), error = %err, "static diagnosis worker panicked");
                }
            }
        }
    }

    /// Gather the files overlapping a closed cut window into the request's
    /// temp dir, then flip `flag`.
    fn materialize_request(&self, request_path: &Path, base_dirs: &[PathBuf]) -> Result<()> {
        let mut request = UploadRequest::load(request_path)?;
        if request.flag {
            return Ok(());
        }
        let Some(cut) = request.cut.clone() else {
            return Ok(());
        };
        if Utc::now().timestamp() < cut.end {
            return Ok(());
        }

        self.index.update_dirs(base_dirs);

        let request_id = request_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_files_dir = self.temp_dir().join(&request_id);
        fs::create_dir_all(&temp_files_dir)?;

        let mut raw_files: Vec<PathBuf> = Vec::new();
        let mut raw_dirs: Vec<PathBuf> = Vec::new();
        for dir in base_dirs {
            raw_files.extend(self.index.get_files(dir, cut.start, cut.end, false));
            raw_dirs.extend(self.index.get_files(dir, cut.start, cut.end, true));
        }
        raw_files.extend(cut.extra_files.iter().map(PathBuf::from));
        tracing::info!(
            request = %request_id,
            files = raw_files.len(),
            dirs = raw_dirs.len(),
            start = cut.start,
            end = cut.end,
            "materializing cut window"
        );

        let mut bag_files = Vec::new();
        let mut log_files = Vec::new();
        let mut other_files = Vec::new();
        let mut dirs = Vec::new();
        let mut zips = Vec::new();

        for dir in raw_dirs {
            let target = temp_files_dir.join(dir.file_name().unwrap_or_default());
            match copy_dir_recursively(&dir, &target) {
                Ok(()) => dirs.push(target.to_string_lossy().into_owned()),
                Err(err) => {
                    tracing::error!(path = %dir.display(), error = %err, "failed to copy dir")
                }
            }
        }

        for file in raw_files {
            let result = (|| -> Result<()> {
                if file.is_file() {
                    let name = file.file_name().unwrap_or_default();
                    if file.extension().and_then(|e| e.to_str()) == Some("bag") {
                        let target = temp_files_dir.join(name);
                        fs::copy(&file, &target)?;
                        bag_files.push(target.to_string_lossy().into_owned());
                    } else if file.to_string_lossy().ends_with(".log") {
                        let target =
                            log::prepare_cut(&file, &temp_files_dir, cut.start, cut.end)?;
                        log_files.push(target.to_string_lossy().into_owned());
                    } else {
                        let target = temp_files_dir.join(name);
                        fs::copy(&file, &target)?;
                        other_files.push(target.to_string_lossy().into_owned());
                    }
                } else if file.is_dir() {
                    let name = file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let target = temp_files_dir.join(format!("{name}.zip"));
                    zip_directory(&file, &target)?;
                    zips.push(target.to_string_lossy().into_owned());
                }
                Ok(())
            })();
            if let Err(err) = result {
                tracing::error!(path = %file.display(), error = %err, "cut file failed");
            }
        }

        request.bag = bag_files;
        request.log = log_files;
        request.files = other_files;
        request.dirs = dirs;
        request.zips = zips;
        request.flag = true;
        request.start_time =
            Some(Utc::now().timestamp_millis() + rand::rng().random_range(1..=1000));
        request.paths_to_delete = vec![temp_files_dir.to_string_lossy().into_owned()];
        request.save(request_path)
    }

    /// Convert a materialized request into a record cache dir and mark the
    /// request consumed.
    fn handle_request(&self, request_path: &Path) -> Result<()> {
        let mut request = UploadRequest::load(request_path)?;
        if !request.flag || request.uploaded.is_some() || request.skipped.is_some() {
            tracing::debug!(path = %request_path.display(), "skipping upload request");
            return Ok(());
        }
        let Some(timestamp) = request.start_time else {
            return Ok(());
        };

        let mut rc = RecordCache::new(&self.paths.records_dir(), timestamp, None);
        rc.load_existing_state()?;
        rc.project_name = request.project_name.clone().filter(|p| !p.is_empty());

        // keep the request itself with the record for traceability
        let request_copy = rc.base_dir().join(request_path.file_name().unwrap_or_default());
        if !request_copy.exists() {
            if let Some(parent) = request_copy.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(request_path, &request_copy)?;
        }

        let mut file_infos = vec![FileInfo::new(&request_copy)];
        let mut seen: std::collections::HashSet<String> =
            file_infos.iter().map(|f| f.filename.clone()).collect();
        let mut push = |info: FileInfo| {
            if seen.insert(info.filename.clone()) {
                file_infos.push(info);
            }
        };

        for (group, paths) in [
            ("bag", &request.bag),
            ("log", &request.log),
            ("files", &request.files),
        ] {
            for filepath in paths {
                let name = Path::new(filepath)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                push(FileInfo::with_filename(filepath, format!("{group}/{name}")));
            }
        }
        for filepath in &request.zips {
            let name = Path::new(filepath)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            push(FileInfo::with_filename(filepath, name));
        }
        for dir in &request.dirs {
            let dir = PathBuf::from(dir);
            let anchor = dir.parent().unwrap_or(&dir).to_path_buf();
            for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&anchor)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .into_owned();
                push(FileInfo::with_filename(entry.path(), relative));
            }
        }

        rc.file_infos = file_infos;
        rc.record = serde_json::json!({
            "title": request
                .record
                .title
                .clone()
                .unwrap_or_else(|| format!("Device Auto Upload - {timestamp}")),
            "description": request
                .record
                .description
                .clone()
                .unwrap_or_else(|| "Device Auto Upload".to_string()),
        });
        rc.labels = request.record.labels.clone().unwrap_or_default();
        rc.paths_to_delete = request.paths_to_delete.clone();
        rc.save_state()?;
        tracing::info!(state = %rc.state_path().display(), "converted upload request to record");

        request.uploaded = Some(true);
        request.save(request_path)
    }

    fn find_upload_requests(&self) -> Vec<PathBuf> {
        let mut requests: Vec<PathBuf> = walkdir::WalkDir::new(self.state_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .map(|e| e.into_path())
            .collect();
        requests.sort();
        requests
    }

    fn generated_device(&self) -> Result<RawDevice> {
        let sn_path = self.paths.generated_sn_file();
        if !sn_path.is_file() {
            if let Some(parent) = sn_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&sn_path, Uuid::new_v4().simple().to_string()).map_err(|err| {
                AgentError::DeviceNotFound(format!("access to {} denied: {err}", sn_path.display()))
            })?;
        }
        let sn = fs::read_to_string(&sn_path)?.trim().to_string();
        let node = hostname();
        Ok(RawDevice {
            display_name: format!("{node}@{sn}"),
            description: format!("node: {node}, sn: {sn}"),
            serial_number: sn,
            labels: Vec::new(),
        })
    }
}

#[async_trait::async_trait]
impl AgentMod for DefaultMod {
    fn name(&self) -> &'static str {
        MOD_DIR_NAME
    }

    fn get_device(&self) -> Result<RawDevice> {
        let Some(sn_file) = self.conf.sn_file.as_deref().filter(|f| !f.is_empty()) else {
            return self.generated_device();
        };
        let sn_path = Path::new(sn_file);
        if !sn_path.exists() {
            return self.generated_device();
        }

        let extension = sn_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if extension == "txt" {
            let sn = fs::read_to_string(sn_path)?.trim().to_string();
            return Ok(RawDevice {
                display_name: sn.clone(),
                description: sn.clone(),
                serial_number: sn,
                labels: Vec::new(),
            });
        }

        if matches!(extension, "json" | "yaml" | "yml") {
            if let Some(field) = self.conf.sn_field.as_deref().filter(|f| !f.is_empty()) {
                let text = fs::read_to_string(sn_path)?;
                let data: Value = serde_yaml::from_str(&text)
                    .map_err(|err| AgentError::DeviceNotFound(format!("bad sn file: {err}")))?;
                let sn = lookup_dotted(&data, field)
                    .and_then(value_as_string)
                    .ok_or_else(|| {
                        AgentError::DeviceNotFound(format!(
                            "failed to get {field} from {}",
                            sn_path.display()
                        ))
                    })?;
                return Ok(RawDevice {
                    display_name: sn.clone(),
                    description: sn.clone(),
                    serial_number: sn,
                    labels: Vec::new(),
                });
            }
        }
        self.generated_device()
    }

    /// The remote table is either `[{code, messageCN}]` or `{msg: [...]}`.
    fn convert_code(&self, code_json: &Value) -> BTreeMap<String, String> {
        let items = match code_json {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => map
                .get("msg")
                .and_then(|v| v.as_array())
                .map(|v| v.as_slice())
                .unwrap_or_default(),
            _ => &[],
        };
        items
            .iter()
            .map(|item| {
                let code = item
                    .get("code")
                    .map(json_scalar_to_string)
                    .unwrap_or_default();
                let message = item
                    .get("messageCN")
                    .and_then(|v| v.as_str())
                    .unwrap_or("未知错误")
                    .to_string();
                (code, message)
            })
            .collect()
    }

    async fn run(&self) -> Result<()> {
        if !self.conf.enabled {
            tracing::info!("default mod is not enabled, skipping");
            return Ok(());
        }
        if self.conf.base_dirs.is_empty() {
            tracing::info!("default mod base dirs is empty, skipping");
            return Ok(());
        }

        let base_dirs = self.base_dirs()?;
        fs::create_dir_all(self.state_dir())?;
        fs::create_dir_all(self.temp_dir())?;
        self.spawn_workers(&base_dirs);

        // refresh the index and diagnose new static files
        self.index.update_dirs(&base_dirs);
        self.diagnose_static_files(&base_dirs).await;

        // advance pending upload requests
        for request_path in self.find_upload_requests() {
            if let Err(err) = self.materialize_request(&request_path, &base_dirs) {
                tracing::error!(path = %request_path.display(), error = %err, "failed to materialize request");
                continue;
            }
            if let Err(err) = self.handle_request(&request_path) {
                tracing::error!(path = %request_path.display(), error = %err, "failed to handle request");
            }
        }
        Ok(())
    }
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "robot".to_string())
}

fn lookup_dotted<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn copy_dir_recursively(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|err| AgentError::Internal(err.to_string()))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Zip `src_dir` into `dst`, keeping the directory's name as the archive
/// root.
fn zip_directory(src_dir: &Path, dst: &Path) -> Result<()> {
    use std::io::Write;

    let root = src_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = fs::File::create(dst)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(src_dir) {
        let entry = entry.map_err(|err| AgentError::Internal(err.to_string()))?;
        let relative = entry.path().strip_prefix(src_dir).unwrap_or(entry.path());
        let name = if relative.as_os_str().is_empty() {
            PathBuf::from(&root)
        } else {
            Path::new(&root).join(relative)
        };
        let name = name.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|err| AgentError::Internal(err.to_string()))?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(name, options)
                .map_err(|err| AgentError::Internal(err.to_string()))?;
            let data = fs::read(entry.path())?;
            writer.write_all(&data)?;
        }
    }
    writer
        .finish()
        .map_err(|err| AgentError::Internal(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockPlatformClient;
    use serde_json::json;

    fn build_mod(dir: &Path, conf: Value) -> Arc<dyn AgentMod> {
        let init = ModInit {
            client: Arc::new(MockPlatformClient::new()),
            conf,
            paths: AgentPaths::rooted(dir),
            handle: tokio::runtime::Handle::current(),
            // pre-stopped so background workers exit right away in tests
            stop: Arc::new(AtomicBool::new(true)),
        };
        DefaultMod::factory(init).unwrap()
    }

    fn default_mod(dir: &Path, watched: &Path) -> Arc<dyn AgentMod> {
        build_mod(
            dir,
            json!({
                "enabled": true,
                "base_dirs": [watched.to_string_lossy()],
            }),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_request_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let window = UploadWindow {
            trigger_ts: 1_700_000_000,
            before_minutes: 2,
            after_minutes: 1,
            title: "hot motor".into(),
            description: String::new(),
            labels: vec!["auto".into()],
            extra_files: vec!["/data/extra.cfg".into()],
            project_name: "warehouses/w/projects/p".into(),
        };
        dump_upload_request(dir.path(), &window).unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);

        let request = UploadRequest::load(&files[0].path()).unwrap();
        assert!(!request.flag);
        let cut = request.cut.unwrap();
        assert_eq!(cut.start, 1_700_000_000 - 120);
        assert_eq!(cut.end, 1_700_000_000 + 60);
        assert_eq!(cut.extra_files, vec!["/data/extra.cfg".to_string()]);
        assert_eq!(request.record.title.as_deref(), Some("hot motor"));
        assert_eq!(request.record.description, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn materialization_waits_for_window_end() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir_all(&watched).unwrap();
        let default = default_mod(tmp.path(), &watched);
        // run once to create the state dirs
        default.run().await.unwrap();

        let paths = AgentPaths::rooted(tmp.path());
        let state_dir = paths.mod_state_dir(MOD_DIR_NAME);
        let open_window = UploadRequest {
            flag: false,
            cut: Some(CutSpec {
                start: Utc::now().timestamp() - 60,
                end: Utc::now().timestamp() + 3600,
                extra_files: vec![],
            }),
            ..Default::default()
        };
        let request_path = state_dir.join("pending.json");
        open_window.save(&request_path).unwrap();

        default.run().await.unwrap();
        let request = UploadRequest::load(&request_path).unwrap();
        assert!(!request.flag, "open window must not materialize");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_window_materializes_and_becomes_a_record() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir_all(&watched).unwrap();

        // a log covering the cut window
        fs::write(
            watched.join("svc.log"),
            "2024-01-15 12:00:00.000 INFO start\n2024-01-15 12:05:42.000 ERROR done\n",
        )
        .unwrap();

        let default = default_mod(tmp.path(), &watched);
        default.run().await.unwrap();

        let paths = AgentPaths::rooted(tmp.path());
        let state_dir = paths.mod_state_dir(MOD_DIR_NAME);
        // 12:00..12:06 on 2024-01-15 in +08:00, already in the past
        let request = UploadRequest {
            flag: false,
            project_name: Some("warehouses/w/projects/p".into()),
            record: RequestRecordSpec {
                title: Some("motor fault".into()),
                labels: Some(vec!["auto".into()]),
                ..Default::default()
            },
            cut: Some(CutSpec {
                start: 1_705_291_200,
                end: 1_705_291_560,
                extra_files: vec![],
            }),
            ..Default::default()
        };
        let request_path = state_dir.join("11111111-2222-3333-4444-555555555555.json");
        request.save(&request_path).unwrap();

        default.run().await.unwrap();

        let materialized = UploadRequest::load(&request_path).unwrap();
        assert!(materialized.flag);
        assert_eq!(materialized.log.len(), 1, "log file sliced into temp dir");
        assert_eq!(materialized.uploaded, Some(true));
        assert_eq!(materialized.paths_to_delete.len(), 1);
        let start_time = materialized.start_time.unwrap();

        // the record cache dir exists and carries the request + sliced log
        let records = RecordCache::find_all(&paths.records_dir()).unwrap();
        assert_eq!(records.len(), 1);
        let rc = &records[0];
        assert_eq!(rc.timestamp, start_time);
        assert_eq!(rc.project_name.as_deref(), Some("warehouses/w/projects/p"));
        assert_eq!(rc.labels, vec!["auto".to_string()]);
        assert_eq!(rc.record["title"], "motor fault");
        let filenames: Vec<_> = rc.file_infos.iter().map(|f| f.filename.clone()).collect();
        assert!(filenames.contains(&"log/svc.log".to_string()));
        assert!(filenames
            .iter()
            .any(|f| f.ends_with(".json")), "request json kept with the record");

        // re-running does not duplicate the record
        default.run().await.unwrap();
        assert_eq!(RecordCache::find_all(&paths.records_dir()).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn convert_code_accepts_both_shapes() {
        let tmp = tempfile::tempdir().unwrap();
        let default = build_mod(tmp.path(), json!({}));

        let list = json!([
            {"code": 20063, "messageCN": "电机过热"},
            {"code": "20064"},
        ]);
        let table = default.convert_code(&list);
        assert_eq!(table.get("20063").map(String::as_str), Some("电机过热"));
        assert_eq!(table.get("20064").map(String::as_str), Some("未知错误"));

        let wrapped = json!({"msg": [{"code": "1", "messageCN": "one"}]});
        assert_eq!(
            default.convert_code(&wrapped).get("1").map(String::as_str),
            Some("one")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_sn_from_txt_file_and_generated_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let sn_file = tmp.path().join("sn.txt");
        fs::write(&sn_file, "SN-1234\n").unwrap();

        let with_file = build_mod(
            tmp.path(),
            json!({"sn_file": sn_file.to_string_lossy()}),
        );
        let device = with_file.get_device().unwrap();
        assert_eq!(device.serial_number, "SN-1234");
        assert_eq!(device.display_name, "SN-1234");

        let generated = build_mod(tmp.path(), json!({}));
        let device = generated.get_device().unwrap();
        assert_eq!(device.serial_number.len(), 32);
        assert!(device.display_name.ends_with(&device.serial_number));
        // stable across calls
        assert_eq!(
            generated.get_device().unwrap().serial_number,
            device.serial_number
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_sn_from_yaml_field() {
        let tmp = tempfile::tempdir().unwrap();
        let sn_file = tmp.path().join("robot.yaml");
        fs::write(&sn_file, "robot:\n  info:\n    sn: YAML-SN-9\n").unwrap();

        let default = build_mod(
            tmp.path(),
            json!({
                "sn_file": sn_file.to_string_lossy(),
                "sn_field": "robot.info.sn",
            }),
        );
        assert_eq!(default.get_device().unwrap().serial_number, "YAML-SN-9");

        let missing_field = build_mod(
            tmp.path(),
            json!({
                "sn_file": sn_file.to_string_lossy(),
                "sn_field": "robot.info.nope",
            }),
        );
        assert!(matches!(
            missing_field.get_device(),
            Err(AgentError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn zip_directory_keeps_root_name() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("payload");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("sub/b.txt"), "b").unwrap();

        let dst = tmp.path().join("payload.zip");
        zip_directory(&src, &dst).unwrap();

        let file = fs::File::open(&dst).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"payload/a.txt".to_string()));
        assert!(names.contains(&"payload/sub/b.txt".to_string()));
    }
}
