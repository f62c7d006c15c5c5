//! The on-disk unit of work: one record cache directory per triggering event.
//!
//! Layout: `<records_root>/<key>/.cos/state.json` plus the hardlinked payload
//! files. The key is derived from the trigger timestamp so re-materializing
//! the same event lands in the same directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::file_info::FileInfo;
use crate::error::Result;

pub const RECORD_STATE_RELATIVE_PATH: &str = ".cos/state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MomentTask {
    pub title: String,
    pub description: String,
    pub record_name: String,
    pub assignee: Option<String>,
}

/// A point-in-time annotation attached to a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Moment {
    pub title: String,
    pub description: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// Milliseconds.
    pub duration: i64,
    pub metadata: BTreeMap<String, String>,
    pub task: Option<MomentTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordCache {
    pub uploaded: bool,
    pub skipped: bool,
    pub event_code: Option<String>,
    pub project_name: Option<String>,

    /// Trigger time, milliseconds since epoch (UTC).
    pub timestamp: i64,
    pub labels: Vec<String>,
    /// The remote record object once created; carries at least `name`.
    pub record: serde_json::Value,
    pub moments: Vec<Moment>,

    /// The associated upload task, if the platform dispatched one.
    pub task: serde_json::Value,

    /// Original source paths (deduplicated, first-seen order).
    pub files: Vec<String>,
    /// Collected files with size/sha256 (usually hardlinks in the cache dir).
    pub file_infos: Vec<FileInfo>,
    /// Source paths purged together with the cache dir.
    pub paths_to_delete: Vec<String>,

    #[serde(skip)]
    records_root: PathBuf,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self {
            uploaded: false,
            skipped: false,
            event_code: None,
            project_name: None,
            timestamp: 0,
            labels: Vec::new(),
            record: serde_json::Value::Object(Default::default()),
            moments: Vec::new(),
            task: serde_json::Value::Object(Default::default()),
            files: Vec::new(),
            file_infos: Vec::new(),
            paths_to_delete: Vec::new(),
            records_root: PathBuf::new(),
        }
    }
}

impl RecordCache {
    pub fn new(records_root: &Path, timestamp: i64, event_code: Option<String>) -> Self {
        Self {
            records_root: records_root.to_path_buf(),
            timestamp,
            event_code,
            ..Default::default()
        }
    }

    /// Deduplicate and mirror `files` and `file_infos` into each other.
    /// `file_infos` wins when both are present.
    pub fn sync_files(&mut self) {
        self.files = dedup_preserving_order(std::mem::take(&mut self.files));
        if self.files.is_empty() {
            self.files = self
                .file_infos
                .iter()
                .map(|f| f.filepath.to_string_lossy().into_owned())
                .collect();
        } else if self.file_infos.is_empty() {
            self.file_infos = self.files.iter().map(FileInfo::new).collect();
        }
    }

    /// `[<event_code>_]YYYY-MM-DD-HH-MM-SS_<ms>`, UTC.
    pub fn key(&self) -> String {
        let seconds = self.timestamp.div_euclid(1000);
        let millis = self.timestamp.rem_euclid(1000);
        let dt = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        let stamp = dt.format("%Y-%m-%d-%H-%M-%S");
        match &self.event_code {
            Some(code) if !code.is_empty() => format!("{code}_{stamp}_{millis}"),
            _ => format!("{stamp}_{millis}"),
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        self.records_root.join(self.key())
    }

    pub fn state_path(&self) -> PathBuf {
        self.base_dir().join(RECORD_STATE_RELATIVE_PATH)
    }

    pub fn records_root(&self) -> &Path {
        &self.records_root
    }

    pub fn save_state(&self) -> Result<()> {
        super::state::save_json(&self.state_path(), self)
    }

    /// Merge previously persisted state for this key, if any, keeping the
    /// in-memory identity fields. Used when re-materializing a known event.
    pub fn load_existing_state(&mut self) -> Result<()> {
        let path = self.state_path();
        if let Some(mut loaded) = super::state::load_json::<RecordCache>(&path)? {
            loaded.records_root = self.records_root.clone();
            *self = loaded;
        }
        Ok(())
    }

    pub fn load_from_disk(state_path: &Path, records_root: &Path) -> Result<Self> {
        let text = fs::read_to_string(state_path)?;
        let mut rc: RecordCache = serde_json::from_str(&text)?;
        rc.records_root = records_root.to_path_buf();
        Ok(rc)
    }

    /// All payload files currently in the cache dir (the `.cos` sidecar
    /// excluded).
    pub fn list_files(&self) -> Vec<PathBuf> {
        walkdir::WalkDir::new(self.base_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| !e.path().components().any(|c| c.as_os_str() == ".cos"))
            .map(|e| e.into_path())
            .collect()
    }

    /// Every record cache under `records_root`, oldest directory first.
    /// A state file that no longer parses takes its whole directory with it.
    pub fn find_all(records_root: &Path) -> Result<Vec<RecordCache>> {
        fs::create_dir_all(records_root)?;
        let mut out = Vec::new();
        let mut dirs: Vec<PathBuf> = fs::read_dir(records_root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let state_path = dir.join(RECORD_STATE_RELATIVE_PATH);
            if !state_path.exists() {
                continue;
            }
            match Self::load_from_disk(&state_path, records_root) {
                Ok(rc) => out.push(rc),
                Err(err) => {
                    tracing::warn!(
                        path = %state_path.display(),
                        error = %err,
                        "invalid record state file, deleting record dir"
                    );
                    let _ = fs::remove_dir_all(&dir);
                }
            }
        }
        Ok(out)
    }

    /// Remove the cache dir and the registered source paths once the record
    /// is older than `delay_in_hours`. Negative delay disables deletion.
    pub fn delete_cache_dir(&self, delay_in_hours: i64) {
        if delay_in_hours < 0 {
            return;
        }
        let age_secs = Utc::now().timestamp() - self.timestamp / 1000;
        if age_secs <= delay_in_hours * 3600 {
            return;
        }

        let base = self.base_dir();
        if base.exists() {
            if let Err(err) = fs::remove_dir_all(&base) {
                tracing::error!(path = %base.display(), error = %err, "failed to delete record dir");
                return;
            }
        }
        tracing::info!(key = %self.key(), "record cache expired and deleted");

        for path_str in &self.paths_to_delete {
            let path = Path::new(path_str);
            if !path.exists() {
                tracing::warn!(path = %path.display(), "source path not found");
                continue;
            }
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            if let Err(err) = result {
                tracing::error!(path = %path.display(), error = %err, "failed to delete source path");
            }
        }
    }

    pub fn record_name(&self) -> Option<&str> {
        self.record.get("name").and_then(|v| v.as_str())
    }

    pub fn task_name(&self) -> Option<&str> {
        self.task.get("name").and_then(|v| v.as_str())
    }
}

fn dedup_preserving_order(files: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    files.into_iter().filter(|f| seen.insert(f.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_utc() {
        let rc = RecordCache::new(
            Path::new("/tmp/records"),
            1_234_567_890_000,
            Some("20063".into()),
        );
        assert_eq!(rc.key(), "20063_2009-02-13-23-31-30_0");

        let rc = RecordCache::new(Path::new("/tmp/records"), 1_234_567_890_417, None);
        assert_eq!(rc.key(), "2009-02-13-23-31-30_417");
    }

    #[test]
    fn files_deduplicated_first_seen_order() {
        let mut rc = RecordCache::new(Path::new("/tmp/records"), 0, Some("e".into()));
        rc.files = vec!["a".into(), "a".into(), "b".into()];
        rc.sync_files();
        assert_eq!(rc.files, vec!["a".to_string(), "b".to_string()]);
        // mirrored into file_infos
        assert_eq!(rc.file_infos.len(), 2);
        assert_eq!(rc.file_infos[0].filepath, PathBuf::from("a"));
    }

    #[test]
    fn file_infos_take_priority() {
        let mut rc = RecordCache::new(Path::new("/tmp/records"), 0, None);
        rc.file_infos = vec![FileInfo::new("/x/one.log")];
        rc.sync_files();
        assert_eq!(rc.files, vec!["/x/one.log".to_string()]);
    }

    #[test]
    fn save_and_find_all_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("records");

        let mut rc = RecordCache::new(&root, 1_700_000_000_000, Some("42".into()));
        rc.labels = vec!["robot".into()];
        rc.save_state().unwrap();

        let found = RecordCache::find_all(&root).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key(), rc.key());
        assert_eq!(found[0].labels, vec!["robot".to_string()]);
        assert_eq!(found[0].records_root(), root);
    }

    #[test]
    fn corrupt_state_file_removes_record_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("records");
        let bad_dir = root.join("bogus_2024-01-01-00-00-00_0");
        fs::create_dir_all(bad_dir.join(".cos")).unwrap();
        fs::write(bad_dir.join(RECORD_STATE_RELATIVE_PATH), "{not json").unwrap();

        let found = RecordCache::find_all(&root).unwrap();
        assert!(found.is_empty());
        assert!(!bad_dir.exists());
    }

    #[test]
    fn delete_cache_dir_honours_retention() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("records");

        // recent record, 1h retention: nothing deleted
        let rc = RecordCache::new(&root, Utc::now().timestamp_millis(), None);
        rc.save_state().unwrap();
        rc.delete_cache_dir(1);
        assert!(rc.base_dir().exists());

        // negative delay: deletion disabled even for old records
        let rc = RecordCache::new(&root, 0, Some("old".into()));
        rc.save_state().unwrap();
        rc.delete_cache_dir(-1);
        assert!(rc.base_dir().exists());

        // old record, zero delay: removed together with registered sources
        let src = dir.path().join("source.log");
        fs::write(&src, "x").unwrap();
        let mut rc = RecordCache::new(&root, 0, Some("gone".into()));
        rc.paths_to_delete = vec![src.to_string_lossy().into_owned()];
        rc.save_state().unwrap();
        rc.delete_cache_dir(0);
        assert!(!rc.base_dir().exists());
        assert!(!src.exists());
    }

    #[test]
    fn list_files_skips_state_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("records");
        let rc = RecordCache::new(&root, 1_000, None);
        rc.save_state().unwrap();
        fs::write(rc.base_dir().join("payload.bag"), "data").unwrap();

        let files = rc.list_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("payload.bag"));
    }
}
