//! The file-state index: watched directories, per-file classification, and
//! time-range queries.
//!
//! Classifiers recognize the data formats robots produce (plain text logs,
//! MCAP, ROS1 bags, ROS2 bag directories), extract `[start_time, end_time]`
//! coverage in seconds, and expose lazy message streams for rule evaluation.
//! The index persists to `file.state.json` and prunes entries whose files
//! disappeared on every sweep.

pub mod decode;
pub mod log;
pub mod log_time;
pub mod mcap;
pub mod ros1;
pub mod ros2;

pub use decode::SchemaRegistry;
pub use log::LogClassifier;
pub use mcap::McapClassifier;
pub use ros1::Ros1Classifier;
pub use ros2::Ros2Classifier;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rules::RuleItem;

/// Persisted index entry for one watched path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileState {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unsupported: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub processed: bool,
}

impl FileState {
    pub fn unsupported(size: u64) -> Self {
        Self {
            size,
            unsupported: true,
            ..Default::default()
        }
    }

    pub fn covered(size: u64, start_time: i64, end_time: i64) -> Self {
        Self {
            size,
            start_time: Some(start_time),
            end_time: Some(end_time),
            ..Default::default()
        }
    }

    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => s <= end && e >= start,
            _ => false,
        }
    }
}

/// A lazy, finite stream of decoded messages.
pub type MessageStream = Box<dyn Iterator<Item = RuleItem> + Send>;

/// One recognized file format.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether files of this format stop growing once written (and are
    /// therefore eligible for one-shot diagnosis).
    fn is_static(&self) -> bool;

    fn matches(&self, path: &Path) -> bool;

    /// Size used for change detection; directory formats sum their members.
    fn size(&self, path: &Path) -> Result<u64> {
        Ok(path.metadata()?.len())
    }

    /// Extract `[start_time, end_time]` coverage.
    fn compute_state(&self, path: &Path) -> Result<FileState>;

    fn messages(&self, path: &Path) -> Result<MessageStream>;
}

/// Bridge a borrowing reader into an owned, lazily-pulled message stream:
/// the producer runs on its own thread and blocks once the channel is full,
/// so whole files are never buffered.
pub(crate) fn spawn_message_stream<F>(producer: F) -> MessageStream
where
    F: FnOnce(&mut dyn FnMut(RuleItem) -> bool) + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<RuleItem>(256);
    std::thread::spawn(move || {
        let mut emit = move |item: RuleItem| tx.send(item).is_ok();
        producer(&mut emit);
    });
    Box::new(rx.into_iter())
}

/// Process-wide index over the watched directories. One instance per agent,
/// shared behind an `Arc`; the inner map is guarded by a single mutex.
pub struct FileStateIndex {
    state_path: PathBuf,
    state: Mutex<HashMap<PathBuf, FileState>>,
    classifiers: Vec<Box<dyn Classifier>>,
}

impl std::fmt::Debug for FileStateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateIndex")
            .field("state_path", &self.state_path)
            .field("entries", &self.state.lock().len())
            .finish_non_exhaustive()
    }
}

impl FileStateIndex {
    pub fn new(state_path: PathBuf, ros2_msg_dirs: &[String]) -> Arc<Self> {
        let mut registry = SchemaRegistry::new();
        registry.register_msg_dirs(ros2_msg_dirs);
        let registry = Arc::new(registry);

        let classifiers: Vec<Box<dyn Classifier>> = vec![
            Box::new(LogClassifier),
            Box::new(McapClassifier),
            Box::new(Ros1Classifier),
            Box::new(Ros2Classifier::new(registry)),
        ];

        let state = crate::model::load_json(&state_path)
            .unwrap_or_default()
            .unwrap_or_default();
        Arc::new(Self {
            state_path,
            state: Mutex::new(state),
            classifiers,
        })
    }

    fn save_locked(&self, state: &HashMap<PathBuf, FileState>) {
        if let Err(err) = crate::model::save_json(&self.state_path, state) {
            tracing::error!(error = %err, "failed to persist file state index");
        }
    }

    pub fn get_state(&self, path: &Path) -> Option<FileState> {
        self.state.lock().get(path).cloned()
    }

    fn classifier_for(&self, path: &Path) -> Option<&dyn Classifier> {
        self.classifiers
            .iter()
            .find(|c| c.matches(path))
            .map(|c| c.as_ref())
    }

    pub fn update_dirs(&self, dirs: &[PathBuf]) {
        for dir in dirs {
            self.update_dir(dir);
        }
    }

    /// Sweep the immediate children of `dir`: classify new or resized
    /// entries, drop entries whose paths vanished, persist.
    pub fn update_dir(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to read watched dir");
                return;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(classifier) = self.classifier_for(&path) else {
                continue;
            };

            let current_size = classifier.size(&path).unwrap_or(0);
            if let Some(existing) = self.get_state(&path) {
                if existing.size == current_size {
                    continue;
                }
            }

            let new_state = match classifier.compute_state(&path) {
                Ok(state) => state,
                Err(err) => {
                    tracing::error!(
                        path = %path.display(),
                        classifier = classifier.name(),
                        error = %err,
                        "failed to classify file"
                    );
                    FileState::unsupported(current_size)
                }
            };
            self.state.lock().insert(path, new_state);
        }

        let mut state = self.state.lock();
        state.retain(|path, _| path.exists());
        self.save_locked(&state);
    }

    /// For a matched *static* file that has not been processed at its
    /// current size: mark it processed, persist, and hand back its message
    /// stream for rule evaluation. `None` when there is nothing to do.
    pub fn take_unprocessed(&self, path: &Path) -> Option<MessageStream> {
        let classifier = self
            .classifiers
            .iter()
            .find(|c| c.is_static() && c.matches(path))?;

        let Some(file_state) = self.get_state(path) else {
            tracing::warn!(path = %path.display(), "file not found in state index");
            return None;
        };
        if file_state.unsupported {
            return None;
        }
        if file_state.processed && classifier.size(path).unwrap_or(0) == file_state.size {
            return None;
        }

        tracing::info!(path = %path.display(), classifier = classifier.name(), "processing static file");
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.get_mut(path) {
                entry.processed = true;
            }
            self.save_locked(&state);
        }

        match classifier.messages(path) {
            Ok(stream) => Some(stream),
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "failed to open message stream");
                None
            }
        }
    }

    /// Index entries directly under `dir` whose coverage overlaps
    /// `[start, end]`, split by file/directory shape.
    pub fn get_files(&self, dir: &Path, start: i64, end: i64, want_dirs: bool) -> Vec<PathBuf> {
        let state = self.state.lock();
        let mut found: Vec<PathBuf> = state
            .iter()
            .filter(|(path, fs)| {
                path.parent() == Some(dir)
                    && !fs.unsupported
                    && fs.is_dir == want_dirs
                    && fs.overlaps(start, end)
            })
            .map(|(path, _)| path.clone())
            .collect();
        found.sort();
        found
    }
}
