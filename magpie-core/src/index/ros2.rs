//! ROS2 bag-directory classifier.
//!
//! A rosbag2 recording is a directory holding `metadata.yaml` plus one or
//! more `*.db3` storage files. Coverage comes from the metadata; messages
//! are read straight from the sqlite storage and CDR-decoded against the
//! registered schemas (custom `.msg` trees can be pre-registered through the
//! index configuration).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use super::decode::SchemaRegistry;
use super::{spawn_message_stream, Classifier, FileState, MessageStream};
use crate::error::{AgentError, Result};
use crate::rules::RuleItem;

const NS_PER_SEC: i64 = 1_000_000_000;

pub struct Ros2Classifier {
    registry: Arc<SchemaRegistry>,
}

impl std::fmt::Debug for Ros2Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ros2Classifier").finish_non_exhaustive()
    }
}

impl Ros2Classifier {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    fn member_files(path: &Path) -> (bool, bool, Vec<PathBuf>, u64) {
        let mut has_metadata = false;
        let mut db3_files = Vec::new();
        let mut size = 0u64;
        let Ok(entries) = std::fs::read_dir(path) else {
            return (false, false, db3_files, 0);
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }
            let name = entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if name == "metadata.yaml" {
                has_metadata = true;
                size += entry_path.metadata().map(|m| m.len()).unwrap_or(0);
            } else if name.ends_with(".db3") {
                size += entry_path.metadata().map(|m| m.len()).unwrap_or(0);
                db3_files.push(entry_path);
            }
        }
        db3_files.sort();
        (has_metadata, !db3_files.is_empty(), db3_files, size)
    }
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    rosbag2_bagfile_information: BagInfo,
}

#[derive(Debug, Deserialize)]
struct BagInfo {
    starting_time: NanosSinceEpoch,
    duration: Nanos,
}

#[derive(Debug, Deserialize)]
struct NanosSinceEpoch {
    nanoseconds_since_epoch: i64,
}

#[derive(Debug, Deserialize)]
struct Nanos {
    nanoseconds: i64,
}

impl Classifier for Ros2Classifier {
    fn name(&self) -> &'static str {
        "ros2"
    }

    fn is_static(&self) -> bool {
        true
    }

    fn matches(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        let (has_metadata, has_db3, _, _) = Self::member_files(path);
        has_metadata && has_db3
    }

    fn size(&self, path: &Path) -> Result<u64> {
        let (_, _, _, size) = Self::member_files(path);
        Ok(size)
    }

    fn compute_state(&self, path: &Path) -> Result<FileState> {
        let (_, _, _, size) = Self::member_files(path);
        let text = std::fs::read_to_string(path.join("metadata.yaml"))?;
        let metadata: MetadataFile = serde_yaml::from_str(&text)
            .map_err(|err| AgentError::Internal(format!("bad rosbag2 metadata: {err}")))?;

        let info = metadata.rosbag2_bagfile_information;
        let start_ns = info.starting_time.nanoseconds_since_epoch;
        let end_ns = start_ns + info.duration.nanoseconds;
        let mut state = FileState::covered(size, start_ns / NS_PER_SEC, end_ns / NS_PER_SEC);
        state.is_dir = true;
        Ok(state)
    }

    fn messages(&self, path: &Path) -> Result<MessageStream> {
        let (_, _, db3_files, _) = Self::member_files(path);
        if db3_files.is_empty() {
            return Err(AgentError::UnsupportedFile(path.to_path_buf()));
        }
        let registry = Arc::clone(&self.registry);

        Ok(spawn_message_stream(move |emit| {
            let mut undecodable = std::collections::HashSet::new();
            for db3 in db3_files {
                if let Err(err) = stream_db3(&db3, &registry, &mut undecodable, emit) {
                    tracing::warn!(path = %db3.display(), error = %err, "rosbag2 storage read failed");
                }
            }
        }))
    }
}

fn stream_db3(
    db3: &Path,
    registry: &SchemaRegistry,
    undecodable: &mut std::collections::HashSet<String>,
    emit: &mut dyn FnMut(RuleItem) -> bool,
) -> Result<()> {
    let conn = rusqlite::Connection::open_with_flags(
        db3,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|err| AgentError::Internal(format!("open {}: {err}", db3.display())))?;

    let mut statement = conn
        .prepare(
            "SELECT topics.name, topics.type, messages.timestamp, messages.data \
             FROM messages JOIN topics ON messages.topic_id = topics.id \
             ORDER BY messages.timestamp",
        )
        .map_err(|err| AgentError::Internal(format!("query {}: {err}", db3.display())))?;

    let mut rows = statement
        .query([])
        .map_err(|err| AgentError::Internal(err.to_string()))?;
    while let Some(row) = rows
        .next()
        .map_err(|err| AgentError::Internal(err.to_string()))?
    {
        let topic: String = row.get(0).unwrap_or_default();
        let msgtype: String = row.get(1).unwrap_or_default();
        let timestamp: i64 = row.get(2).unwrap_or_default();
        let data: Vec<u8> = row.get(3).unwrap_or_default();

        let msg = match registry.decode_cdr(&msgtype, &data) {
            Ok(msg) => msg,
            Err(err) => {
                if undecodable.insert(topic.clone()) {
                    tracing::warn!(topic = %topic, error = %err, "failed to deserialize message, skipping topic");
                }
                continue;
            }
        };

        let item = RuleItem {
            topic,
            msg,
            ts: timestamp / NS_PER_SEC,
            msgtype,
        };
        if !emit(item) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn registry_with_status() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry.register("app/msg/Status", "uint8 level\nstring message\n");
        Arc::new(registry)
    }

    fn write_metadata(dir: &Path, start_ns: i64, duration_ns: i64) {
        fs::write(
            dir.join("metadata.yaml"),
            format!(
                "rosbag2_bagfile_information:\n\
                 \x20\x20version: 5\n\
                 \x20\x20storage_identifier: sqlite3\n\
                 \x20\x20duration:\n\
                 \x20\x20\x20\x20nanoseconds: {duration_ns}\n\
                 \x20\x20starting_time:\n\
                 \x20\x20\x20\x20nanoseconds_since_epoch: {start_ns}\n\
                 \x20\x20message_count: 1\n"
            ),
        )
        .unwrap();
    }

    fn write_db3(path: &Path, rows: &[(&str, &str, i64, Vec<u8>)]) {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE topics(id INTEGER PRIMARY KEY, name TEXT, type TEXT, \
             serialization_format TEXT, offered_qos_profiles TEXT);\n\
             CREATE TABLE messages(id INTEGER PRIMARY KEY, topic_id INTEGER, \
             timestamp INTEGER, data BLOB);",
        )
        .unwrap();
        for (idx, (topic, msgtype, ts, data)) in rows.iter().enumerate() {
            conn.execute(
                "INSERT INTO topics(id, name, type, serialization_format, offered_qos_profiles) \
                 VALUES (?1, ?2, ?3, 'cdr', '')",
                rusqlite::params![idx as i64 + 1, topic, msgtype],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO messages(topic_id, timestamp, data) VALUES (?1, ?2, ?3)",
                rusqlite::params![idx as i64 + 1, ts, data],
            )
            .unwrap();
        }
    }

    fn cdr_status(level: u8, message: &str) -> Vec<u8> {
        let mut data = vec![0x00, 0x01, 0x00, 0x00];
        data.push(level);
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(&((message.len() + 1) as u32).to_le_bytes());
        data.extend_from_slice(message.as_bytes());
        data.push(0);
        data
    }

    #[test]
    fn matches_requires_metadata_and_db3() {
        let tmp = tempfile::tempdir().unwrap();
        let bag = tmp.path().join("rosbag2_2024_01_15");
        fs::create_dir_all(&bag).unwrap();
        let classifier = Ros2Classifier::new(Arc::new(SchemaRegistry::new()));

        assert!(!classifier.matches(&bag));
        write_metadata(&bag, 0, 0);
        assert!(!classifier.matches(&bag));
        fs::write(bag.join("data_0.db3"), "x").unwrap();
        assert!(classifier.matches(&bag));
    }

    #[test]
    fn coverage_and_size_from_members() {
        let tmp = tempfile::tempdir().unwrap();
        let bag = tmp.path().join("rosbag2");
        fs::create_dir_all(&bag).unwrap();
        write_metadata(&bag, 1_700_000_000 * NS_PER_SEC, 42 * NS_PER_SEC);
        fs::write(bag.join("data_0.db3"), vec![0u8; 10]).unwrap();
        // non-member files are excluded from the size
        fs::write(bag.join("notes.txt"), vec![0u8; 1000]).unwrap();

        let classifier = Ros2Classifier::new(Arc::new(SchemaRegistry::new()));
        let state = classifier.compute_state(&bag).unwrap();
        assert!(state.is_dir);
        assert_eq!(state.start_time, Some(1_700_000_000));
        assert_eq!(state.end_time, Some(1_700_000_042));
        let metadata_len = fs::metadata(bag.join("metadata.yaml")).unwrap().len();
        assert_eq!(state.size, 10 + metadata_len);
    }

    #[test]
    fn messages_decode_from_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let bag = tmp.path().join("rosbag2");
        fs::create_dir_all(&bag).unwrap();
        write_metadata(&bag, 0, 0);
        write_db3(
            &bag.join("data_0.db3"),
            &[(
                "/diagnostics",
                "app/msg/Status",
                7 * NS_PER_SEC,
                cdr_status(2, "overheat"),
            )],
        );

        let classifier = Ros2Classifier::new(registry_with_status());
        let items: Vec<_> = classifier.messages(&bag).unwrap().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].topic, "/diagnostics");
        assert_eq!(items[0].ts, 7);
        assert_eq!(items[0].msg["message"], "overheat");
    }

    #[test]
    fn unknown_types_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let bag = tmp.path().join("rosbag2");
        fs::create_dir_all(&bag).unwrap();
        write_metadata(&bag, 0, 0);
        write_db3(
            &bag.join("data_0.db3"),
            &[("/mystery", "other/msg/Unknown", 0, vec![0, 1, 0, 0])],
        );

        let classifier = Ros2Classifier::new(registry_with_status());
        let items: Vec<_> = classifier.messages(&bag).unwrap().collect();
        assert!(items.is_empty());
    }
}
