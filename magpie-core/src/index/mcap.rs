//! MCAP classifier.
//!
//! Coverage comes from the summary statistics. Messages are decoded per
//! channel encoding: JSON channels parse directly, `ros1`/`cdr` channels are
//! decoded against the schema text embedded in the file, protobuf channels
//! surface as opaque items that rules can still match on topic and type.

use std::path::Path;

use memmap2::Mmap;
use serde_json::json;

use super::decode::SchemaRegistry;
use super::{spawn_message_stream, Classifier, FileState, MessageStream};
use crate::error::{AgentError, Result};
use crate::rules::RuleItem;

const NS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct McapClassifier;

fn map_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)?;
    // the file is only read while the mapping is alive
    unsafe { Mmap::map(&file) }.map_err(Into::into)
}

impl Classifier for McapClassifier {
    fn name(&self) -> &'static str {
        "mcap"
    }

    fn is_static(&self) -> bool {
        true
    }

    fn matches(&self, path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".mcap"))
    }

    fn compute_state(&self, path: &Path) -> Result<FileState> {
        let size = path.metadata()?.len();
        let mapped = map_file(path)?;
        let summary = mcap::Summary::read(&mapped)
            .map_err(|err| AgentError::Internal(format!("mcap summary: {err}")))?
            .ok_or_else(|| AgentError::UnsupportedFile(path.to_path_buf()))?;
        let stats = summary
            .stats
            .ok_or_else(|| AgentError::UnsupportedFile(path.to_path_buf()))?;

        Ok(FileState::covered(
            size,
            (stats.message_start_time / NS_PER_SEC) as i64,
            (stats.message_end_time / NS_PER_SEC) as i64,
        ))
    }

    fn messages(&self, path: &Path) -> Result<MessageStream> {
        let mapped = map_file(path)?;
        let path = path.to_path_buf();

        Ok(spawn_message_stream(move |emit| {
            let stream = match mcap::MessageStream::new(&mapped) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to open mcap stream");
                    return;
                }
            };

            let mut registry = SchemaRegistry::new();
            let mut skipped_topics = std::collections::HashSet::new();
            for message in stream {
                let message = match message {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "mcap read error");
                        break;
                    }
                };

                let channel = &message.channel;
                let schema_name = channel
                    .schema
                    .as_ref()
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                let ts = (message.log_time / NS_PER_SEC) as i64;

                let msg = match channel.message_encoding.as_str() {
                    "json" => serde_json::from_slice(&message.data).ok(),
                    "ros1" => channel.schema.as_ref().and_then(|schema| {
                        let text = String::from_utf8_lossy(&schema.data);
                        registry.register_bundle(&schema.name, &text);
                        registry.decode_ros1(&schema.name, &message.data).ok()
                    }),
                    "cdr" => channel.schema.as_ref().and_then(|schema| {
                        if schema.encoding == "ros2msg" {
                            let text = String::from_utf8_lossy(&schema.data);
                            registry.register_bundle(&schema.name, &text);
                        }
                        registry.decode_cdr(&schema.name, &message.data).ok()
                    }),
                    // protobuf (and anything else) stays opaque
                    _ => None,
                };

                let msg = match msg {
                    Some(msg) => msg,
                    None => {
                        if skipped_topics.insert(channel.topic.clone()) {
                            tracing::warn!(
                                topic = %channel.topic,
                                encoding = %channel.message_encoding,
                                "cannot decode channel payload, passing opaque items"
                            );
                        }
                        json!({"encoding": channel.message_encoding, "size": message.data.len()})
                    }
                };

                let item = RuleItem {
                    topic: channel.topic.clone(),
                    msg,
                    ts,
                    msgtype: schema_name,
                };
                if !emit(item) {
                    break;
                }
            }
        }))
    }
}
