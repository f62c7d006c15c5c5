//! ROS1 bag classifier.
//!
//! Bags (format 2.0) are length-prefixed records with `name=value` headers.
//! Coverage comes from the chunk-info index records; messages are read from
//! uncompressed chunks and decoded against the connection's embedded message
//! definition. Compressed chunks are skipped with a warning.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::decode::SchemaRegistry;
use super::{spawn_message_stream, Classifier, FileState, MessageStream};
use crate::error::{AgentError, Result};
use crate::rules::RuleItem;

const BAG_MAGIC: &[u8] = b"#ROSBAG V2.0\n";

const OP_MESSAGE_DATA: u8 = 0x02;
const OP_CHUNK: u8 = 0x05;
const OP_CHUNK_INFO: u8 = 0x06;
const OP_CONNECTION: u8 = 0x07;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ros1Classifier;

impl Classifier for Ros1Classifier {
    fn name(&self) -> &'static str {
        "ros1"
    }

    fn is_static(&self) -> bool {
        true
    }

    fn matches(&self, path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".bag") || n.ends_with(".bag.active"))
    }

    fn compute_state(&self, path: &Path) -> Result<FileState> {
        let size = path.metadata()?.len();
        let mut reader = BagReader::open(path)?;

        let mut start = i64::MAX;
        let mut end = i64::MIN;
        while let Some(record) = reader.next_record()? {
            if record.op != OP_CHUNK_INFO {
                reader.skip_data(&record)?;
                continue;
            }
            if let (Some(s), Some(e)) = (
                record.header_time("start_time"),
                record.header_time("end_time"),
            ) {
                start = start.min(s);
                end = end.max(e);
            }
            reader.skip_data(&record)?;
        }

        if start == i64::MAX {
            // unindexed (e.g. a crash-truncated .bag.active)
            return Err(AgentError::UnsupportedFile(path.to_path_buf()));
        }
        Ok(FileState::covered(size, start, end))
    }

    fn messages(&self, path: &Path) -> Result<MessageStream> {
        let path = path.to_path_buf();
        Ok(spawn_message_stream(move |emit| {
            if let Err(err) = stream_messages(&path, emit) {
                tracing::warn!(path = %path.display(), error = %err, "bag read aborted");
            }
        }))
    }
}

/// `a/msg/b` normalized to `a/b`.
fn normalize_msgtype(msgtype: &str) -> String {
    msgtype.replace("/msg/", "/")
}

#[derive(Debug, Clone)]
struct Connection {
    topic: String,
    msgtype: String,
}

fn stream_messages(path: &Path, emit: &mut dyn FnMut(RuleItem) -> bool) -> Result<()> {
    let mut reader = BagReader::open(path)?;
    let mut registry = SchemaRegistry::new();
    let mut connections: HashMap<u32, Connection> = HashMap::new();
    let mut undecodable = std::collections::HashSet::new();

    while let Some(record) = reader.next_record()? {
        match record.op {
            OP_CONNECTION => {
                let Some(conn_id) = record.header_u32("conn") else {
                    reader.skip_data(&record)?;
                    continue;
                };
                // the data section is a second header block carrying the
                // connection's type and full message definition
                let data = reader.read_data(&record)?;
                let fields = parse_header_fields(&data);
                let topic = field_str(&fields, "topic")
                    .or_else(|| record.header_str("topic"))
                    .unwrap_or_default();
                let msgtype = field_str(&fields, "type").unwrap_or_default();
                if let Some(definition) = field_str(&fields, "message_definition") {
                    registry.register_bundle(&msgtype, &definition);
                }
                connections.insert(conn_id, Connection { topic, msgtype });
            }
            OP_CHUNK => {
                let compression = record.header_str("compression").unwrap_or_default();
                let data = reader.read_data(&record)?;
                if compression != "none" {
                    tracing::warn!(
                        path = %path.display(),
                        compression = %compression,
                        "skipping compressed bag chunk"
                    );
                    continue;
                }
                if !emit_chunk_messages(&data, &connections, &registry, &mut undecodable, emit)? {
                    return Ok(());
                }
            }
            _ => reader.skip_data(&record)?,
        }
    }
    Ok(())
}

fn emit_chunk_messages(
    chunk: &[u8],
    connections: &HashMap<u32, Connection>,
    registry: &SchemaRegistry,
    undecodable: &mut std::collections::HashSet<String>,
    emit: &mut dyn FnMut(RuleItem) -> bool,
) -> Result<bool> {
    let mut offset = 0usize;
    while offset + 4 <= chunk.len() {
        let header_len = LittleEndian::read_u32(&chunk[offset..]) as usize;
        offset += 4;
        if offset + header_len > chunk.len() {
            break;
        }
        let fields = parse_header_fields(&chunk[offset..offset + header_len]);
        offset += header_len;
        if offset + 4 > chunk.len() {
            break;
        }
        let data_len = LittleEndian::read_u32(&chunk[offset..]) as usize;
        offset += 4;
        if offset + data_len > chunk.len() {
            break;
        }
        let data = &chunk[offset..offset + data_len];
        offset += data_len;

        if field_u8(&fields, "op") != Some(OP_MESSAGE_DATA) {
            continue;
        }
        let Some(conn_id) = field_u32(&fields, "conn") else {
            continue;
        };
        let Some(ts) = field_time(&fields, "time") else {
            continue;
        };
        let Some(connection) = connections.get(&conn_id) else {
            continue;
        };

        let msg = match registry.decode_ros1(&connection.msgtype, data) {
            Ok(msg) => msg,
            Err(err) => {
                if undecodable.insert(connection.topic.clone()) {
                    tracing::warn!(
                        topic = %connection.topic,
                        error = %err,
                        "failed to deserialize message, skipping topic"
                    );
                }
                continue;
            }
        };

        let item = RuleItem {
            topic: connection.topic.clone(),
            msg,
            ts,
            msgtype: normalize_msgtype(&connection.msgtype),
        };
        if !emit(item) {
            return Ok(false);
        }
    }
    Ok(true)
}

struct RawRecord {
    op: u8,
    fields: HashMap<String, Vec<u8>>,
    data_len: u32,
}

impl RawRecord {
    fn header_u32(&self, name: &str) -> Option<u32> {
        field_u32(&self.fields, name)
    }

    fn header_str(&self, name: &str) -> Option<String> {
        field_str(&self.fields, name)
    }

    fn header_time(&self, name: &str) -> Option<i64> {
        field_time(&self.fields, name)
    }
}

struct BagReader {
    reader: BufReader<File>,
}

impl BagReader {
    fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 13];
        reader.read_exact(&mut magic).map_err(|_| {
            AgentError::UnsupportedFile(path.to_path_buf())
        })?;
        if magic != *BAG_MAGIC {
            return Err(AgentError::UnsupportedFile(path.to_path_buf()));
        }
        Ok(Self { reader })
    }

    /// Read the next record header. `None` at EOF.
    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let header_len = LittleEndian::read_u32(&len_buf) as usize;
        let mut header = vec![0u8; header_len];
        self.reader.read_exact(&mut header)?;
        let fields = parse_header_fields(&header);

        self.reader.read_exact(&mut len_buf)?;
        let data_len = LittleEndian::read_u32(&len_buf);

        let op = field_u8(&fields, "op")
            .ok_or_else(|| AgentError::Internal("bag record without op".into()))?;
        Ok(Some(RawRecord {
            op,
            fields,
            data_len,
        }))
    }

    fn read_data(&mut self, record: &RawRecord) -> Result<Vec<u8>> {
        let mut data = vec![0u8; record.data_len as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    fn skip_data(&mut self, record: &RawRecord) -> Result<()> {
        self.reader
            .seek(SeekFrom::Current(record.data_len as i64))?;
        Ok(())
    }
}

/// `name=value` fields, each prefixed with a u32 length.
fn parse_header_fields(bytes: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut fields = HashMap::new();
    let mut offset = 0usize;
    while offset + 4 <= bytes.len() {
        let len = LittleEndian::read_u32(&bytes[offset..]) as usize;
        offset += 4;
        if len == 0 || offset + len > bytes.len() {
            break;
        }
        let entry = &bytes[offset..offset + len];
        offset += len;
        if let Some(eq) = entry.iter().position(|&b| b == b'=') {
            let name = String::from_utf8_lossy(&entry[..eq]).into_owned();
            fields.insert(name, entry[eq + 1..].to_vec());
        }
    }
    fields
}

fn field_u8(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<u8> {
    fields.get(name).and_then(|v| v.first().copied())
}

fn field_u32(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<u32> {
    fields
        .get(name)
        .filter(|v| v.len() >= 4)
        .map(|v| LittleEndian::read_u32(v))
}

/// Bag `time` fields are u32 seconds followed by u32 nanoseconds.
fn field_time(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<i64> {
    fields
        .get(name)
        .filter(|v| v.len() >= 8)
        .map(|v| LittleEndian::read_u32(v) as i64)
}

fn field_str(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<String> {
    fields
        .get(name)
        .map(|v| String::from_utf8_lossy(v).into_owned())
}
