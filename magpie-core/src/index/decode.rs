//! Schema-driven decoding of ROS message payloads into JSON values.
//!
//! Rule conditions address message fields by name, so payloads are decoded
//! dynamically from their `.msg` definitions rather than through generated
//! types: ROS1 bags carry plain little-endian serialization, ROS2 bags and
//! MCAP `cdr` channels carry XCDR with an encapsulation header. Unknown or
//! undecodable payloads surface as opaque objects; rules can still match on
//! topic and message type.

use std::collections::HashMap;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde_json::{json, Map, Value};

use crate::error::{AgentError, Result};

const MAX_DECODE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primitive {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Time,
    Duration,
}

impl Primitive {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Bool,
            "int8" | "byte" => Self::Int8,
            "uint8" | "char" => Self::UInt8,
            "int16" => Self::Int16,
            "uint16" => Self::UInt16,
            "int32" => Self::Int32,
            "uint32" => Self::UInt32,
            "int64" => Self::Int64,
            "uint64" => Self::UInt64,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            "string" | "wstring" => Self::String,
            "time" | "builtin_interfaces/Time" | "builtin_interfaces/msg/Time" => Self::Time,
            "duration" | "builtin_interfaces/Duration" | "builtin_interfaces/msg/Duration" => {
                Self::Duration
            }
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldType {
    Primitive(Primitive),
    Complex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Scalar,
    Fixed(usize),
    Variable,
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    ty: FieldType,
    arity: Arity,
}

#[derive(Debug, Clone, Default)]
pub struct MessageSchema {
    fields: Vec<Field>,
}

/// `a/msg/b` and `a/b` address the same type.
fn normalize_type(name: &str) -> String {
    name.replace("/msg/", "/")
}

fn parse_field_type(raw: &str, package: Option<&str>) -> (FieldType, Arity) {
    let (base, arity) = match raw.find('[') {
        Some(idx) => {
            let inner = &raw[idx + 1..raw.len().saturating_sub(1)];
            let arity = if inner.is_empty() || inner.starts_with("<=") {
                Arity::Variable
            } else {
                inner
                    .parse::<usize>()
                    .map(Arity::Fixed)
                    .unwrap_or(Arity::Variable)
            };
            (&raw[..idx], arity)
        }
        None => (raw, Arity::Scalar),
    };

    if let Some(prim) = Primitive::from_name(base) {
        return (FieldType::Primitive(prim), arity);
    }
    // ROS1 shorthand for std_msgs/Header
    let name = if base == "Header" {
        "std_msgs/Header".to_string()
    } else if base.contains('/') {
        normalize_type(base)
    } else if let Some(pkg) = package {
        format!("{pkg}/{base}")
    } else {
        base.to_string()
    };
    (FieldType::Complex(name), arity)
}

/// Parse one `.msg` definition body.
fn parse_msg_definition(text: &str, package: Option<&str>) -> MessageSchema {
    let mut fields = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(ty), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        // constants (`uint8 FOO=1`) and defaults (`int8 x 5`) carry no wire data
        if name.contains('=') {
            continue;
        }
        let name = name.split('=').next().unwrap_or(name).to_string();
        let (ty, arity) = parse_field_type(ty, package);
        fields.push(Field { name, ty, arity });
    }
    MessageSchema { fields }
}

fn package_of(type_name: &str) -> Option<&str> {
    type_name.split('/').next().filter(|p| !p.is_empty())
}

/// Known message types, looked up by normalized name.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    types: HashMap<String, MessageSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: &str, definition: &str) {
        let normalized = normalize_type(type_name);
        let schema = parse_msg_definition(definition, package_of(&normalized));
        self.types.insert(normalized, schema);
    }

    /// Register a concatenated definition bundle as found in bag connection
    /// headers and MCAP schema records: the top-level definition first, then
    /// dependent types separated by `===` lines with `MSG: pkg/Type` headers.
    pub fn register_bundle(&mut self, top_level_type: &str, bundle: &str) {
        let mut current_type = normalize_type(top_level_type);
        let mut current_body = String::new();
        for line in bundle.lines() {
            if line.starts_with("===") {
                if !current_type.is_empty() {
                    self.register(&current_type.clone(), &current_body);
                }
                current_body.clear();
                current_type.clear();
            } else if let Some(rest) = line.trim().strip_prefix("MSG:") {
                current_type = normalize_type(rest.trim());
            } else if !current_type.is_empty() {
                current_body.push_str(line);
                current_body.push('\n');
            }
        }
        if !current_type.is_empty() {
            self.register(&current_type.clone(), &current_body);
        }
    }

    /// Pre-register custom ROS2 message schemas from `<pkg>/**/*.msg` trees.
    pub fn register_msg_dirs(&mut self, dirs: &[String]) {
        for dir in dirs {
            let root = Path::new(dir);
            let package = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for entry in walkdir::WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("msg") {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(path) else {
                    continue;
                };
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let type_name = format!("{package}/{stem}");
                tracing::debug!(type_name = %type_name, "registered custom message schema");
                self.register(&type_name, &text);
            }
        }
    }

    fn get(&self, type_name: &str) -> Option<&MessageSchema> {
        self.types.get(&normalize_type(type_name))
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Decode a ROS1-serialized payload.
    pub fn decode_ros1(&self, type_name: &str, data: &[u8]) -> Result<Value> {
        let schema = self
            .get(type_name)
            .ok_or_else(|| AgentError::Internal(format!("unknown message type {type_name}")))?;
        let mut cursor = Cursor::new(data, Mode::Ros1, true);
        self.decode_message(schema, &mut cursor, 0)
    }

    /// Decode a CDR payload (ROS2 / MCAP `cdr` encoding), honoring the
    /// 4-byte encapsulation header.
    pub fn decode_cdr(&self, type_name: &str, data: &[u8]) -> Result<Value> {
        if data.len() < 4 {
            return Err(AgentError::Internal("cdr payload too short".into()));
        }
        let little_endian = data[1] & 0x01 == 0x01;
        let schema = self
            .get(type_name)
            .ok_or_else(|| AgentError::Internal(format!("unknown message type {type_name}")))?;
        let mut cursor = Cursor::new(&data[4..], Mode::Cdr, little_endian);
        self.decode_message(schema, &mut cursor, 0)
    }

    fn decode_message(
        &self,
        schema: &MessageSchema,
        cursor: &mut Cursor<'_>,
        depth: usize,
    ) -> Result<Value> {
        if depth > MAX_DECODE_DEPTH {
            return Err(AgentError::Internal("message nesting too deep".into()));
        }
        let mut out = Map::new();
        for field in &schema.fields {
            let value = match field.arity {
                Arity::Scalar => self.decode_field(&field.ty, cursor, depth)?,
                Arity::Fixed(n) => {
                    let mut items = Vec::with_capacity(n);
                    for _ in 0..n {
                        items.push(self.decode_field(&field.ty, cursor, depth)?);
                    }
                    Value::Array(items)
                }
                Arity::Variable => {
                    let n = cursor.read_u32()? as usize;
                    if n > cursor.remaining() {
                        return Err(AgentError::Internal("array length exceeds payload".into()));
                    }
                    let mut items = Vec::with_capacity(n.min(1024));
                    for _ in 0..n {
                        items.push(self.decode_field(&field.ty, cursor, depth)?);
                    }
                    Value::Array(items)
                }
            };
            out.insert(field.name.clone(), value);
        }
        Ok(Value::Object(out))
    }

    fn decode_field(
        &self,
        ty: &FieldType,
        cursor: &mut Cursor<'_>,
        depth: usize,
    ) -> Result<Value> {
        match ty {
            FieldType::Primitive(prim) => cursor.read_primitive(*prim),
            FieldType::Complex(name) => {
                let schema = self
                    .get(name)
                    .ok_or_else(|| AgentError::Internal(format!("unknown message type {name}")))?
                    .clone();
                self.decode_message(&schema, cursor, depth + 1)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Packed little-endian, no alignment.
    Ros1,
    /// XCDR: primitives aligned to their size within the payload.
    Cdr,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    mode: Mode,
    little_endian: bool,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], mode: Mode, little_endian: bool) -> Self {
        Self {
            data,
            pos: 0,
            mode,
            little_endian,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn align(&mut self, size: usize) {
        if self.mode == Mode::Cdr {
            let misaligned = self.pos % size;
            if misaligned != 0 {
                self.pos += size - misaligned;
            }
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(AgentError::Internal("payload truncated".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.align(4);
        let bytes = self.take(4)?;
        Ok(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        // CDR strings carry a trailing NUL inside the length
        let bytes = match self.mode {
            Mode::Cdr => bytes.strip_suffix(&[0]).unwrap_or(bytes),
            Mode::Ros1 => bytes,
        };
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_primitive(&mut self, prim: Primitive) -> Result<Value> {
        macro_rules! fixed {
            ($n:expr, $le:path, $be:path) => {{
                self.align($n);
                let bytes = self.take($n)?;
                if self.little_endian {
                    $le(bytes)
                } else {
                    $be(bytes)
                }
            }};
        }

        Ok(match prim {
            Primitive::Bool => json!(self.take(1)?[0] != 0),
            Primitive::Int8 => json!(self.take(1)?[0] as i8),
            Primitive::UInt8 => json!(self.take(1)?[0]),
            Primitive::Int16 => {
                json!(fixed!(2, LittleEndian::read_i16, BigEndian::read_i16))
            }
            Primitive::UInt16 => {
                json!(fixed!(2, LittleEndian::read_u16, BigEndian::read_u16))
            }
            Primitive::Int32 => {
                json!(fixed!(4, LittleEndian::read_i32, BigEndian::read_i32))
            }
            Primitive::UInt32 => {
                json!(fixed!(4, LittleEndian::read_u32, BigEndian::read_u32))
            }
            Primitive::Int64 => {
                json!(fixed!(8, LittleEndian::read_i64, BigEndian::read_i64))
            }
            Primitive::UInt64 => {
                json!(fixed!(8, LittleEndian::read_u64, BigEndian::read_u64))
            }
            Primitive::Float32 => {
                json!(fixed!(4, LittleEndian::read_f32, BigEndian::read_f32))
            }
            Primitive::Float64 => {
                json!(fixed!(8, LittleEndian::read_f64, BigEndian::read_f64))
            }
            Primitive::String => json!(self.read_string()?),
            Primitive::Time => {
                let secs = self.read_i32()?;
                let nanos = self.read_u32()?;
                json!({"sec": secs, "nanosec": nanos})
            }
            Primitive::Duration => {
                let secs = self.read_i32()?;
                let nanos = self.read_i32()?;
                json!({"sec": secs, "nanosec": nanos})
            }
        })
    }
}
