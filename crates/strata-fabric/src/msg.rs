//! Typed message containers and the field wire codec.
//!
//! A message type is bound at registration time to an immutable
//! [`MsgTemplate`]: one [`FieldKind`] per field index. Messages are sparse:
//! only set fields travel on the wire, each as a `(field id, kind tag,
//! value)` group. Decode rejects anything that disagrees with the template;
//! the fabric never guesses at unregistered layouts.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FabricError, Result};

/// Message type identifier, unique per registered template.
pub type MsgType = u16;

/// Kind of a single template field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// UTF-8 string.
    Str,
    /// Opaque byte buffer.
    Bytes,
    /// Array of 64-bit unsigned integers.
    U64Array,
}

impl FieldKind {
    fn wire_tag(self) -> u8 {
        match self {
            FieldKind::U32 => 0,
            FieldKind::U64 => 1,
            FieldKind::Str => 2,
            FieldKind::Bytes => 3,
            FieldKind::U64Array => 4,
        }
    }

    fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FieldKind::U32),
            1 => Some(FieldKind::U64),
            2 => Some(FieldKind::Str),
            3 => Some(FieldKind::Bytes),
            4 => Some(FieldKind::U64Array),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::U32 => "u32",
            FieldKind::U64 => "u64",
            FieldKind::Str => "str",
            FieldKind::Bytes => "bytes",
            FieldKind::U64Array => "u64-array",
        };
        f.write_str(name)
    }
}

/// Immutable field schema for one message type; field id is the index.
#[derive(Debug, Clone)]
pub struct MsgTemplate {
    fields: Vec<FieldKind>,
}

impl MsgTemplate {
    /// Builds a template from an ordered field-kind list.
    pub fn new(fields: &[FieldKind]) -> Self {
        Self {
            fields: fields.to_vec(),
        }
    }

    /// Number of fields in the schema.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Kind of the field at `id`, if the schema has one.
    pub fn field_kind(&self, id: usize) -> Option<FieldKind> {
        self.fields.get(id).copied()
    }
}

/// A set field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// UTF-8 string.
    Str(String),
    /// Opaque byte buffer.
    Bytes(Bytes),
    /// Array of 64-bit unsigned integers.
    U64Array(Vec<u64>),
}

impl FieldValue {
    fn kind(&self) -> FieldKind {
        match self {
            FieldValue::U32(_) => FieldKind::U32,
            FieldValue::U64(_) => FieldKind::U64,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Bytes(_) => FieldKind::Bytes,
            FieldValue::U64Array(_) => FieldKind::U64Array,
        }
    }

    fn wire_size(&self) -> usize {
        match self {
            FieldValue::U32(_) => 4,
            FieldValue::U64(_) => 8,
            FieldValue::Str(s) => 4 + s.len(),
            FieldValue::Bytes(b) => 4 + b.len(),
            FieldValue::U64Array(v) => 4 + v.len() * 8,
        }
    }
}

/// Typed mutable message, exclusively owned by whoever currently holds it.
#[derive(Debug)]
pub struct Msg {
    msg_type: MsgType,
    template: Arc<MsgTemplate>,
    fields: Vec<Option<FieldValue>>,
}

impl Msg {
    pub(crate) fn new(msg_type: MsgType, template: Arc<MsgTemplate>) -> Self {
        let fields = vec![None; template.len()];
        Self {
            msg_type,
            template,
            fields,
        }
    }

    /// The message's registered type.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// The template this message was allocated against.
    pub fn template(&self) -> &MsgTemplate {
        &self.template
    }

    /// Whether the field at `id` is set.
    pub fn is_set(&self, id: usize) -> bool {
        matches!(self.fields.get(id), Some(Some(_)))
    }

    /// Clears all fields; called by the pool on every release so reuse can
    /// never observe residual data.
    pub(crate) fn clear(&mut self) {
        for field in &mut self.fields {
            *field = None;
        }
    }

    fn set(&mut self, id: usize, value: FieldValue) -> Result<()> {
        let expected = self.template.field_kind(id).ok_or_else(|| FabricError::BadMessage {
            reason: format!("field {id} out of range for type {}", self.msg_type),
        })?;
        if expected != value.kind() {
            return Err(FabricError::BadMessage {
                reason: format!(
                    "field {id} of type {} is {expected}, not {}",
                    self.msg_type,
                    value.kind()
                ),
            });
        }
        self.fields[id] = Some(value);
        Ok(())
    }

    /// Sets a `u32` field.
    pub fn set_u32(&mut self, id: usize, value: u32) -> Result<()> {
        self.set(id, FieldValue::U32(value))
    }

    /// Sets a `u64` field.
    pub fn set_u64(&mut self, id: usize, value: u64) -> Result<()> {
        self.set(id, FieldValue::U64(value))
    }

    /// Sets a string field.
    pub fn set_str(&mut self, id: usize, value: impl Into<String>) -> Result<()> {
        self.set(id, FieldValue::Str(value.into()))
    }

    /// Sets a byte-buffer field.
    pub fn set_bytes(&mut self, id: usize, value: Bytes) -> Result<()> {
        self.set(id, FieldValue::Bytes(value))
    }

    /// Sets a `u64`-array field.
    pub fn set_u64_array(&mut self, id: usize, value: Vec<u64>) -> Result<()> {
        self.set(id, FieldValue::U64Array(value))
    }

    /// Reads a `u32` field; `None` when unset.
    pub fn get_u32(&self, id: usize) -> Option<u32> {
        match self.fields.get(id) {
            Some(Some(FieldValue::U32(v))) => Some(*v),
            _ => None,
        }
    }

    /// Reads a `u64` field; `None` when unset.
    pub fn get_u64(&self, id: usize) -> Option<u64> {
        match self.fields.get(id) {
            Some(Some(FieldValue::U64(v))) => Some(*v),
            _ => None,
        }
    }

    /// Reads a string field; `None` when unset.
    pub fn get_str(&self, id: usize) -> Option<&str> {
        match self.fields.get(id) {
            Some(Some(FieldValue::Str(s))) => Some(s),
            _ => None,
        }
    }

    /// Reads a byte-buffer field; `None` when unset.
    pub fn get_bytes(&self, id: usize) -> Option<&Bytes> {
        match self.fields.get(id) {
            Some(Some(FieldValue::Bytes(b))) => Some(b),
            _ => None,
        }
    }

    /// Reads a `u64`-array field; `None` when unset.
    pub fn get_u64_array(&self, id: usize) -> Option<&[u64]> {
        match self.fields.get(id) {
            Some(Some(FieldValue::U64Array(v))) => Some(v),
            _ => None,
        }
    }

    /// Encoded payload size of the currently set fields.
    pub fn wire_size(&self) -> usize {
        self.fields
            .iter()
            .flatten()
            .map(|v| 3 + v.wire_size())
            .sum()
    }

    /// Appends the set fields to `buf` in field-id order.
    pub fn encode(&self, buf: &mut BytesMut) {
        for (id, field) in self.fields.iter().enumerate() {
            let Some(value) = field else { continue };
            buf.put_u16(id as u16);
            buf.put_u8(value.kind().wire_tag());
            match value {
                FieldValue::U32(v) => buf.put_u32(*v),
                FieldValue::U64(v) => buf.put_u64(*v),
                FieldValue::Str(s) => {
                    buf.put_u32(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                FieldValue::Bytes(b) => {
                    buf.put_u32(b.len() as u32);
                    buf.put_slice(b);
                }
                FieldValue::U64Array(v) => {
                    buf.put_u32(v.len() as u32);
                    for item in v {
                        buf.put_u64(*item);
                    }
                }
            }
        }
    }

    /// Decodes a payload into this message, replacing any set fields.
    ///
    /// Byte-buffer fields are zero-copy slices of `payload`. Any field the
    /// template does not declare, kind mismatch, or truncation fails with
    /// [`FabricError::BadMessage`].
    pub fn decode_from(&mut self, payload: &Bytes) -> Result<()> {
        self.clear();
        let mut buf = payload.clone();
        while buf.has_remaining() {
            ensure(&buf, 3, "field header")?;
            let id = buf.get_u16() as usize;
            let tag = buf.get_u8();
            let kind = FieldKind::from_wire_tag(tag).ok_or_else(|| FabricError::BadMessage {
                reason: format!("unknown field kind tag {tag}"),
            })?;
            let value = match kind {
                FieldKind::U32 => {
                    ensure(&buf, 4, "u32 field")?;
                    FieldValue::U32(buf.get_u32())
                }
                FieldKind::U64 => {
                    ensure(&buf, 8, "u64 field")?;
                    FieldValue::U64(buf.get_u64())
                }
                FieldKind::Str => {
                    ensure(&buf, 4, "str length")?;
                    let len = buf.get_u32() as usize;
                    ensure(&buf, len, "str field")?;
                    let raw = buf.copy_to_bytes(len);
                    let s = std::str::from_utf8(&raw)
                        .map_err(|_| FabricError::BadMessage {
                            reason: format!("field {id} is not valid utf-8"),
                        })?
                        .to_string();
                    FieldValue::Str(s)
                }
                FieldKind::Bytes => {
                    ensure(&buf, 4, "bytes length")?;
                    let len = buf.get_u32() as usize;
                    ensure(&buf, len, "bytes field")?;
                    FieldValue::Bytes(buf.copy_to_bytes(len))
                }
                FieldKind::U64Array => {
                    ensure(&buf, 4, "array length")?;
                    let count = buf.get_u32() as usize;
                    ensure(&buf, count * 8, "array field")?;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(buf.get_u64());
                    }
                    FieldValue::U64Array(items)
                }
            };
            self.set(id, value)?;
        }
        Ok(())
    }
}

fn ensure(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(FabricError::BadMessage {
            reason: format!("truncated {what}"),
        });
    }
    Ok(())
}
