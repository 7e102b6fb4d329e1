//! Backup frames
//!
//! Each decrypted frame is one field of the outer `BackupFrame` message:
//!
//! ```text
//! 1 header            4 attachment        7 avatar
//! 2 statement         5 version           8 sticker
//! 3 preference        6 end (varint 1)    9 keyValue
//! ```
//!
//! Attachment, avatar and sticker frames announce a payload that follows
//! them in the stream as a separate envelope.

use sigbak_core::{SigbakError, SigbakResult};

use crate::payload::Payload;
use crate::statement::SqlStatementFrame;
use crate::wire::{fields, read_varint, Field, FieldWriter, WireType};

pub const FRAME_HEADER: u32 = 1;
pub const FRAME_STATEMENT: u32 = 2;
pub const FRAME_PREFERENCE: u32 = 3;
pub const FRAME_ATTACHMENT: u32 = 4;
pub const FRAME_VERSION: u32 = 5;
pub const FRAME_END: u32 = 6;
pub const FRAME_AVATAR: u32 = 7;
pub const FRAME_STICKER: u32 = 8;
pub const FRAME_KEY_VALUE: u32 = 9;

fn wrong_type(message: &str, field: u32) -> SigbakError {
    SigbakError::ParseFailure(format!("{message} field {field} has the wrong wire type"))
}

fn u32_field(message: &str, field: &Field<'_>) -> SigbakResult<u32> {
    field
        .value
        .as_u64()
        .map(|v| v as u32)
        .ok_or_else(|| wrong_type(message, field.number))
}

fn u64_field(message: &str, field: &Field<'_>) -> SigbakResult<u64> {
    field
        .value
        .as_u64()
        .ok_or_else(|| wrong_type(message, field.number))
}

fn bytes_field(message: &str, field: &Field<'_>) -> SigbakResult<Vec<u8>> {
    field
        .value
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wrong_type(message, field.number))
}

fn string_field(message: &str, field: &Field<'_>) -> SigbakResult<String> {
    field
        .value
        .as_string()
        .ok_or_else(|| wrong_type(message, field.number))
}

// ── Header ──────────────────────────────────────────────────────────────

/// First frame of every backup; written in the clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFrame {
    pub iv: Option<Vec<u8>>,
    pub salt: Option<Vec<u8>>,
    pub version: Option<u32>,
}

impl HeaderFrame {
    const MSG: &'static str = "Header";

    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            match field.number {
                1 => frame.iv = Some(bytes_field(Self::MSG, &field)?),
                2 => frame.salt = Some(bytes_field(Self::MSG, &field)?),
                3 => frame.version = Some(u32_field(Self::MSG, &field)?),
                _ => {}
            }
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(iv) = &self.iv {
            w.bytes(1, iv);
        }
        if let Some(salt) = &self.salt {
            w.bytes(2, salt);
        }
        if let Some(version) = self.version {
            w.varint(3, u64::from(version));
        }
        w.finish()
    }
}

// ── Shared preference ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedPrefFrame {
    pub file: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub boolean_value: Option<bool>,
    pub string_set_value: Vec<String>,
    pub is_string_set_value: Option<bool>,
}

impl SharedPrefFrame {
    const MSG: &'static str = "SharedPreference";

    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            match field.number {
                1 => frame.file = Some(string_field(Self::MSG, &field)?),
                2 => frame.key = Some(string_field(Self::MSG, &field)?),
                3 => frame.value = Some(string_field(Self::MSG, &field)?),
                4 => frame.boolean_value = Some(u64_field(Self::MSG, &field)? != 0),
                5 => frame.string_set_value.push(string_field(Self::MSG, &field)?),
                6 => frame.is_string_set_value = Some(u64_field(Self::MSG, &field)? != 0),
                _ => {}
            }
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(file) = &self.file {
            w.string(1, file);
        }
        if let Some(key) = &self.key {
            w.string(2, key);
        }
        if let Some(value) = &self.value {
            w.string(3, value);
        }
        if let Some(b) = self.boolean_value {
            w.bool(4, b);
        }
        for s in &self.string_set_value {
            w.string(5, s);
        }
        if let Some(b) = self.is_string_set_value {
            w.bool(6, b);
        }
        w.finish()
    }
}

// ── Payload frames ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentFrame {
    pub row_id: Option<u64>,
    pub attachment_id: Option<u64>,
    pub length: Option<u32>,
    pub payload: Payload,
}

impl AttachmentFrame {
    const MSG: &'static str = "Attachment";

    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            match field.number {
                1 => frame.row_id = Some(u64_field(Self::MSG, &field)?),
                2 => frame.attachment_id = Some(u64_field(Self::MSG, &field)?),
                3 => frame.length = Some(u32_field(Self::MSG, &field)?),
                _ => {}
            }
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(row_id) = self.row_id {
            w.varint(1, row_id);
        }
        if let Some(id) = self.attachment_id {
            w.varint(2, id);
        }
        if let Some(length) = self.length {
            w.varint(3, u64::from(length));
        }
        w.finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvatarFrame {
    pub name: Option<String>,
    pub length: Option<u32>,
    pub recipient_id: Option<String>,
    pub payload: Payload,
}

impl AvatarFrame {
    const MSG: &'static str = "Avatar";

    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            match field.number {
                1 => frame.name = Some(string_field(Self::MSG, &field)?),
                2 => frame.length = Some(u32_field(Self::MSG, &field)?),
                3 => frame.recipient_id = Some(string_field(Self::MSG, &field)?),
                _ => {}
            }
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(name) = &self.name {
            w.string(1, name);
        }
        if let Some(length) = self.length {
            w.varint(2, u64::from(length));
        }
        if let Some(recipient) = &self.recipient_id {
            w.string(3, recipient);
        }
        w.finish()
    }

    /// Recipient this avatar belongs to; older backups only carry `name`.
    pub fn recipient(&self) -> Option<&str> {
        self.recipient_id.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StickerFrame {
    pub row_id: Option<u64>,
    pub length: Option<u32>,
    pub payload: Payload,
}

impl StickerFrame {
    const MSG: &'static str = "Sticker";

    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            match field.number {
                1 => frame.row_id = Some(u64_field(Self::MSG, &field)?),
                2 => frame.length = Some(u32_field(Self::MSG, &field)?),
                _ => {}
            }
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(row_id) = self.row_id {
            w.varint(1, row_id);
        }
        if let Some(length) = self.length {
            w.varint(2, u64::from(length));
        }
        w.finish()
    }
}

// ── Small frames ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseVersionFrame {
    pub version: Option<u32>,
}

impl DatabaseVersionFrame {
    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            if field.number == 1 {
                frame.version = Some(u32_field("DatabaseVersion", &field)?);
            }
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(version) = self.version {
            w.varint(1, u64::from(version));
        }
        w.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyValueValue {
    Blob(Vec<u8>),
    Bool(bool),
    Float(f32),
    Int(i32),
    Long(i64),
    String(String),
}

/// One entry of the app's key-value store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyValueFrame {
    pub key: Option<String>,
    pub value: Option<KeyValueValue>,
}

impl KeyValueFrame {
    const MSG: &'static str = "KeyValue";

    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            let value = match field.number {
                1 => {
                    frame.key = Some(string_field(Self::MSG, &field)?);
                    continue;
                }
                2 => KeyValueValue::Blob(bytes_field(Self::MSG, &field)?),
                3 => KeyValueValue::Bool(u64_field(Self::MSG, &field)? != 0),
                4 => KeyValueValue::Float(
                    field
                        .value
                        .as_f32()
                        .ok_or_else(|| wrong_type(Self::MSG, 4))?,
                ),
                5 => KeyValueValue::Int(u64_field(Self::MSG, &field)? as i32),
                6 => KeyValueValue::Long(u64_field(Self::MSG, &field)? as i64),
                7 => KeyValueValue::String(string_field(Self::MSG, &field)?),
                _ => continue,
            };
            frame.value = Some(value);
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(key) = &self.key {
            w.string(1, key);
        }
        match &self.value {
            Some(KeyValueValue::Blob(b)) => w.bytes(2, b),
            Some(KeyValueValue::Bool(b)) => w.bool(3, *b),
            Some(KeyValueValue::Float(f)) => w.fixed32(4, f.to_le_bytes()),
            // int32 is sign-extended on the wire
            Some(KeyValueValue::Int(i)) => w.varint(5, i64::from(*i) as u64),
            Some(KeyValueValue::Long(l)) => w.varint(6, *l as u64),
            Some(KeyValueValue::String(s)) => w.string(7, s),
            None => &mut w,
        };
        w.finish()
    }
}

// ── Frame ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(HeaderFrame),
    Statement(SqlStatementFrame),
    SharedPreference(SharedPrefFrame),
    Attachment(AttachmentFrame),
    DatabaseVersion(DatabaseVersionFrame),
    End,
    Avatar(AvatarFrame),
    Sticker(StickerFrame),
    KeyValue(KeyValueFrame),
    /// A frame type this version does not know; kept verbatim.
    Unknown { field: u32, data: Vec<u8> },
}

impl Frame {
    pub fn field_number(&self) -> u32 {
        match self {
            Frame::Header(_) => FRAME_HEADER,
            Frame::Statement(_) => FRAME_STATEMENT,
            Frame::SharedPreference(_) => FRAME_PREFERENCE,
            Frame::Attachment(_) => FRAME_ATTACHMENT,
            Frame::DatabaseVersion(_) => FRAME_VERSION,
            Frame::End => FRAME_END,
            Frame::Avatar(_) => FRAME_AVATAR,
            Frame::Sticker(_) => FRAME_STICKER,
            Frame::KeyValue(_) => FRAME_KEY_VALUE,
            Frame::Unknown { field, .. } => *field,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Header(_) => "HEADER",
            Frame::Statement(_) => "SQLSTATEMENT",
            Frame::SharedPreference(_) => "SHAREDPREFERENCE",
            Frame::Attachment(_) => "ATTACHMENT",
            Frame::DatabaseVersion(_) => "DATABASEVERSION",
            Frame::End => "END",
            Frame::Avatar(_) => "AVATAR",
            Frame::Sticker(_) => "STICKER",
            Frame::KeyValue(_) => "KEYVALUE",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Decode the body of a length-delimited frame field.
    pub fn decode_body(field: u32, body: &[u8]) -> SigbakResult<Frame> {
        Ok(match field {
            FRAME_HEADER => Frame::Header(HeaderFrame::decode(body)?),
            FRAME_STATEMENT => Frame::Statement(SqlStatementFrame::decode(body)?),
            FRAME_PREFERENCE => Frame::SharedPreference(SharedPrefFrame::decode(body)?),
            FRAME_ATTACHMENT => Frame::Attachment(AttachmentFrame::decode(body)?),
            FRAME_VERSION => Frame::DatabaseVersion(DatabaseVersionFrame::decode(body)?),
            FRAME_AVATAR => Frame::Avatar(AvatarFrame::decode(body)?),
            FRAME_STICKER => Frame::Sticker(StickerFrame::decode(body)?),
            FRAME_KEY_VALUE => Frame::KeyValue(KeyValueFrame::decode(body)?),
            other => Frame::Unknown {
                field: other,
                data: body.to_vec(),
            },
        })
    }

    /// Serialize as one field of the outer frame message.
    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            Frame::End => {
                let mut w = FieldWriter::new();
                w.bool(FRAME_END, true);
                return w.finish();
            }
            Frame::Header(f) => f.encode(),
            Frame::Statement(f) => f.encode(),
            Frame::SharedPreference(f) => f.encode(),
            Frame::Attachment(f) => f.encode(),
            Frame::DatabaseVersion(f) => f.encode(),
            Frame::Avatar(f) => f.encode(),
            Frame::Sticker(f) => f.encode(),
            Frame::KeyValue(f) => f.encode(),
            Frame::Unknown { data, .. } => data.clone(),
        };
        let mut w = FieldWriter::new();
        w.bytes(self.field_number(), &body);
        w.finish()
    }

    /// Check the fields a frame cannot do without.
    pub fn validate(&self) -> SigbakResult<()> {
        let missing = |what: &str| {
            Err(SigbakError::ParseFailure(format!(
                "{} frame is missing its {what}",
                self.name()
            )))
        };
        match self {
            Frame::Attachment(f) => {
                if f.row_id.is_none() {
                    return missing("rowId");
                }
                if f.attachment_id.is_none() {
                    return missing("attachmentId");
                }
                if f.length.is_none() {
                    return missing("length");
                }
            }
            Frame::Sticker(f) => {
                if f.row_id.is_none() {
                    return missing("rowId");
                }
                if f.length.is_none() {
                    return missing("length");
                }
            }
            Frame::Avatar(f) if f.length.is_none() => return missing("length"),
            Frame::Header(f) if f.iv.as_ref().is_some_and(|iv| iv.len() != 16) => {
                return Err(SigbakError::ParseFailure("header IV is not 16 bytes".into()))
            }
            _ => {}
        }
        Ok(())
    }

    /// Declared payload length of attachment, avatar and sticker frames.
    pub fn payload_length(&self) -> Option<u32> {
        match self {
            Frame::Attachment(f) => f.length,
            Frame::Avatar(f) => f.length,
            Frame::Sticker(f) => f.length,
            _ => None,
        }
    }

    pub fn has_payload(&self) -> bool {
        matches!(
            self,
            Frame::Attachment(_) | Frame::Avatar(_) | Frame::Sticker(_)
        )
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Frame::Attachment(f) => Some(&f.payload),
            Frame::Avatar(f) => Some(&f.payload),
            Frame::Sticker(f) => Some(&f.payload),
            _ => None,
        }
    }

    /// Returns false for frames that carry no payload.
    pub fn set_payload(&mut self, payload: Payload) -> bool {
        match self {
            Frame::Attachment(f) => f.payload = payload,
            Frame::Avatar(f) => f.payload = payload,
            Frame::Sticker(f) => f.payload = payload,
            _ => return false,
        }
        true
    }
}

/// Parse one frame starting at `offset`.
///
/// Returns the frame and the offset just past it, or `None` for anything
/// that is not a well-formed frame (empty input, bad tag, wrong wire type,
/// a length running past the buffer or an undecodable body).
pub fn parse_frame(buf: &[u8], offset: usize) -> Option<(Frame, usize)> {
    let tag = *buf.get(offset)?;
    let field = u32::from(tag >> 3);
    if field == 0 {
        return None;
    }
    let mut pos = offset + 1;

    match WireType::from_tag(u64::from(tag))? {
        WireType::Varint if field == FRAME_END => {
            let value = *buf.get(pos)?;
            (value == 1).then_some((Frame::End, pos + 1))
        }
        WireType::LengthDelimited => {
            let len = usize::try_from(read_varint(buf, &mut pos).ok()?).ok()?;
            if len > buf.len() - pos {
                return None;
            }
            let body = &buf[pos..pos + len];
            match Frame::decode_body(field, body) {
                Ok(frame) => Some((frame, pos + len)),
                Err(e) => {
                    tracing::debug!(field, error = %e, "undecodable frame body");
                    None
                }
            }
        }
        _ => None,
    }
}

/// Whether `buf` holds exactly one well-formed frame. Used to confirm a
/// candidate offset while resynchronising.
pub fn looks_like_frame(buf: &[u8]) -> bool {
    matches!(parse_frame(buf, 0), Some((_, end)) if end == buf.len())
}
