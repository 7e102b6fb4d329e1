//! Protobuf wire primitives
//!
//! Only what the backup frames use: varints, 32/64-bit fixed values and
//! length-delimited fields. Groups are rejected.

use sigbak_core::{SigbakError, SigbakResult};

/// Longest valid varint encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    StartGroup,
    EndGroup,
    Fixed32,
}

impl WireType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag & 0x7 {
            0 => Some(Self::Varint),
            1 => Some(Self::Fixed64),
            2 => Some(Self::LengthDelimited),
            3 => Some(Self::StartGroup),
            4 => Some(Self::EndGroup),
            5 => Some(Self::Fixed32),
            _ => None,
        }
    }

    pub fn bits(self) -> u64 {
        match self {
            Self::Varint => 0,
            Self::Fixed64 => 1,
            Self::LengthDelimited => 2,
            Self::StartGroup => 3,
            Self::EndGroup => 4,
            Self::Fixed32 => 5,
        }
    }
}

/// Decode a varint at `*pos`, advancing `pos` past it.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> SigbakResult<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = *buf.get(*pos + i).ok_or_else(|| {
            SigbakError::ParseFailure(format!("varint at offset {} runs past the buffer", *pos))
        })?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *pos += i + 1;
            return Ok(value);
        }
    }
    Err(SigbakError::ParseFailure(format!(
        "varint at offset {} is longer than {MAX_VARINT_LEN} bytes",
        *pos
    )))
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64([u8; 8]),
    Bytes(&'a [u8]),
    Fixed32([u8; 4]),
}

impl<'a> FieldValue<'a> {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Varint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_u64().map(|v| v != 0)
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Self::Bytes(b) => Some(*b),
            _ => None,
        }
    }

    /// UTF-8 text of a length-delimited field; invalid sequences are replaced.
    pub fn as_string(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Fixed64(b) => Some(f64::from_le_bytes(*b)),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Fixed32(b) => Some(f32::from_le_bytes(*b)),
            _ => None,
        }
    }
}

/// One decoded field, with the raw bytes it occupied (tag included).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field<'a> {
    pub number: u32,
    pub value: FieldValue<'a>,
    pub raw: &'a [u8],
}

/// Iterates the fields of one message. Stops after the first error.
#[derive(Debug, Clone)]
pub struct FieldIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

pub fn fields(buf: &[u8]) -> FieldIter<'_> {
    FieldIter {
        buf,
        pos: 0,
        failed: false,
    }
}

impl<'a> FieldIter<'a> {
    fn next_field(&mut self) -> SigbakResult<Field<'a>> {
        let start = self.pos;
        let tag = read_varint(self.buf, &mut self.pos)?;
        let number = u32::try_from(tag >> 3)
            .ok()
            .filter(|n| *n != 0)
            .ok_or_else(|| SigbakError::ParseFailure(format!("invalid field number in tag {tag:#x}")))?;
        let wire = WireType::from_tag(tag)
            .ok_or_else(|| SigbakError::ParseFailure(format!("invalid wire type in tag {tag:#x}")))?;

        let value = match wire {
            WireType::Varint => FieldValue::Varint(read_varint(self.buf, &mut self.pos)?),
            WireType::Fixed64 => FieldValue::Fixed64(self.take::<8>()?),
            WireType::Fixed32 => FieldValue::Fixed32(self.take::<4>()?),
            WireType::LengthDelimited => {
                let len = read_varint(self.buf, &mut self.pos)?;
                let remaining = self.buf.len() - self.pos;
                let len = usize::try_from(len)
                    .ok()
                    .filter(|l| *l <= remaining)
                    .ok_or_else(|| {
                        SigbakError::ParseFailure(format!(
                            "field {number} declares {len} bytes, {remaining} remain"
                        ))
                    })?;
                let bytes = &self.buf[self.pos..self.pos + len];
                self.pos += len;
                FieldValue::Bytes(bytes)
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(SigbakError::ParseFailure(format!(
                    "field {number} uses unsupported group encoding"
                )))
            }
        };

        Ok(Field {
            number,
            value,
            raw: &self.buf[start..self.pos],
        })
    }

    fn take<const N: usize>(&mut self) -> SigbakResult<[u8; N]> {
        let bytes: [u8; N] = self
            .buf
            .get(self.pos..self.pos + N)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                SigbakError::ParseFailure(format!(
                    "fixed{} field at offset {} runs past the buffer",
                    N * 8,
                    self.pos
                ))
            })?;
        self.pos += N;
        Ok(bytes)
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = SigbakResult<Field<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let item = self.next_field();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

/// Appends encoded fields to a buffer.
#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, number: u32, wire: WireType) {
        write_varint(&mut self.buf, (u64::from(number) << 3) | wire.bits());
    }

    pub fn varint(&mut self, number: u32, value: u64) -> &mut Self {
        self.tag(number, WireType::Varint);
        write_varint(&mut self.buf, value);
        self
    }

    pub fn bool(&mut self, number: u32, value: bool) -> &mut Self {
        self.varint(number, u64::from(value))
    }

    pub fn bytes(&mut self, number: u32, value: &[u8]) -> &mut Self {
        self.tag(number, WireType::LengthDelimited);
        write_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(&mut self, number: u32, value: &str) -> &mut Self {
        self.bytes(number, value.as_bytes())
    }

    pub fn fixed64(&mut self, number: u32, value: [u8; 8]) -> &mut Self {
        self.tag(number, WireType::Fixed64);
        self.buf.extend_from_slice(&value);
        self
    }

    pub fn fixed32(&mut self, number: u32, value: [u8; 4]) -> &mut Self {
        self.tag(number, WireType::Fixed32);
        self.buf.extend_from_slice(&value);
        self
    }

    /// Copy already-encoded fields through unchanged.
    pub fn raw(&mut self, encoded: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(encoded);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
