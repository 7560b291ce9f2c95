//! Wire serialization primitives.
//!
//! Every multi-byte integer is little-endian. Variable-length integers use
//! the compact form (one byte below 0xFD, then 0xFD/0xFE/0xFF prefixes) and
//! must be canonically encoded: a value that fits a shorter form is rejected
//! when read in a longer one.

use std::fmt;

use elaspv_consensus::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The input ended before the requested bytes.
    Eof,
    /// A variable-length integer exceeded the caller-supplied maximum.
    Range,
    /// A variable-length integer used a longer form than its value needs.
    NonCanonicalVarInt,
    /// A value decoder finished with input left over.
    TrailingBytes,
    /// A var-string was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Eof => write!(f, "unexpected end of input"),
            DecodeError::Range => write!(f, "value out of range"),
            DecodeError::NonCanonicalVarInt => write!(f, "non-canonical varint encoding"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after value"),
            DecodeError::InvalidUtf8 => write!(f, "string is not valid utf-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Types with a stable wire layout, written through an [`Encoder`].
pub trait WireEncode {
    fn encode_into(&self, encoder: &mut Encoder);
}

/// Types with a stable wire layout, read back through a [`Decoder`].
pub trait WireDecode: Sized {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError>;
}

/// Serialize a value to a fresh byte vector.
pub fn to_bytes<T: WireEncode>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.encode_into(&mut encoder);
    encoder.into_inner()
}

/// Deserialize a value, requiring the input to be fully consumed.
pub fn from_bytes<T: WireDecode>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::decode_from(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        if value < 0xFD {
            self.write_u8(value as u8);
        } else if value <= 0xFFFF {
            self.write_u8(0xFD);
            self.write_u16_le(value as u16);
        } else if value <= 0xFFFF_FFFF {
            self.write_u8(0xFE);
            self.write_u32_le(value as u32);
        } else {
            self.write_u8(0xFF);
            self.write_u64_le(value);
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::Eof);
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    /// Read a compact varint, rejecting non-canonical encodings.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        self.read_varint_max(u64::MAX)
    }

    /// Read a compact varint with an upper bound on the decoded value.
    pub fn read_varint_max(&mut self, max: u64) -> Result<u64, DecodeError> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0xFD => {
                let value = u64::from(self.read_u16_le()?);
                if value < 0xFD {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xFE => {
                let value = u64::from(self.read_u32_le()?);
                if value <= 0xFFFF {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xFF => {
                let value = self.read_u64_le()?;
                if value <= 0xFFFF_FFFF {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            literal => u64::from(literal),
        };
        if value > max {
            return Err(DecodeError::Range);
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        self.read_var_bytes_max(u64::MAX)
    }

    pub fn read_var_bytes_max(&mut self, max: u64) -> Result<Vec<u8>, DecodeError> {
        let length = self.read_varint_max(max)?;
        let length = usize::try_from(length).map_err(|_| DecodeError::Range)?;
        Ok(self.read_bytes(length)?.to_vec())
    }

    pub fn read_var_str(&mut self, max: u64) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes_max(max)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}
