//! Key slot encoding.
//!
//! Fixed-width keys are stored inline in their page slot, little-endian.
//! Strings and raw byte keys are stored out of line: the slot holds a
//! `BlobRef` (byte position + length) pointing at the payload, which is a
//! sequence of UTF-16LE code units for strings and the bytes themselves for
//! raw keys.

// Payload lengths are bounded well below u32::MAX by the key sizes we accept.
#![allow(clippy::cast_possible_truncation)]

use crate::btree::key::{Key, KeyType, ObjectId};
use crate::btree::node::NodeError;

/// Location of an out-of-line key payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRef {
    pub pos: u64,
    pub len: u32,
}

impl BlobRef {
    /// Encoded size of a reference.
    pub const SIZE: usize = 12;

    pub fn write(self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.pos.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
    }

    #[must_use]
    pub fn read(bytes: &[u8]) -> Self {
        Self {
            pos: read_u64(bytes),
            len: u32::from_le_bytes(fixed(&bytes[8..])),
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[..N]);
    buf
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(fixed(bytes))
}

/// Encode a fixed-width key into its slot. Out-of-line keys are left alone.
pub fn encode_inline(key: &Key, out: &mut [u8]) {
    match key {
        Key::Bool(v) => out[0] = u8::from(*v),
        Key::I8(v) => out[..1].copy_from_slice(&v.to_le_bytes()),
        Key::U8(v) => out[0] = *v,
        Key::I16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
        Key::U16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
        Key::I32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
        Key::U32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
        Key::F32(v) => out[..4].copy_from_slice(&v.to_bits().to_le_bytes()),
        Key::I64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
        Key::U64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
        Key::F64(v) => out[..8].copy_from_slice(&v.to_bits().to_le_bytes()),
        Key::Object(id) => out[..8].copy_from_slice(&id.0.to_le_bytes()),
        Key::Decimal(v) => out[..16].copy_from_slice(&v.to_le_bytes()),
        Key::Guid(bytes) => out[..16].copy_from_slice(bytes),
        Key::String(_) | Key::Raw(_) => {}
    }
}

/// Decode a fixed-width key from its slot.
///
/// Returns `None` for out-of-line key types.
#[must_use]
pub fn decode_inline(key_type: KeyType, bytes: &[u8]) -> Option<Key> {
    Some(match key_type {
        KeyType::Bool => Key::Bool(bytes[0] != 0),
        KeyType::I8 => Key::I8(i8::from_le_bytes(fixed(bytes))),
        KeyType::U8 => Key::U8(bytes[0]),
        KeyType::I16 => Key::I16(i16::from_le_bytes(fixed(bytes))),
        KeyType::U16 => Key::U16(u16::from_le_bytes(fixed(bytes))),
        KeyType::I32 => Key::I32(i32::from_le_bytes(fixed(bytes))),
        KeyType::U32 => Key::U32(u32::from_le_bytes(fixed(bytes))),
        KeyType::F32 => Key::F32(f32::from_bits(u32::from_le_bytes(fixed(bytes)))),
        KeyType::I64 => Key::I64(i64::from_le_bytes(fixed(bytes))),
        KeyType::U64 => Key::U64(read_u64(bytes)),
        KeyType::F64 => Key::F64(f64::from_bits(read_u64(bytes))),
        KeyType::Object => Key::Object(ObjectId(read_u64(bytes))),
        KeyType::Decimal => Key::Decimal(i128::from_le_bytes(fixed(bytes))),
        KeyType::Guid => Key::Guid(fixed(bytes)),
        KeyType::String | KeyType::Raw => return None,
    })
}

/// Payload bytes of an out-of-line key.
#[must_use]
pub fn payload(key: &Key) -> Vec<u8> {
    match key {
        Key::String(s) => s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        Key::Raw(bytes) => bytes.clone(),
        _ => Vec::new(),
    }
}

/// Rebuild an out-of-line key from its payload.
pub fn from_payload(key_type: KeyType, bytes: &[u8]) -> Result<Key, NodeError> {
    match key_type {
        KeyType::String => {
            if bytes.len() % 2 != 0 {
                return Err(NodeError::InvalidString);
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units)
                .map(Key::String)
                .map_err(|_| NodeError::InvalidString)
        }
        KeyType::Raw => Ok(Key::Raw(bytes.to_vec())),
        other => Err(NodeError::InvalidHeader(format!(
            "{other} keys have no out-of-line payload"
        ))),
    }
}

/// Placeholder for an out-of-line key whose payload has not been read yet.
#[must_use]
pub const fn placeholder(key_type: KeyType) -> Key {
    match key_type {
        KeyType::Raw => Key::Raw(Vec::new()),
        _ => Key::String(String::new()),
    }
}

/// Length of a payload as stored in a `BlobRef`.
#[must_use]
pub const fn payload_len(payload: &[u8]) -> u32 {
    payload.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(key: &Key) -> Key {
        let mut slot = [0u8; 16];
        encode_inline(key, &mut slot);
        decode_inline(key.key_type(), &slot).expect("inline key")
    }

    #[test]
    fn test_inline_keys_survive_encoding() {
        let keys = [
            Key::Bool(true),
            Key::I8(-7),
            Key::I16(i16::MIN),
            Key::U32(u32::MAX),
            Key::I64(i64::MIN),
            Key::F64(-2.5),
            Key::Decimal(-12_345_678_901_234_567_890),
            Key::Guid([9u8; 16]),
            Key::Object(ObjectId(77)),
        ];
        for key in &keys {
            assert_eq!(&roundtrip(key), key);
        }
    }

    #[test]
    fn test_nan_keeps_its_bits() {
        let Key::F32(value) = roundtrip(&Key::F32(f32::NAN)) else {
            panic!("expected an f32 key");
        };
        assert!(value.is_nan());
    }

    #[test]
    fn test_string_payload_is_utf16() {
        let key = Key::from("h\u{e9}\u{1F600}");
        let bytes = payload(&key);
        assert_eq!(bytes.len(), 8);
        assert_eq!(from_payload(KeyType::String, &bytes).expect("decode"), key);
    }

    #[test]
    fn test_invalid_string_payload() {
        assert!(matches!(
            from_payload(KeyType::String, &[0x00]),
            Err(NodeError::InvalidString)
        ));
        // A lone high surrogate.
        assert!(matches!(
            from_payload(KeyType::String, &[0x3D, 0xD8]),
            Err(NodeError::InvalidString)
        ));
    }

    #[test]
    fn test_out_of_line_keys_have_no_inline_form() {
        assert!(decode_inline(KeyType::String, &[0u8; 12]).is_none());
        let blob = BlobRef { pos: 4096 * 3 + 32, len: 10 };
        let mut slot = [0u8; BlobRef::SIZE];
        blob.write(&mut slot);
        assert_eq!(BlobRef::read(&slot), blob);
    }
}
