//! Index key types.
//!
//! Every index is homogeneous: all of its keys share one `KeyType`, fixed
//! when the index is created. Comparison is always three-way branching on
//! the native value, never subtraction, so extreme integers order correctly.
//!
//! # Ordering
//!
//! - Integers, decimals and object ids: numeric order.
//! - Floats: numeric order with `-0.0 == 0.0`; NaN equals NaN and sorts
//!   after every other value.
//! - Guids: bytewise.
//! - Strings: ordinal order of their UTF-16 code units.
//! - Raw byte keys: lexicographic (memcmp) order.

use std::cmp::Ordering;

/// Identifier of an indexed object. Stored as the value of each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The type of every key in one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Bool = 1,
    I8 = 2,
    U8 = 3,
    I16 = 4,
    U16 = 5,
    I32 = 6,
    U32 = 7,
    I64 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    /// Fixed-point decimal held as a scaled `i128`.
    Decimal = 12,
    /// 16-byte globally unique identifier.
    Guid = 13,
    String = 14,
    Raw = 15,
    /// Reference to another object.
    Object = 16,
}

impl KeyType {
    /// Width of a key slot in an index page.
    ///
    /// Strings and raw keys are stored out of line; their slot holds a
    /// position (8 bytes) and a length (4 bytes).
    #[must_use]
    pub const fn slot_width(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::Object => 8,
            Self::String | Self::Raw => 12,
            Self::Decimal | Self::Guid => 16,
        }
    }

    /// Whether keys of this type live outside the index page.
    #[must_use]
    pub const fn is_out_of_line(self) -> bool {
        matches!(self, Self::String | Self::Raw)
    }
}

impl TryFrom<u8> for KeyType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Bool,
            2 => Self::I8,
            3 => Self::U8,
            4 => Self::I16,
            5 => Self::U16,
            6 => Self::I32,
            7 => Self::U32,
            8 => Self::I64,
            9 => Self::U64,
            10 => Self::F32,
            11 => Self::F64,
            12 => Self::Decimal,
            13 => Self::Guid,
            14 => Self::String,
            15 => Self::Raw,
            16 => Self::Object,
            _ => return Err(value),
        })
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A typed index key.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(i128),
    Guid([u8; 16]),
    String(String),
    Raw(Vec<u8>),
    Object(ObjectId),
}

impl Key {
    /// The type of this key.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Bool(_) => KeyType::Bool,
            Self::I8(_) => KeyType::I8,
            Self::U8(_) => KeyType::U8,
            Self::I16(_) => KeyType::I16,
            Self::U16(_) => KeyType::U16,
            Self::I32(_) => KeyType::I32,
            Self::U32(_) => KeyType::U32,
            Self::I64(_) => KeyType::I64,
            Self::U64(_) => KeyType::U64,
            Self::F32(_) => KeyType::F32,
            Self::F64(_) => KeyType::F64,
            Self::Decimal(_) => KeyType::Decimal,
            Self::Guid(_) => KeyType::Guid,
            Self::String(_) => KeyType::String,
            Self::Raw(_) => KeyType::Raw,
            Self::Object(_) => KeyType::Object,
        }
    }

    /// Three-way comparison of two keys of the same type.
    ///
    /// Keys of different types order by their type tag.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::I8(a), Self::I8(b)) => a.cmp(b),
            (Self::U8(a), Self::U8(b)) => a.cmp(b),
            (Self::I16(a), Self::I16(b)) => a.cmp(b),
            (Self::U16(a), Self::U16(b)) => a.cmp(b),
            (Self::I32(a), Self::I32(b)) => a.cmp(b),
            (Self::U32(a), Self::U32(b)) => a.cmp(b),
            (Self::I64(a), Self::I64(b)) => a.cmp(b),
            (Self::U64(a), Self::U64(b)) => a.cmp(b),
            (Self::F32(a), Self::F32(b)) => compare_floats(f64::from(*a), f64::from(*b)),
            (Self::F64(a), Self::F64(b)) => compare_floats(*a, *b),
            (Self::Decimal(a), Self::Decimal(b)) => a.cmp(b),
            (Self::Guid(a), Self::Guid(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.encode_utf16().cmp(b.encode_utf16()),
            (Self::Raw(a), Self::Raw(b)) => a.as_slice().cmp(b.as_slice()),
            (Self::Object(a), Self::Object(b)) => a.cmp(b),
            _ => (self.key_type() as u8).cmp(&(other.key_type() as u8)),
        }
    }

    /// Whether this key begins with `prefix`. Only strings and raw keys
    /// have prefixes.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        match (self, prefix) {
            (Self::String(s), Self::String(p)) => s.starts_with(p.as_str()),
            (Self::Raw(s), Self::Raw(p)) => s.starts_with(p),
            _ => false,
        }
    }
}

fn compare_floats(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b)
        .unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}m"),
            Self::Guid(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Self::String(s) => write!(f, "{s:?}"),
            Self::Raw(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Object(id) => write!(f, "{id}"),
        }
    }
}

macro_rules! key_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Key {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

key_from! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Raw,
    ObjectId => Object,
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Self::Raw(value.to_vec())
    }
}

/// One end of a key range.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub key: Key,
    pub inclusive: bool,
}

impl Bound {
    /// A bound that admits `key` itself.
    pub fn inclusive(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            inclusive: true,
        }
    }

    /// A bound that excludes `key` itself.
    pub fn exclusive(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            inclusive: false,
        }
    }

    /// Whether `item` falls before this bound used as a lower bound.
    pub(crate) fn is_below(&self, item: Option<&Key>) -> bool {
        item.is_some_and(|item| match self.key.compare(item) {
            Ordering::Greater => true,
            Ordering::Equal => !self.inclusive,
            Ordering::Less => false,
        })
    }

    /// Whether `item` falls after this bound used as an upper bound.
    ///
    /// A missing item stands for the open end of an internal page and is
    /// always above.
    pub(crate) fn is_above(&self, item: Option<&Key>) -> bool {
        item.is_none_or(|item| match self.key.compare(item) {
            Ordering::Less => true,
            Ordering::Equal => !self.inclusive,
            Ordering::Greater => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_tags_roundtrip() {
        for tag in 1..=16u8 {
            let key_type = KeyType::try_from(tag).expect("valid tag");
            assert_eq!(key_type as u8, tag);
        }
        assert_eq!(KeyType::try_from(0), Err(0));
        assert_eq!(KeyType::try_from(17), Err(17));
    }

    #[test]
    fn test_extreme_integers_compare_correctly() {
        let min = Key::I64(i64::MIN);
        let max = Key::I64(i64::MAX);
        assert_eq!(min.compare(&max), Ordering::Less);
        assert_eq!(max.compare(&min), Ordering::Greater);

        let high = Key::U64(u64::MAX);
        let low = Key::U64(1);
        assert_eq!(high.compare(&low), Ordering::Greater);

        assert_eq!(
            Key::Decimal(i128::MIN).compare(&Key::Decimal(i128::MAX)),
            Ordering::Less
        );
    }

    #[test]
    fn test_float_ordering() {
        assert_eq!(Key::F64(-0.0).compare(&Key::F64(0.0)), Ordering::Equal);
        assert_eq!(Key::F64(f64::NAN).compare(&Key::F64(f64::NAN)), Ordering::Equal);
        assert_eq!(
            Key::F64(f64::NAN).compare(&Key::F64(f64::INFINITY)),
            Ordering::Greater
        );
        assert_eq!(Key::F32(-1.5).compare(&Key::F32(f32::NAN)), Ordering::Less);
        assert_eq!(Key::F32(2.0).compare(&Key::F32(1.0)), Ordering::Greater);
    }

    #[test]
    fn test_strings_order_by_utf16_units() {
        // U+FF61 is a single UTF-16 unit above the surrogate range, while
        // U+1F600 encodes as a surrogate pair starting at 0xD83D.
        let bmp = Key::from("\u{FF61}");
        let astral = Key::from("\u{1F600}");
        assert_eq!(astral.compare(&bmp), Ordering::Less);

        assert_eq!(Key::from("ab").compare(&Key::from("abc")), Ordering::Less);
        assert_eq!(Key::from("b").compare(&Key::from("abc")), Ordering::Greater);
    }

    #[test]
    fn test_raw_keys_compare_bytewise() {
        let a = Key::from(&[0x01u8, 0xFF][..]);
        let b = Key::from(&[0x02u8][..]);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert!(a.starts_with(&Key::from(&[0x01u8][..])));
    }

    #[test]
    fn test_prefix_only_for_strings_and_raw() {
        assert!(Key::from("abc").starts_with(&Key::from("ab")));
        assert!(!Key::from("abc").starts_with(&Key::from("b")));
        assert!(!Key::I32(12).starts_with(&Key::I32(1)));
    }

    #[test]
    fn test_bounds() {
        let five = Key::I32(5);
        assert!(Bound::exclusive(5).is_below(Some(&five)));
        assert!(!Bound::inclusive(5).is_below(Some(&five)));
        assert!(Bound::exclusive(5).is_above(Some(&five)));
        assert!(!Bound::inclusive(5).is_above(Some(&five)));
        assert!(Bound::inclusive(5).is_above(None));
        assert!(!Bound::inclusive(5).is_below(None));
    }
}
