//! Keys are hashed and compared as byte strings.
//!
//! A map is bound to one [`KeyKind`]: either every key has the same fixed
//! width (at most 8 bytes, stored inline in the index table) or keys are
//! variable-length byte strings that are never stored at all.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

/// Widest key that is stored inline in an index slot.
pub const MAX_FIXED_WIDTH: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Every key encodes to exactly this many bytes (1..=8).
    Fixed(u8),
    /// Keys of any length, verified through a secondary hash.
    Bytes,
}

impl KeyKind {
    #[inline]
    pub fn accepts(self, len: usize) -> bool {
        match self {
            KeyKind::Fixed(width) => len == width as usize,
            KeyKind::Bytes => true,
        }
    }

    #[inline]
    pub fn is_fixed(self) -> bool {
        match self {
            KeyKind::Fixed(_) => true,
            KeyKind::Bytes => false,
        }
    }

    pub(crate) fn is_valid(self) -> bool {
        match self {
            KeyKind::Fixed(width) => width >= 1 && width <= MAX_FIXED_WIDTH,
            KeyKind::Bytes => true,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            KeyKind::Fixed(width) => write!(f, "fixed {}-byte key", width),
            KeyKind::Bytes => write!(f, "byte-string key"),
        }
    }
}

/// Encoded form of a key. Integers encode inline, byte strings borrow.
#[derive(Clone, Copy)]
pub enum KeyBytes<'a> {
    Inline([u8; 8], u8),
    Borrowed(&'a [u8]),
}

impl KeyBytes<'static> {
    /// The low `width` bytes of `value`, little endian.
    #[inline]
    pub fn inline(value: u64, width: u8) -> KeyBytes<'static> {
        debug_assert!(width >= 1 && width <= MAX_FIXED_WIDTH);
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        KeyBytes::Inline(buf, width)
    }
}

impl<'a> KeyBytes<'a> {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            KeyBytes::Inline(buf, len) => &buf[..*len as usize],
            KeyBytes::Borrowed(bytes) => *bytes,
        }
    }
}

/// Anything usable as a map key.
///
/// Two keys are the same key iff their encodings are byte-for-byte equal,
/// so `encode` must agree with `Eq` on the implementing type.
pub trait Key {
    /// Kind a map adopts when it is first given a key of this type and no
    /// kind was configured.
    const KIND: KeyKind;

    fn encode(&self) -> KeyBytes<'_>;
}

macro_rules! int_key {
    ($($ty:ty => $width:expr),*) => {
        $(
            impl Key for $ty {
                const KIND: KeyKind = KeyKind::Fixed($width);

                #[inline]
                fn encode(&self) -> KeyBytes<'_> {
                    let mut buf = [0u8; 8];
                    buf[..$width].copy_from_slice(&self.to_le_bytes());
                    KeyBytes::Inline(buf, $width)
                }
            }
        )*
    };
}

int_key!(u8 => 1, i8 => 1, u16 => 2, i16 => 2, u32 => 4, i32 => 4, u64 => 8, i64 => 8);

impl Key for usize {
    const KIND: KeyKind = KeyKind::Fixed(8);

    #[inline]
    fn encode(&self) -> KeyBytes<'_> {
        KeyBytes::inline(*self as u64, 8)
    }
}

impl Key for char {
    const KIND: KeyKind = KeyKind::Fixed(4);

    #[inline]
    fn encode(&self) -> KeyBytes<'_> {
        KeyBytes::inline(u64::from(*self as u32), 4)
    }
}

impl Key for [u8] {
    const KIND: KeyKind = KeyKind::Bytes;

    #[inline]
    fn encode(&self) -> KeyBytes<'_> {
        KeyBytes::Borrowed(self)
    }
}

impl Key for Vec<u8> {
    const KIND: KeyKind = KeyKind::Bytes;

    #[inline]
    fn encode(&self) -> KeyBytes<'_> {
        KeyBytes::Borrowed(self)
    }
}

impl Key for str {
    const KIND: KeyKind = KeyKind::Bytes;

    #[inline]
    fn encode(&self) -> KeyBytes<'_> {
        KeyBytes::Borrowed(self.as_bytes())
    }
}

impl Key for String {
    const KIND: KeyKind = KeyKind::Bytes;

    #[inline]
    fn encode(&self) -> KeyBytes<'_> {
        KeyBytes::Borrowed(self.as_bytes())
    }
}

impl<'k, K: Key + ?Sized> Key for &'k K {
    const KIND: KeyKind = K::KIND;

    #[inline]
    fn encode(&self) -> KeyBytes<'_> {
        (**self).encode()
    }
}

/// Packs a fixed-width key into the inline slot tag, zero padded.
#[inline]
pub(crate) fn pack_fixed(bytes: &[u8]) -> u64 {
    debug_assert!(!bytes.is_empty() && bytes.len() <= MAX_FIXED_WIDTH as usize);
    LittleEndian::read_uint(bytes, bytes.len())
}
