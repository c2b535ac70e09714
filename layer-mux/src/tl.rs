//! Minimal TL binary codec used for the few calls the core issues itself.
//!
//! Encoding follows the [MTProto Binary Serialization] rules. Application
//! payloads never pass through here; they stay opaque byte buffers.
//!
//! [MTProto Binary Serialization]: https://core.telegram.org/mtproto/serialize

use std::fmt;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while decoding.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Ran out of bytes before the value was fully read.
    UnexpectedEof,
    /// Read a constructor id that doesn't belong to the expected type.
    UnexpectedConstructor { id: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::UnexpectedConstructor { id } => {
                write!(f, "unexpected constructor id: {id:#010x}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for decoding.
pub type Result<T> = std::result::Result<T, Error>;

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// Read position over a borrowed byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let end = self.pos + out.len();
        if end > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Serialize `self` into TL binary format.
pub trait Serializable {
    fn serialize(&self, buf: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.serialize(&mut v);
        v
    }
}

/// Deserialize a value from TL binary format.
pub trait Deserializable: Sized {
    fn deserialize(buf: &mut Cursor<'_>) -> Result<Self>;

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::deserialize(&mut Cursor::from_slice(bytes))
    }
}

/// A function that can be sent as an RPC call; `Return` is what comes back.
pub trait RemoteCall: Serializable {
    type Return: Deserializable;
}

/// Every boxed type starts with a 32-bit constructor id.
pub trait Identifiable {
    const CONSTRUCTOR_ID: u32;
}

/// Peek at the leading constructor id of a reply without consuming it.
pub fn peek_constructor(bytes: &[u8]) -> Option<u32> {
    let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(head))
}

// ─── Primitives ──────────────────────────────────────────────────────────────

const ID_BOOL_TRUE:  u32 = 0x997275b5;
const ID_BOOL_FALSE: u32 = 0xbc799737;
const ID_VECTOR:     u32 = 0x1cb5c415;

impl Serializable for bool {
    fn serialize(&self, buf: &mut Vec<u8>) {
        (if *self { ID_BOOL_TRUE } else { ID_BOOL_FALSE }).serialize(buf);
    }
}

impl Deserializable for bool {
    fn deserialize(buf: &mut Cursor<'_>) -> Result<Self> {
        match u32::deserialize(buf)? {
            ID_BOOL_TRUE => Ok(true),
            ID_BOOL_FALSE => Ok(false),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

macro_rules! le_number {
    ($($ty:ty),*) => {$(
        impl Serializable for $ty {
            fn serialize(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl Deserializable for $ty {
            fn deserialize(buf: &mut Cursor<'_>) -> Result<Self> {
                let mut b = [0u8; std::mem::size_of::<$ty>()];
                buf.read_exact(&mut b)?;
                Ok(<$ty>::from_le_bytes(b))
            }
        }
    )*};
}

le_number!(i32, u32, i64);

/// TL `bytes`: 1- or 4-byte length header, data, zero padding to 4 bytes.
impl Serializable for [u8] {
    fn serialize(&self, buf: &mut Vec<u8>) {
        let len = self.len();
        let header = if len <= 253 {
            buf.push(len as u8);
            1
        } else {
            buf.extend_from_slice(&[0xfe, len as u8, (len >> 8) as u8, (len >> 16) as u8]);
            4
        };
        buf.extend_from_slice(self);
        let padding = (4 - (header + len) % 4) % 4;
        buf.extend(std::iter::repeat_n(0u8, padding));
    }
}

impl Serializable for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) { self.as_slice().serialize(buf) }
}

impl Deserializable for Vec<u8> {
    fn deserialize(buf: &mut Cursor<'_>) -> Result<Self> {
        let first = buf.take(1)?[0];
        let (len, header) = if first <= 253 {
            (first as usize, 1)
        } else {
            let b = buf.take(3)?;
            (b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16, 4)
        };
        let data = buf.take(len)?.to_vec();
        buf.take((4 - (header + len) % 4) % 4)?;
        Ok(data)
    }
}

impl Serializable for String {
    fn serialize(&self, buf: &mut Vec<u8>) { self.as_bytes().serialize(buf) }
}

impl Deserializable for String {
    fn deserialize(buf: &mut Cursor<'_>) -> Result<Self> {
        Vec::<u8>::deserialize(buf).map(|b| String::from_utf8_lossy(&b).into_owned())
    }
}

/// Boxed `Vector<T>`, prefixed with `0x1cb5c415`.
pub fn serialize_vec<T: Serializable>(items: &[T], buf: &mut Vec<u8>) {
    ID_VECTOR.serialize(buf);
    (items.len() as i32).serialize(buf);
    for item in items { item.serialize(buf); }
}

impl<T: Deserializable> Deserializable for Vec<T> {
    fn deserialize(buf: &mut Cursor<'_>) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != ID_VECTOR {
            return Err(Error::UnexpectedConstructor { id });
        }
        let len = i32::deserialize(buf)?.max(0) as usize;
        (0..len).map(|_| T::deserialize(buf)).collect()
    }
}

/// Any reply, kept as raw bytes. Used for calls whose result the core ignores.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl Deserializable for Blob {
    fn deserialize(buf: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self(buf.rest().to_vec()))
    }
}
