//! Byte codec for keys, values and persisted records.
//!
//! Fixed-width integers are little-endian. Strings and byte vectors carry a
//! `u32` length prefix. Every persisted record ends with a CRC32 of the bytes
//! before it (see [`seal`] and [`unseal`]).

// Lengths are bounded by the node byte budget, far below u32::MAX.
#![allow(clippy::cast_possible_truncation)]

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 4;

/// A type that can be written into and read back from a record.
pub trait Codec: Sized {
    /// Append the encoded form to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode from the front of `input`, advancing it past the consumed bytes.
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError>;

    /// Exact number of bytes `encode` appends.
    fn encoded_len(&self) -> usize;
}

/// Take the next `N` bytes from `input`.
pub fn take<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], CodecError> {
    if input.len() < N {
        return Err(CodecError::Truncated {
            needed: N,
            remaining: input.len(),
        });
    }
    let (head, rest) = input.split_at(N);
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(head);
    *input = rest;
    Ok(bytes)
}

fn take_slice<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < len {
        return Err(CodecError::Truncated {
            needed: len,
            remaining: input.len(),
        });
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

macro_rules! fixed_width_codec {
    ($($ty:ty),*) => {
        $(
            impl Codec for $ty {
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
                    Ok(Self::from_le_bytes(take(input)?))
                }

                fn encoded_len(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

fixed_width_codec!(u8, u16, u32, u64, i32, i64);

impl Codec for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode(out);
        out.extend_from_slice(self);
    }

    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let len = u32::decode(input)? as usize;
        Ok(take_slice(input, len)?.to_vec())
    }

    fn encoded_len(&self) -> usize {
        4 + self.len()
    }
}

impl Codec for String {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode(out);
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let len = u32::decode(input)? as usize;
        let bytes = take_slice(input, len)?;
        Self::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn encoded_len(&self) -> usize {
        4 + self.len()
    }
}

/// Append a CRC32 of everything currently in `buf`.
pub fn seal(buf: &mut Vec<u8>) {
    let checksum = crc32fast::hash(buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
}

/// Verify the trailing CRC32 and return the body before it.
pub fn unseal(bytes: &[u8]) -> Result<&[u8], CodecError> {
    if bytes.len() < CHECKSUM_SIZE {
        return Err(CodecError::Truncated {
            needed: CHECKSUM_SIZE,
            remaining: bytes.len(),
        });
    }
    let (body, tail) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
    let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }
    Ok(body)
}

/// Errors that can occur while decoding a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended early.
    Truncated { needed: usize, remaining: usize },
    /// Stored checksum does not match the content.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// String bytes are not valid UTF-8.
    InvalidUtf8,
    /// Unknown discriminant byte.
    InvalidTag { field: &'static str, tag: u8 },
    /// Bytes left over after a complete record.
    TrailingBytes(usize),
    /// Structurally valid bytes describing an impossible record.
    Malformed(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, remaining } => {
                write!(f, "truncated input: needed {needed} bytes, {remaining} remaining")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")
            }
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in string"),
            Self::InvalidTag { field, tag } => write!(f, "invalid {field} tag: {tag}"),
            Self::TrailingBytes(count) => write!(f, "{count} trailing bytes after record"),
            Self::Malformed(msg) => write!(f, "malformed record: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encoding_is_little_endian() {
        let mut out = Vec::new();
        0x0102_0304u32.encode(&mut out);
        assert_eq!(out, vec![4, 3, 2, 1]);
        assert_eq!((-1i64).encoded_len(), 8);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut out = Vec::new();
        "key_1".to_string().encode(&mut out);
        assert_eq!(out.len(), "key_1".to_string().encoded_len());

        let mut input = out.as_slice();
        assert_eq!(String::decode(&mut input).expect("decode"), "key_1");
        assert!(input.is_empty());
    }

    #[test]
    fn test_truncated_string() {
        let mut out = Vec::new();
        "abcdef".to_string().encode(&mut out);
        out.truncate(6);
        let mut input = out.as_slice();
        assert_eq!(
            String::decode(&mut input),
            Err(CodecError::Truncated {
                needed: 6,
                remaining: 2,
            })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut out = Vec::new();
        vec![0xffu8, 0xfe].encode(&mut out);
        let mut input = out.as_slice();
        assert_eq!(String::decode(&mut input), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_seal_detects_corruption() {
        let mut buf = b"node body".to_vec();
        seal(&mut buf);
        assert_eq!(unseal(&buf).expect("valid"), b"node body");

        buf[2] ^= 0x40;
        assert!(matches!(
            unseal(&buf),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }
}
