//! Wire codec for the rpc tester protocol.
//!
//! Numbers are written as their fixed-width in-memory representation
//! (native byte order, no conversion), so both peers must share the
//! same endianness. Strings are a `u32` byte length followed by the raw
//! bytes, without terminator and without any encoding validation on the
//! wire. Decode into `Vec<u8>` to keep arbitrary bytes as they are, a
//! `String` can only hold UTF-8.

use std::fmt;

/// Appends the wire representation of a value to an output buffer.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), FramingError>;

    fn to_bytes(&self) -> Result<Vec<u8>, FramingError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }
}

/// Reads a value from the front of an input buffer,
/// advancing the buffer past the consumed bytes.
pub trait Decode: Sized {
    fn decode(input: &mut &[u8]) -> Result<Self, FramingError>;

    /// Decode a value that must occupy the full input.
    fn from_bytes(mut input: &[u8]) -> Result<Self, FramingError> {
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(FramingError::TrailingBytes(input.len()));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    UnexpectedEof { needed: usize, available: usize },
    TrailingBytes(usize),
    Oversized { size: usize, limit: usize },
    UnknownVerb(i32),
    UnknownStatus(u8),
    InvalidUtf8,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::UnexpectedEof { needed, available } => write!(
                f,
                "FramingError: unexpected end of input (needed {needed} bytes, {available} available)"
            ),
            FramingError::TrailingBytes(n) => {
                write!(f, "FramingError: {n} trailing bytes after payload")
            }
            FramingError::Oversized { size, limit } => {
                write!(f, "FramingError: payload of {size} bytes exceeds limit of {limit} bytes")
            }
            FramingError::UnknownVerb(id) => write!(f, "FramingError: unknown verb id {id}"),
            FramingError::UnknownStatus(status) => {
                write!(f, "FramingError: unknown response status {status}")
            }
            FramingError::InvalidUtf8 => write!(f, "FramingError: string is not valid UTF-8"),
        }
    }
}

impl std::error::Error for FramingError {}

pub(crate) fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], FramingError> {
    if input.len() < n {
        return Err(FramingError::UnexpectedEof {
            needed: n,
            available: input.len(),
        });
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

macro_rules! impl_fixed_width {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode(&self, out: &mut Vec<u8>) -> Result<(), FramingError> {
                    out.extend_from_slice(&self.to_ne_bytes());
                    Ok(())
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode(input: &mut &[u8]) -> Result<Self, FramingError> {
                    let raw = take(input, size_of::<$ty>())?;
                    let mut buf = [0u8; size_of::<$ty>()];
                    buf.copy_from_slice(raw);
                    Ok(<$ty>::from_ne_bytes(buf))
                }
            }
        )+
    };
}

impl_fixed_width!(u8, i32, u32, i64, u64, f64);

/// `u32` length prefix of a byte sequence.
pub(crate) fn length_prefix(len: usize) -> Result<u32, FramingError> {
    u32::try_from(len).map_err(|_| FramingError::Oversized {
        size: len,
        limit: u32::MAX as usize,
    })
}

impl Encode for str {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), FramingError> {
        self.as_bytes().encode(out)
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), FramingError> {
        self.as_str().encode(out)
    }
}

impl Decode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, FramingError> {
        let raw = <Vec<u8>>::decode(input)?;
        String::from_utf8(raw).map_err(|_| FramingError::InvalidUtf8)
    }
}

impl Encode for [u8] {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), FramingError> {
        length_prefix(self.len())?.encode(out)?;
        out.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), FramingError> {
        self.as_slice().encode(out)
    }
}

impl Decode for Vec<u8> {
    fn decode(input: &mut &[u8]) -> Result<Self, FramingError> {
        let size = u32::decode(input)? as usize;
        Ok(take(input, size)?.to_vec())
    }
}

/// The empty payload, used by verbs without arguments or reply.
impl Encode for () {
    #[inline]
    fn encode(&self, _out: &mut Vec<u8>) -> Result<(), FramingError> {
        Ok(())
    }
}

impl Decode for () {
    #[inline]
    fn decode(_input: &mut &[u8]) -> Result<Self, FramingError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_string_is_zero_prefix_only() {
        let bytes = String::new().to_bytes().unwrap();
        assert_eq!(bytes, 0u32.to_ne_bytes().to_vec());
        assert_eq!(String::from_bytes(&bytes).unwrap(), "");
    }

    #[test]
    fn test_string_layout() {
        let bytes = "echo".to_bytes().unwrap();
        assert_eq!(bytes.len(), 4 + 4);
        assert_eq!(&bytes[..4], &4u32.to_ne_bytes());
        assert_eq!(&bytes[4..], b"echo");
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!(1i32.to_bytes().unwrap().len(), 4);
        assert_eq!(1u32.to_bytes().unwrap().len(), 4);
        assert_eq!(1i64.to_bytes().unwrap().len(), 8);
        assert_eq!(1u64.to_bytes().unwrap().len(), 8);
        assert_eq!(1f64.to_bytes().unwrap().len(), 8);
        assert!(().to_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_decode_past_end_is_framing_error() {
        for input in [&[][..], &[1, 2, 3][..], &[0; 7][..]] {
            assert_eq!(
                u64::from_bytes(input),
                Err(FramingError::UnexpectedEof {
                    needed: 8,
                    available: input.len(),
                }),
            );
        }

        // length prefix promises more than is there
        let mut bytes = 10u32.to_bytes().unwrap();
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            String::from_bytes(&bytes),
            Err(FramingError::UnexpectedEof {
                needed: 10,
                available: 5
            })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = 42u64.to_bytes().unwrap();
        bytes.push(0);
        assert_eq!(u64::from_bytes(&bytes), Err(FramingError::TrailingBytes(1)));
    }

    #[test]
    fn test_decode_sequence_advances_input() {
        let mut bytes = Vec::new();
        7i32.encode(&mut bytes).unwrap();
        "hi".encode(&mut bytes).unwrap();
        u64::MAX.encode(&mut bytes).unwrap();

        let mut input = bytes.as_slice();
        assert_eq!(i32::decode(&mut input).unwrap(), 7);
        assert_eq!(String::decode(&mut input).unwrap(), "hi");
        assert_eq!(u64::decode(&mut input).unwrap(), u64::MAX);
        assert!(input.is_empty());
    }

    #[test]
    fn test_raw_bytes_are_kept_as_is() {
        let raw = vec![b'o', 0xff, 0xfe, b'k', 0];
        let bytes = raw.to_bytes().unwrap();
        assert_eq!(<Vec<u8>>::from_bytes(&bytes).unwrap(), raw);
        assert_eq!(String::from_bytes(&bytes), Err(FramingError::InvalidUtf8));
    }

    #[test]
    fn test_length_prefix_bounds() {
        assert_eq!(length_prefix(0), Ok(0));
        assert_eq!(length_prefix(u32::MAX as usize), Ok(u32::MAX));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            length_prefix(u32::MAX as usize + 1),
            Err(FramingError::Oversized {
                size: u32::MAX as usize + 1,
                limit: u32::MAX as usize,
            })
        );
    }

    proptest! {
        #[test]
        fn prop_numbers_round_trip(a: i32, b: u32, c: i64, d: u64) {
            prop_assert_eq!(i32::from_bytes(&a.to_bytes().unwrap()).unwrap(), a);
            prop_assert_eq!(u32::from_bytes(&b.to_bytes().unwrap()).unwrap(), b);
            prop_assert_eq!(i64::from_bytes(&c.to_bytes().unwrap()).unwrap(), c);
            prop_assert_eq!(u64::from_bytes(&d.to_bytes().unwrap()).unwrap(), d);
        }

        #[test]
        fn prop_doubles_round_trip_bitwise(x: f64) {
            let decoded = f64::from_bytes(&x.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded.to_bits(), x.to_bits());
        }

        #[test]
        fn prop_strings_round_trip(s in ".*") {
            prop_assert_eq!(String::from_bytes(&s.to_bytes().unwrap()).unwrap(), s);
        }

        #[test]
        fn prop_bytes_round_trip(raw in prop::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(<Vec<u8>>::from_bytes(&raw.to_bytes().unwrap()).unwrap(), raw);
        }
    }
}
