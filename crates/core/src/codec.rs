//! Encode/decode contracts for values carried on the wire.
//!
//! Integers are written little-endian, least significant byte first. Floats
//! are bit-cast to the unsigned integer of the same width. Strings are
//! NUL-terminated and capped at [`STR_MAX_ENCODE_LEN`] bytes including the
//! terminator.

use crate::buffer::ByteBuffer;
use crate::lookup::NetLookup;
use glam::{IVec2, Vec2};
use thiserror::Error;

/// Maximum encoded string length, terminator included.
pub const STR_MAX_ENCODE_LEN: usize = 128;

/// Errors raised while decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer ran out before the value was complete.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd {
        /// Bytes required by the value.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A string ran to the end of the buffer without a terminator.
    #[error("string is missing its NUL terminator")]
    UnterminatedString,
    /// String bytes were not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// A tagged value carried an unknown discriminant.
    #[error("invalid {kind} value {value}")]
    InvalidEnum {
        /// Name of the enum being decoded.
        kind: &'static str,
        /// Raw discriminant read from the wire.
        value: u64,
    },
    /// An object reference named a network id with no live object.
    #[error("no replicated object with network id {0}")]
    UnknownObject(u16),
    /// A length prefix exceeded what the wire format can carry.
    #[error("length {len} exceeds the encodable maximum")]
    TooLarge {
        /// Offending length.
        len: usize,
    },
}

/// Shared state available to decoders.
///
/// Object references resolve through the session lookup; primitives ignore it.
#[derive(Clone, Copy, Default)]
pub struct DecodeContext<'a> {
    lookup: Option<&'a NetLookup>,
}

impl<'a> DecodeContext<'a> {
    /// Context without an object lookup; object references are not verified.
    pub fn detached() -> Self {
        Self { lookup: None }
    }

    /// Context resolving object references through `lookup`.
    pub fn with_lookup(lookup: &'a NetLookup) -> Self {
        Self {
            lookup: Some(lookup),
        }
    }

    /// The object lookup, if any.
    pub fn lookup(&self) -> Option<&'a NetLookup> {
        self.lookup
    }
}

/// A value that can be pushed onto a [`ByteBuffer`].
pub trait Encode {
    /// Push the encoded form of `self`.
    fn encode(&self, buffer: &mut ByteBuffer);
}

/// A value that can be popped from a flipped [`ByteBuffer`].
pub trait Decode: Sized {
    /// Pop and reconstruct a value.
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError>;
}

/// Encode a value into a fresh buffer in wire order.
pub fn encode_to_vec<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut buffer = ByteBuffer::new();
    value.encode(&mut buffer);
    buffer.into_inner()
}

/// Decode a value from bytes in wire order without an object lookup.
pub fn decode_from_slice<T: Decode>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut buffer = ByteBuffer::from_wire(bytes);
    T::decode(&mut buffer, &DecodeContext::detached())
}

fn require(buffer: &ByteBuffer, needed: usize) -> Result<(), CodecError> {
    if buffer.len() < needed {
        return Err(CodecError::UnexpectedEnd {
            needed,
            remaining: buffer.len(),
        });
    }
    Ok(())
}

macro_rules! impl_int_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode(&self, buffer: &mut ByteBuffer) {
                    for byte in self.to_le_bytes() {
                        buffer.push(byte);
                    }
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode(buffer: &mut ByteBuffer, _cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
                    let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                    require(buffer, bytes.len())?;
                    for slot in bytes.iter_mut() {
                        // Length was checked above.
                        *slot = buffer.pop().unwrap_or_default();
                    }
                    Ok(<$ty>::from_le_bytes(bytes))
                }
            }
        )*
    };
}

impl_int_codec!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Encode for f32 {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.to_bits().encode(buffer);
    }
}

impl Decode for f32 {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        u32::decode(buffer, cx).map(f32::from_bits)
    }
}

impl Encode for f64 {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.to_bits().encode(buffer);
    }
}

impl Decode for f64 {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        u64::decode(buffer, cx).map(f64::from_bits)
    }
}

impl Encode for bool {
    fn encode(&self, buffer: &mut ByteBuffer) {
        buffer.push(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        match u8::decode(buffer, cx)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(CodecError::InvalidEnum {
                kind: "bool",
                value: value as u64,
            }),
        }
    }
}

impl Encode for str {
    fn encode(&self, buffer: &mut ByteBuffer) {
        let content = self.split('\0').next().unwrap_or_default();
        let mut end = content.len().min(STR_MAX_ENCODE_LEN - 1);
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        buffer.push_slice(&content.as_bytes()[..end]);
        buffer.push(0);
    }
}

impl Encode for String {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.as_str().encode(buffer);
    }
}

impl Decode for String {
    fn decode(buffer: &mut ByteBuffer, _cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let mut bytes = Vec::new();
        loop {
            match buffer.pop() {
                Some(0) => break,
                Some(byte) => bytes.push(byte),
                None => return Err(CodecError::UnterminatedString),
            }
        }
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buffer: &mut ByteBuffer) {
        match self {
            Some(value) => {
                buffer.push(1);
                value.encode(buffer);
            }
            None => buffer.push(0),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        if bool::decode(buffer, cx)? {
            Ok(Some(T::decode(buffer, cx)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buffer: &mut ByteBuffer) {
        let count = self.len().min(u16::MAX as usize);
        (count as u16).encode(buffer);
        for item in &self[..count] {
            item.encode(buffer);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let count = u16::decode(buffer, cx)? as usize;
        // Each element needs at least one byte; cap the allocation accordingly.
        let mut items = Vec::with_capacity(count.min(buffer.len()));
        for _ in 0..count {
            items.push(T::decode(buffer, cx)?);
        }
        Ok(items)
    }
}

impl Encode for Vec2 {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.x.encode(buffer);
        self.y.encode(buffer);
    }
}

impl Decode for Vec2 {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        Ok(Vec2::new(f32::decode(buffer, cx)?, f32::decode(buffer, cx)?))
    }
}

impl Encode for IVec2 {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.x.encode(buffer);
        self.y.encode(buffer);
    }
}

impl Decode for IVec2 {
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        Ok(IVec2::new(i32::decode(buffer, cx)?, i32::decode(buffer, cx)?))
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buffer: &mut ByteBuffer) {
        (**self).encode(buffer);
    }
}

macro_rules! impl_tuple_codec {
    ($($name:ident),*) => {
        impl<$($name: Encode),*> Encode for ($($name,)*) {
            #[allow(non_snake_case, unused_variables)]
            fn encode(&self, buffer: &mut ByteBuffer) {
                let ($($name,)*) = self;
                $($name.encode(buffer);)*
            }
        }

        impl<$($name: Decode),*> Decode for ($($name,)*) {
            #[allow(unused_variables)]
            fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
                Ok(($($name::decode(buffer, cx)?,)*))
            }
        }
    };
}

impl_tuple_codec!();
impl_tuple_codec!(A);
impl_tuple_codec!(A, B);
impl_tuple_codec!(A, B, C);
impl_tuple_codec!(A, B, C, D);
impl_tuple_codec!(A, B, C, D, E);

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Encode + Decode>(value: &T) -> T {
        decode_from_slice(&encode_to_vec(value)).expect("roundtrip decode")
    }

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(encode_to_vec(&0x1234u16), vec![0x34, 0x12]);
        assert_eq!(encode_to_vec(&-2i32), vec![0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            encode_to_vec(&0x0102_0304_0506_0708u64),
            vec![8, 7, 6, 5, 4, 3, 2, 1]
        );
    }

    #[test]
    fn integer_extremes_roundtrip() {
        assert_eq!(roundtrip(&i8::MIN), i8::MIN);
        assert_eq!(roundtrip(&i16::MIN), i16::MIN);
        assert_eq!(roundtrip(&i64::MIN), i64::MIN);
        assert_eq!(roundtrip(&u64::MAX), u64::MAX);
    }

    #[test]
    fn nan_payload_is_preserved() {
        let nan = f32::from_bits(0x7FC0_1234);
        assert_eq!(roundtrip(&nan).to_bits(), 0x7FC0_1234);
    }

    #[test]
    fn long_strings_are_truncated_to_cap() {
        let long = "x".repeat(200);
        let decoded: String = roundtrip(&long);
        assert_eq!(decoded.len(), STR_MAX_ENCODE_LEN - 1);
    }

    #[test]
    fn string_without_terminator_fails() {
        let result: Result<String, _> = decode_from_slice(b"abc");
        assert_eq!(result, Err(CodecError::UnterminatedString));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = format!("{}é", "a".repeat(126));
        let decoded: String = roundtrip(&text);
        assert_eq!(decoded, "a".repeat(126));
    }

    #[test]
    fn short_buffer_fails_without_consuming() {
        let mut buffer = ByteBuffer::from_wire(&[1, 2, 3]);
        let result = u32::decode(&mut buffer, &DecodeContext::detached());
        assert!(matches!(result, Err(CodecError::UnexpectedEnd { needed: 4, remaining: 3 })));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn tuples_decode_in_declaration_order() {
        let value = (3i32, 4i32, String::from("boom"));
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn ivec2_roundtrips() {
        assert_eq!(roundtrip(&IVec2::new(3, -4)), IVec2::new(3, -4));
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let result: Result<bool, _> = decode_from_slice(&[7]);
        assert!(matches!(result, Err(CodecError::InvalidEnum { kind: "bool", .. })));
    }
}
