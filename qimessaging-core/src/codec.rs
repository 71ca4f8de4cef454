//! Binary serialization of message payloads.
//!
//! Any `serde` type can be written into a [`Buffer`] with [`to_buffer`] /
//! [`write_value`] and read back with [`from_buffer`]. The format is not
//! self-describing: the reader must know the type it expects.
//!
//! | type | encoding |
//! |------|----------|
//! | `bool`, `u8`, `i8` | 1 byte |
//! | other integers, floats | little-endian |
//! | `char` | `u32` |
//! | `str`, bytes | `u32` length + bytes |
//! | sequences, maps | `u32` count + elements |
//! | tuples, structs | fields in order |
//! | `Option` | `u8` flag + value |
//! | enums | `u32` variant index + payload |
//! | [`Buffer`] | sub-buffer (length placeholder + attachment) |
//!
//! # Example
//!
//! ```rust
//! use qimessaging_core::{from_buffer, to_buffer};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Ping { seq: u32, label: String }
//!
//! let ping = Ping { seq: 7, label: "hello".to_string() };
//! let buffer = to_buffer(&ping).expect("encode");
//! assert_eq!(buffer.size(), 4 + 4 + 5);
//!
//! let decoded: Ping = from_buffer(&buffer).expect("decode");
//! assert_eq!(decoded, ping);
//! ```

use std::cell::RefCell;
use std::fmt;

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};
use serde::ser::{self, Serialize};

use crate::buffer::{Buffer, BufferError};
use crate::stream::{DataReader, DataWriter};

/// Newtype name used to recognize [`Buffer`] values inside the serializer.
const BUFFER_TOKEN: &str = "$qimessaging::Buffer";

thread_local! {
    // Hands a Buffer across the serde boundary without copying its bytes.
    //
    // Only `SlotGuard` touches it. The slot holds a value solely while a
    // `serialize_newtype_struct(BUFFER_TOKEN, ..)` or
    // `deserialize_newtype_struct(BUFFER_TOKEN, ..)` call is on the stack,
    // and every guard puts back what it found, so nested and reentrant
    // encodings on the same thread each see their own buffer.
    static BUFFER_SLOT: RefCell<Option<Buffer>> = const { RefCell::new(None) };
}

/// Fills [`BUFFER_SLOT`] for one scope and restores the previous content on drop.
struct SlotGuard {
    previous: Option<Buffer>,
}

impl SlotGuard {
    fn fill(buffer: Buffer) -> Self {
        let previous = BUFFER_SLOT.with(|slot| slot.replace(Some(buffer)));
        Self { previous }
    }

    fn take() -> Option<Buffer> {
        BUFFER_SLOT.with(|slot| slot.borrow_mut().take())
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BUFFER_SLOT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Errors produced while encoding or decoding a payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// The payload ended before the value was complete.
    #[error("unexpected end of payload: needed {needed} bytes, {remaining} left")]
    Eof {
        /// Bytes the next read needed.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },

    /// Bytes left over after decoding a complete value.
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },

    /// A length does not fit the `u32` used on the wire.
    #[error("length {len} does not fit in 32 bits")]
    LengthOverflow {
        /// Offending length.
        len: usize,
    },

    /// A string was not valid UTF-8.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A boolean byte was neither 0 nor 1.
    #[error("invalid boolean byte {value}")]
    InvalidBool {
        /// Byte that was read.
        value: u8,
    },

    /// A `u32` did not encode a `char`.
    #[error("invalid char code {value}")]
    InvalidChar {
        /// Code point that was read.
        value: u32,
    },

    /// The type cannot be represented without a schema.
    #[error("unsupported type: {what}")]
    UnsupportedType {
        /// What could not be handled.
        what: &'static str,
    },

    /// Buffer manipulation failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Error raised by a `Serialize` or `Deserialize` implementation.
    #[error("{0}")]
    Message(String),
}

impl ser::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Message(msg.to_string())
    }
}

impl de::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Message(msg.to_string())
    }
}

/// Serialize `value` into a fresh buffer.
pub fn to_buffer<T: Serialize + ?Sized>(value: &T) -> Result<Buffer, CodecError> {
    let mut buffer = Buffer::new();
    write_value(&mut buffer, value)?;
    Ok(buffer)
}

/// Serialize `value` at the end of `buffer`.
pub fn write_value<T: Serialize + ?Sized>(buffer: &mut Buffer, value: &T) -> Result<(), CodecError> {
    let mut serializer = Serializer {
        writer: DataWriter::new(buffer),
    };
    value.serialize(&mut serializer)
}

/// Deserialize a complete `T` from `buffer`.
///
/// Fails with [`CodecError::TrailingBytes`] if the buffer holds more than one value.
pub fn from_buffer<T: DeserializeOwned>(buffer: &Buffer) -> Result<T, CodecError> {
    let mut deserializer = Deserializer::new(buffer);
    let value = T::deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(value)
}

// =============================================================================
// Buffer as a serde value
// =============================================================================

struct FlatBytes<'a>(&'a Buffer);

impl Serialize for FlatBytes<'_> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0.to_flat_vec())
    }
}

impl Serialize for Buffer {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let _slot = SlotGuard::fill(self.clone());
        serializer.serialize_newtype_struct(BUFFER_TOKEN, &FlatBytes(self))
    }
}

struct BufferVisitor;

impl<'de> Visitor<'de> for BufferVisitor {
    type Value = Buffer;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a binary buffer")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Buffer, E> {
        SlotGuard::take().ok_or_else(|| E::custom("no sub-buffer available"))
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<Buffer, E> {
        Ok(Buffer::from(bytes))
    }

    fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> Result<Buffer, E> {
        Ok(Buffer::from(bytes))
    }

    fn visit_newtype_struct<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Buffer, D::Error> {
        deserializer.deserialize_bytes(self)
    }
}

impl<'de> de::Deserialize<'de> for Buffer {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_newtype_struct(BUFFER_TOKEN, BufferVisitor)
    }
}

// =============================================================================
// Serializer
// =============================================================================

/// Serde serializer writing the binary format into a [`Buffer`].
pub struct Serializer<'a> {
    writer: DataWriter<'a>,
}

impl<'a> Serializer<'a> {
    /// Create a serializer appending to `buffer`.
    pub fn new(buffer: &'a mut Buffer) -> Self {
        Self {
            writer: DataWriter::new(buffer),
        }
    }
}

impl<'s, 'a> ser::Serializer for &'s mut Serializer<'a> {
    type Ok = ();
    type Error = CodecError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, v: bool) -> Result<(), CodecError> {
        self.writer.write_bool(v)
    }

    fn serialize_i8(self, v: i8) -> Result<(), CodecError> {
        self.writer.write_i8(v)
    }

    fn serialize_i16(self, v: i16) -> Result<(), CodecError> {
        self.writer.write_i16(v)
    }

    fn serialize_i32(self, v: i32) -> Result<(), CodecError> {
        self.writer.write_i32(v)
    }

    fn serialize_i64(self, v: i64) -> Result<(), CodecError> {
        self.writer.write_i64(v)
    }

    fn serialize_u8(self, v: u8) -> Result<(), CodecError> {
        self.writer.write_u8(v)
    }

    fn serialize_u16(self, v: u16) -> Result<(), CodecError> {
        self.writer.write_u16(v)
    }

    fn serialize_u32(self, v: u32) -> Result<(), CodecError> {
        self.writer.write_u32(v)
    }

    fn serialize_u64(self, v: u64) -> Result<(), CodecError> {
        self.writer.write_u64(v)
    }

    fn serialize_f32(self, v: f32) -> Result<(), CodecError> {
        self.writer.write_f32(v)
    }

    fn serialize_f64(self, v: f64) -> Result<(), CodecError> {
        self.writer.write_f64(v)
    }

    fn serialize_char(self, v: char) -> Result<(), CodecError> {
        self.writer.write_u32(u32::from(v))
    }

    fn serialize_str(self, v: &str) -> Result<(), CodecError> {
        self.writer.write_str(v)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), CodecError> {
        self.writer.write_bytes(v)
    }

    fn serialize_none(self) -> Result<(), CodecError> {
        self.writer.write_u8(0)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), CodecError> {
        self.writer.write_u8(1)?;
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), CodecError> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), CodecError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), CodecError> {
        self.writer.write_u32(variant_index)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        if name == BUFFER_TOKEN {
            if let Some(buffer) = SlotGuard::take() {
                return self.writer.write_buffer(buffer);
            }
        }
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        self.writer.write_u32(variant_index)?;
        value.serialize(self)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self, CodecError> {
        let len = len.ok_or(CodecError::UnsupportedType {
            what: "sequence of unknown length",
        })?;
        self.writer.write_len(len)?;
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, CodecError> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self, CodecError> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, CodecError> {
        self.writer.write_u32(variant_index)?;
        Ok(self)
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Self, CodecError> {
        let len = len.ok_or(CodecError::UnsupportedType {
            what: "map of unknown length",
        })?;
        self.writer.write_len(len)?;
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, CodecError> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, CodecError> {
        self.writer.write_u32(variant_index)?;
        Ok(self)
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

macro_rules! compound_element {
    ($trait:ident, $method:ident) => {
        impl<'s, 'a> ser::$trait for &'s mut Serializer<'a> {
            type Ok = ();
            type Error = CodecError;

            fn $method<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
                value.serialize(&mut **self)
            }

            fn end(self) -> Result<(), CodecError> {
                Ok(())
            }
        }
    };
}

compound_element!(SerializeSeq, serialize_element);
compound_element!(SerializeTuple, serialize_element);
compound_element!(SerializeTupleStruct, serialize_field);
compound_element!(SerializeTupleVariant, serialize_field);

impl<'s, 'a> ser::SerializeMap for &'s mut Serializer<'a> {
    type Ok = ();
    type Error = CodecError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CodecError> {
        key.serialize(&mut **self)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl<'s, 'a> ser::SerializeStruct for &'s mut Serializer<'a> {
    type Ok = ();
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl<'s, 'a> ser::SerializeStructVariant for &'s mut Serializer<'a> {
    type Ok = ();
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), CodecError> {
        Ok(())
    }
}

// =============================================================================
// Deserializer
// =============================================================================

/// Serde deserializer reading the binary format from a [`Buffer`].
pub struct Deserializer<'de> {
    reader: DataReader<'de>,
}

impl<'de> Deserializer<'de> {
    /// Create a deserializer at the start of `buffer`.
    pub fn new(buffer: &'de Buffer) -> Self {
        Self {
            reader: DataReader::new(buffer),
        }
    }

    /// Check that every byte has been consumed.
    pub fn end(&self) -> Result<(), CodecError> {
        match self.reader.remaining() {
            0 => Ok(()),
            count => Err(CodecError::TrailingBytes { count }),
        }
    }
}

impl<'de, 'a> de::Deserializer<'de> for &'a mut Deserializer<'de> {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::UnsupportedType {
            what: "self-describing value",
        })
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_bool(self.reader.read_bool()?)
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_i8(self.reader.read_i8()?)
    }

    fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_i16(self.reader.read_i16()?)
    }

    fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_i32(self.reader.read_i32()?)
    }

    fn deserialize_i64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_i64(self.reader.read_i64()?)
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_u8(self.reader.read_u8()?)
    }

    fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_u16(self.reader.read_u16()?)
    }

    fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_u32(self.reader.read_u32()?)
    }

    fn deserialize_u64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_u64(self.reader.read_u64()?)
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_f32(self.reader.read_f32()?)
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_f64(self.reader.read_f64()?)
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        let value = self.reader.read_u32()?;
        visitor.visit_char(char::from_u32(value).ok_or(CodecError::InvalidChar { value })?)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_borrowed_str(self.reader.read_str()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_borrowed_bytes(self.reader.read_bytes()?)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        match self.reader.read_u8()? {
            0 => visitor.visit_none(),
            1 => visitor.visit_some(self),
            value => Err(CodecError::InvalidBool { value }),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        if name == BUFFER_TOKEN {
            let buffer = self.reader.read_buffer()?;
            let _slot = SlotGuard::fill(buffer);
            return visitor.visit_unit();
        }
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        let len = self.reader.read_len()?;
        visitor.visit_seq(Counted { de: self, left: len })
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_seq(Counted { de: self, left: len })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        let len = self.reader.read_len()?;
        visitor.visit_map(Counted { de: self, left: len })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        self.deserialize_tuple(fields.len(), visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        visitor.visit_enum(self)
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::UnsupportedType {
            what: "field identifier",
        })
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::UnsupportedType {
            what: "ignored value",
        })
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

/// Access to a known number of sequence elements or map entries.
struct Counted<'a, 'de> {
    de: &'a mut Deserializer<'de>,
    left: usize,
}

impl<'de> SeqAccess<'de> for Counted<'_, 'de> {
    type Error = CodecError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, CodecError> {
        if self.left == 0 {
            return Ok(None);
        }
        self.left -= 1;
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.left.min(self.de.reader.remaining()))
    }
}

impl<'de> MapAccess<'de> for Counted<'_, 'de> {
    type Error = CodecError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>, CodecError> {
        if self.left == 0 {
            return Ok(None);
        }
        self.left -= 1;
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, CodecError> {
        seed.deserialize(&mut *self.de)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.left.min(self.de.reader.remaining()))
    }
}

impl<'de, 'a> EnumAccess<'de> for &'a mut Deserializer<'de> {
    type Error = CodecError;
    type Variant = Self;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self), CodecError> {
        let index = self.reader.read_u32()?;
        let variant: de::value::U32Deserializer<CodecError> = index.into_deserializer();
        let value = seed.deserialize(variant)?;
        Ok((value, self))
    }
}

impl<'de, 'a> VariantAccess<'de> for &'a mut Deserializer<'de> {
    type Error = CodecError;

    fn unit_variant(self) -> Result<(), CodecError> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value, CodecError> {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, CodecError> {
        de::Deserializer::deserialize_tuple(self, len, visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        de::Deserializer::deserialize_tuple(self, fields.len(), visitor)
    }
}
