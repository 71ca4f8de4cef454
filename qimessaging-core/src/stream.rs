//! Primitive binary streams over a [`Buffer`].
//!
//! [`DataWriter`] and [`DataReader`] are mirror images: whatever sequence of
//! values is written is read back identically, in the same order. All
//! integers are little-endian, lengths and counts are `u32`.

use crate::buffer::{Buffer, BufferReader};
use crate::codec::CodecError;

macro_rules! write_primitive {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Write a `", stringify!($ty), "` in little-endian order.")]
            pub fn $name(&mut self, value: $ty) -> Result<(), CodecError> {
                self.write_raw(&value.to_le_bytes())
            }
        )*
    };
}

macro_rules! read_primitive {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self) -> Result<$ty, CodecError> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                bytes.copy_from_slice(self.read_raw(std::mem::size_of::<$ty>())?);
                Ok(<$ty>::from_le_bytes(bytes))
            }
        )*
    };
}

/// Appends encoded values to a [`Buffer`].
#[derive(Debug)]
pub struct DataWriter<'a> {
    buffer: &'a mut Buffer,
}

impl<'a> DataWriter<'a> {
    /// Create a writer appending to `buffer`.
    pub fn new(buffer: &'a mut Buffer) -> Self {
        Self { buffer }
    }

    /// Write raw bytes with no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.buffer.write(bytes)?;
        Ok(())
    }

    /// Write a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) -> Result<(), CodecError> {
        self.write_raw(&[u8::from(value)])
    }

    write_primitive! {
        write_u8: u8,
        write_i8: i8,
        write_u16: u16,
        write_i16: i16,
        write_u32: u32,
        write_i32: i32,
        write_u64: u64,
        write_i64: i64,
        write_f32: f32,
        write_f64: f64,
    }

    /// Write a length or element count.
    pub fn write_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u32::try_from(len).map_err(|_| CodecError::LengthOverflow { len })?;
        self.write_u32(len)
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.write_len(bytes.len())?;
        self.write_raw(bytes)
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<(), CodecError> {
        self.write_bytes(value.as_bytes())
    }

    /// Attach `buffer` as a sub-buffer at the current position.
    pub fn write_buffer(&mut self, buffer: Buffer) -> Result<(), CodecError> {
        self.buffer.add_sub_buffer(buffer)?;
        Ok(())
    }
}

/// Reads values written by a [`DataWriter`].
#[derive(Debug, Clone)]
pub struct DataReader<'a> {
    reader: BufferReader<'a>,
}

impl<'a> DataReader<'a> {
    /// Create a reader at the start of `buffer`.
    pub fn new(buffer: &'a Buffer) -> Self {
        Self {
            reader: BufferReader::new(buffer),
        }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.reader.remaining()
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.reader.position()
    }

    /// Borrow exactly `len` bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.reader.remaining();
        self.reader.read_slice(len).ok_or(CodecError::Eof {
            needed: len,
            remaining,
        })
    }

    /// Read a one-byte boolean.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool { value: other }),
        }
    }

    read_primitive! {
        read_u8: u8,
        read_i8: i8,
        read_u16: u16,
        read_i16: i16,
        read_u32: u32,
        read_i32: i32,
        read_u64: u64,
        read_i64: i64,
        read_f32: f32,
        read_f64: f64,
    }

    /// Read a length or element count.
    pub fn read_len(&mut self) -> Result<usize, CodecError> {
        Ok(self.read_u32()? as usize)
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_len()?;
        self.read_raw(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<&'a str, CodecError> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a buffer value.
    ///
    /// A sub-buffer attached at the cursor is returned as is. Otherwise the
    /// flattened form (length followed by bytes) is read and copied.
    pub fn read_buffer(&mut self) -> Result<Buffer, CodecError> {
        if self.reader.has_sub_buffer() {
            return Ok(self.reader.sub_buffer()?.clone());
        }
        Ok(Buffer::from(self.read_bytes()?))
    }
}
