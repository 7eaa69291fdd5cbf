use crate::{Constant, RootId};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Error, ErrorKind, Read, Result};

/// Utility trait for writing the pieces of a serialized operation stream
///
/// Everything is big-endian. Sequences are prefixed with their length as a `u32`, and the
/// variants of a [`Constant`] are distinguished by a `u8` tag.
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;
}

/// Inverse of [`Serialize`]
pub trait Deserialize: Sized {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self>;
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(*self)
    }
}

impl Serialize for u32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(*self)
    }
}

impl Serialize for u64 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(*self)
    }
}

impl Serialize for i16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i16::<BigEndian>(*self)
    }
}

impl Serialize for i32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(*self)
    }
}

impl Serialize for i64 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i64::<BigEndian>(*self)
    }
}

impl Deserialize for u8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u8()
    }
}

impl Deserialize for u16 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u16::<BigEndian>()
    }
}

impl Deserialize for u32 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u32::<BigEndian>()
    }
}

impl Deserialize for u64 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u64::<BigEndian>()
    }
}

impl Deserialize for i16 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i16::<BigEndian>()
    }
}

impl Deserialize for i32 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i32::<BigEndian>()
    }
}

impl Deserialize for i64 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i64::<BigEndian>()
    }
}

/// Size in `u32` is the first thing serialized/deserialized
impl Serialize for Vec<u8> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u32).serialize(writer)?;
        writer.write_all(self)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let length = u32::deserialize(reader)? as u64;
        let mut bytes = vec![];
        reader.by_ref().take(length).read_to_end(&mut bytes)?;
        if (bytes.len() as u64) < length {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("expected {} bytes, found {}", length, bytes.len()),
            ));
        }
        Ok(bytes)
    }
}

impl Serialize for String {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u32).serialize(writer)?;
        writer.write_all(self.as_bytes())
    }
}

impl Deserialize for String {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        String::from_utf8(Vec::<u8>::deserialize(reader)?)
            .map_err(|err| Error::new(ErrorKind::InvalidData, err))
    }
}

impl Serialize for RootId {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.context.serialize(writer)?;
        self.index.serialize(writer)
    }
}

impl Deserialize for RootId {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let context = u16::deserialize(reader)?;
        let index = u32::deserialize(reader)?;
        Ok(RootId { context, index })
    }
}

impl Constant {
    const TAG_BOOLEAN: u8 = 0;
    const TAG_INTEGER: u8 = 1;
    const TAG_FLOAT: u8 = 2;
    const TAG_STRING: u8 = 3;
    const TAG_BYTES: u8 = 4;
    const TAG_ARRAY: u8 = 5;
    const TAG_ROOT: u8 = 6;
}

/// Nodes other than roots cannot be written and fail with `InvalidInput`
impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        match self {
            Constant::Boolean(value) => {
                Constant::TAG_BOOLEAN.serialize(writer)?;
                (*value as u8).serialize(writer)
            }
            Constant::Integer(value) => {
                Constant::TAG_INTEGER.serialize(writer)?;
                value.serialize(writer)
            }
            Constant::Float(bits) => {
                Constant::TAG_FLOAT.serialize(writer)?;
                bits.serialize(writer)
            }
            Constant::String(value) => {
                Constant::TAG_STRING.serialize(writer)?;
                value.serialize(writer)
            }
            Constant::Bytes(bytes) => {
                Constant::TAG_BYTES.serialize(writer)?;
                bytes.serialize(writer)
            }
            Constant::Array(elements) => {
                Constant::TAG_ARRAY.serialize(writer)?;
                (elements.len() as u32).serialize(writer)?;
                for element in elements {
                    element.serialize(writer)?;
                }
                Ok(())
            }
            Constant::Root(root) => {
                Constant::TAG_ROOT.serialize(writer)?;
                root.serialize(writer)
            }
            Constant::Node(name) => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("node {} cannot be serialized", name),
            )),
        }
    }
}

impl Deserialize for Constant {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let constant = match u8::deserialize(reader)? {
            Constant::TAG_BOOLEAN => Constant::Boolean(u8::deserialize(reader)? != 0),
            Constant::TAG_INTEGER => Constant::Integer(i64::deserialize(reader)?),
            Constant::TAG_FLOAT => Constant::Float(u64::deserialize(reader)?),
            Constant::TAG_STRING => Constant::String(String::deserialize(reader)?),
            Constant::TAG_BYTES => Constant::Bytes(Vec::<u8>::deserialize(reader)?),
            Constant::TAG_ARRAY => {
                let length = u32::deserialize(reader)?;
                let mut elements = vec![];
                for _ in 0..length {
                    elements.push(Constant::deserialize(reader)?);
                }
                Constant::Array(elements)
            }
            Constant::TAG_ROOT => Constant::Root(RootId::deserialize(reader)?),
            tag => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown constant tag {}", tag),
                ))
            }
        };
        Ok(constant)
    }
}
