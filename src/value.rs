use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::TryFromPrimitive;
use std::io::{self, Read, Write};

//-------------------------------------------------------------------------

/// On-disk value-type discriminator.  Every tag except Serialized pins
/// the value on its own.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueTag {
    Unset = 0,
    Null = 1,
    False = 2,
    True = 3,
    Zero = 4,
    EmptyString = 5,
    EmptyArray = 6,
    Serialized = 7,
}

//-------------------------------------------------------------------------

pub trait StoredValue: Sized {
    // Discrimination is strict: a non-zero integer is never Zero, a
    // non-empty string is never EmptyString.
    fn singleton(&self) -> Option<ValueTag>;

    fn from_singleton(tag: ValueTag) -> Option<Self>;

    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()>;
    fn unpack<R: Read>(r: &mut R) -> io::Result<Self>;
}

//-------------------------------------------------------------------------

// Nested strings and arrays carry a u32 length so that array elements
// are self delimiting.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

const KIND_NULL: u8 = 0;
const KIND_BOOL: u8 = 1;
const KIND_INT: u8 = 2;
const KIND_FLOAT: u8 = 3;
const KIND_BYTES: u8 = 4;
const KIND_ARRAY: u8 = 5;

impl StoredValue for Value {
    fn singleton(&self) -> Option<ValueTag> {
        match self {
            Value::Null => Some(ValueTag::Null),
            Value::Bool(false) => Some(ValueTag::False),
            Value::Bool(true) => Some(ValueTag::True),
            Value::Int(0) => Some(ValueTag::Zero),
            Value::Bytes(b) if b.is_empty() => Some(ValueTag::EmptyString),
            Value::Array(vs) if vs.is_empty() => Some(ValueTag::EmptyArray),
            _ => None,
        }
    }

    fn from_singleton(tag: ValueTag) -> Option<Self> {
        match tag {
            ValueTag::Null => Some(Value::Null),
            ValueTag::False => Some(Value::Bool(false)),
            ValueTag::True => Some(Value::Bool(true)),
            ValueTag::Zero => Some(Value::Int(0)),
            ValueTag::EmptyString => Some(Value::Bytes(Vec::new())),
            ValueTag::EmptyArray => Some(Value::Array(Vec::new())),
            ValueTag::Unset | ValueTag::Serialized => None,
        }
    }

    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Value::Null => w.write_u8(KIND_NULL),
            Value::Bool(b) => {
                w.write_u8(KIND_BOOL)?;
                w.write_u8(*b as u8)
            }
            Value::Int(n) => {
                w.write_u8(KIND_INT)?;
                w.write_i64::<LittleEndian>(*n)
            }
            Value::Float(x) => {
                w.write_u8(KIND_FLOAT)?;
                w.write_f64::<LittleEndian>(*x)
            }
            Value::Bytes(b) => {
                w.write_u8(KIND_BYTES)?;
                w.write_u32::<LittleEndian>(b.len() as u32)?;
                w.write_all(b)
            }
            Value::Array(vs) => {
                w.write_u8(KIND_ARRAY)?;
                w.write_u32::<LittleEndian>(vs.len() as u32)?;
                for v in vs {
                    v.pack(w)?;
                }
                Ok(())
            }
        }
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let kind = r.read_u8()?;
        match kind {
            KIND_NULL => Ok(Value::Null),
            KIND_BOOL => Ok(Value::Bool(r.read_u8()? != 0)),
            KIND_INT => Ok(Value::Int(r.read_i64::<LittleEndian>()?)),
            KIND_FLOAT => Ok(Value::Float(r.read_f64::<LittleEndian>()?)),
            KIND_BYTES => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut b = vec![0u8; len];
                r.read_exact(&mut b)?;
                Ok(Value::Bytes(b))
            }
            KIND_ARRAY => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut vs = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    vs.push(Value::unpack(r)?);
                }
                Ok(Value::Array(vs))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad value kind {}", kind),
            )),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(vs: Vec<Value>) -> Self {
        Value::Array(vs)
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
