use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::array::{ArrayError, Result};
use crate::value::ValueTag;

//-------------------------------------------------------------------------

pub const MAGIC: [u8; 4] = *b"HARR";
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_SIZE: u64 = 12;
pub const COUNT_OFFSET: u64 = 8;

pub const NODE_SIZE: u64 = 13;
pub const VALUE_PTR_OFFSET: u64 = 1;

// The root node sits directly after the header and always exists once
// the file is initialised.
pub const ROOT: u64 = HEADER_SIZE;

// Capacity and used length, ahead of the payload.
pub const BLOCK_HEADER_SIZE: u64 = 8;

pub fn child_slot(node: u64, bit: bool) -> u64 {
    node + VALUE_PTR_OFFSET + 4 * (1 + bit as u64)
}

//-------------------------------------------------------------------------

pub struct Header {
    pub count: u32,
}

impl Header {
    pub fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        w.write_u32::<LittleEndian>(self.count)?;
        Ok(())
    }

    pub fn unpack<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ArrayError::NotAHugeArray);
        }

        let version = r.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(ArrayError::IncompatibleVersion(version));
        }

        let count = r.read_u32::<LittleEndian>()?;
        Ok(Header { count })
    }
}

//-------------------------------------------------------------------------

/// A 13 byte trie node.  Pointers are absolute file offsets; zero means
/// absent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeRec {
    pub tag: ValueTag,
    pub value_ptr: u32,
    pub children: [u32; 2],
}

impl NodeRec {
    pub fn empty() -> Self {
        NodeRec {
            tag: ValueTag::Unset,
            value_ptr: 0,
            children: [0, 0],
        }
    }

    pub fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.tag as u8)?;
        w.write_u32::<LittleEndian>(self.value_ptr)?;
        w.write_u32::<LittleEndian>(self.children[0])?;
        w.write_u32::<LittleEndian>(self.children[1])?;
        Ok(())
    }

    pub fn unpack<R: Read>(r: &mut R) -> Result<Self> {
        let raw = r.read_u8()?;
        let tag = ValueTag::try_from(raw)
            .map_err(|_| ArrayError::Corrupt(format!("bad value tag {}", raw)))?;
        let value_ptr = r.read_u32::<LittleEndian>()?;
        let child0 = r.read_u32::<LittleEndian>()?;
        let child1 = r.read_u32::<LittleEndian>()?;

        Ok(NodeRec {
            tag,
            value_ptr,
            children: [child0, child1],
        })
    }

    pub fn child(&self, bit: bool) -> u32 {
        self.children[bit as usize]
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
