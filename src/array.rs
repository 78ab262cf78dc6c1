use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bits::{Key, KeyBits};
use crate::layout::*;
use crate::value::{StoredValue, Value, ValueTag};

//-------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ArrayError {
    #[error("cannot open backing file: {0}")]
    CannotOpenFile(io::Error),

    #[error("not a huge array file")]
    NotAHugeArray,

    #[error("incompatible format version {0}")]
    IncompatibleVersion(u32),

    #[error("file too short to hold a header and root node")]
    Truncated,

    #[error("unsupported key: {0}")]
    InvalidKey(String),

    #[error("write failed: {0}")]
    WriteFailure(io::Error),

    #[error("update callback failed: {0}")]
    BadUpdateResponse(anyhow::Error),

    #[error("file exceeds the 4 GiB pointer range")]
    FileFull,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArrayError>;

//-------------------------------------------------------------------------

pub enum UpdateAction<V> {
    Keep,
    Set(V),
    Unset,
}

//-------------------------------------------------------------------------

/// A disk-backed associative array, stored as a binary trie where each
/// key bit selects one of two child pointers.  Single writer only.
pub struct HugeArray<V: StoredValue = Value> {
    file: File,
    path: Option<PathBuf>,

    // End-of-allocations watermark, equal to the file length at quiescent
    // points.  New nodes and value blocks are appended here.
    file_end: u64,
    count: u32,

    // The implicit traversal cursor.
    pub(crate) cursor_node: u64,
    pub(crate) cursor_stack: Vec<u64>,

    phantom: PhantomData<V>,
}

impl<V: StoredValue> HugeArray<V> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .map_err(ArrayError::CannotOpenFile)?;

        Self::from_file(file, Some(path.as_ref().to_path_buf()))
    }

    pub fn temp() -> Result<Self> {
        let file = tempfile::tempfile().map_err(ArrayError::CannotOpenFile)?;
        Self::from_file(file, None)
    }

    fn from_file(file: File, path: Option<PathBuf>) -> Result<Self> {
        let len = file.metadata().map_err(ArrayError::CannotOpenFile)?.len();

        let mut a = Self {
            file,
            path,
            file_end: len,
            count: 0,
            cursor_node: ROOT,
            cursor_stack: Vec::new(),
            phantom: PhantomData,
        };

        if len == 0 {
            a.clear()?;
        } else {
            if len < HEADER_SIZE {
                return Err(ArrayError::Truncated);
            }

            let mut buf = [0u8; HEADER_SIZE as usize];
            a.read_at(0, &mut buf)?;
            let hdr = Header::unpack(&mut &buf[..])?;

            if len < HEADER_SIZE + NODE_SIZE {
                return Err(ArrayError::Truncated);
            }

            a.count = hdr.count;
        }

        debug!(path = ?a.path, count = a.count, "opened array");
        Ok(a)
    }

    pub fn close(self) -> Result<()> {
        self.file.sync_all().map_err(ArrayError::WriteFailure)?;

        // A file we were given a path for is left world accessible.
        #[cfg(unix)]
        if let Some(path) = &self.path {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777));
        }

        Ok(())
    }

    //-------------------------------

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn file_size(&self) -> u64 {
        self.file_end
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // Individual mutations only promise to have reached the OS.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().map_err(ArrayError::WriteFailure)
    }

    //-------------------------------

    pub fn exists<'a, K: Into<Key<'a>>>(&mut self, key: K) -> Result<bool> {
        let bytes = key.into().canonical();
        match self.locate(&bytes)? {
            None => Ok(false),
            Some(node) => Ok(self.read_node(node)?.tag != ValueTag::Unset),
        }
    }

    // Unlike exists, a stored null reads as absent here.
    pub fn is_set<'a, K: Into<Key<'a>>>(&mut self, key: K) -> Result<bool> {
        let bytes = key.into().canonical();
        match self.locate(&bytes)? {
            None => Ok(false),
            Some(node) => {
                let tag = self.read_node(node)?.tag;
                Ok(tag != ValueTag::Unset && tag != ValueTag::Null)
            }
        }
    }

    pub fn get<'a, K: Into<Key<'a>>>(&mut self, key: K) -> Result<Option<V>> {
        let key = key.into();
        let v = self.peek(&key)?;
        if v.is_none() {
            warn!(key = ?key, "get on missing key");
        }
        Ok(v)
    }

    pub fn try_get<'a, K: Into<Key<'a>>>(&mut self, key: K, default: V) -> Result<V> {
        Ok(self.peek(&key.into())?.unwrap_or(default))
    }

    fn peek(&mut self, key: &Key<'_>) -> Result<Option<V>> {
        let bytes = key.canonical();
        match self.locate(&bytes)? {
            None => Ok(None),
            Some(node) => {
                let rec = self.read_node(node)?;
                self.value_of(&rec)
            }
        }
    }

    pub fn set<'a, K: Into<Key<'a>>>(&mut self, key: K, value: V) -> Result<()> {
        let bytes = key.into().canonical();
        let r = self.set_(&bytes, &value);
        if r.is_err() {
            self.recover();
        }
        r
    }

    fn set_(&mut self, key: &[u8], value: &V) -> Result<()> {
        let node = self.locate_or_create(key)?;
        self.write_value(node, Some(value))
    }

    /// The node keeps its value block pointer across unset, so a later
    /// set can reuse the block's capacity in place.
    pub fn unset<'a, K: Into<Key<'a>>>(&mut self, key: K) -> Result<()> {
        let bytes = key.into().canonical();
        match self.locate(&bytes)? {
            None => Ok(()),
            Some(node) => self.write_value(node, None),
        }
    }

    pub fn update<'a, K, F>(&mut self, key: K, create: bool, f: F) -> Result<()>
    where
        K: Into<Key<'a>>,
        F: FnOnce(Option<V>) -> anyhow::Result<UpdateAction<V>>,
    {
        let bytes = key.into().canonical();
        let r = self.update_(&bytes, create, f);
        if r.is_err() {
            self.recover();
        }
        r
    }

    fn update_<F>(&mut self, key: &[u8], create: bool, f: F) -> Result<()>
    where
        F: FnOnce(Option<V>) -> anyhow::Result<UpdateAction<V>>,
    {
        let node = if create {
            self.locate_or_create(key)?
        } else {
            match self.locate(key)? {
                Some(node) => node,
                None => return Ok(()),
            }
        };

        let rec = self.read_node(node)?;
        let current = self.value_of(&rec)?;

        match f(current).map_err(ArrayError::BadUpdateResponse)? {
            UpdateAction::Keep => Ok(()),
            UpdateAction::Set(v) => self.write_value(node, Some(&v)),
            UpdateAction::Unset => self.write_value(node, None),
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0).map_err(ArrayError::WriteFailure)?;

        let mut w = Vec::with_capacity((HEADER_SIZE + NODE_SIZE) as usize);
        Header { count: 0 }.pack(&mut w)?;
        NodeRec::empty().pack(&mut w)?;
        self.write_at(0, &w)?;

        self.file_end = HEADER_SIZE + NODE_SIZE;
        self.count = 0;
        self.seek_reset();

        debug!("cleared array");
        Ok(())
    }

    //-------------------------------

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(ArrayError::WriteFailure)?;
        self.file
            .write_all(buf)
            .map_err(ArrayError::WriteFailure)?;
        Ok(())
    }

    fn read_u32_at(&mut self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok((&buf[..]).read_u32::<LittleEndian>()?)
    }

    fn write_u32_at(&mut self, offset: u64, v: u32) -> Result<()> {
        let mut w = Vec::with_capacity(4);
        w.write_u32::<LittleEndian>(v)?;
        self.write_at(offset, &w)
    }

    pub(crate) fn read_node(&mut self, offset: u64) -> Result<NodeRec> {
        let mut buf = [0u8; NODE_SIZE as usize];
        self.read_at(offset, &mut buf)?;
        NodeRec::unpack(&mut &buf[..])
    }

    // Anything past the watermark is a torn append nothing points at yet.
    fn recover(&mut self) {
        let _ = self.file.set_len(self.file_end);
    }

    //-------------------------------

    fn locate(&mut self, key: &[u8]) -> Result<Option<u64>> {
        let mut node = ROOT;

        for bit in KeyBits::new(key) {
            let child = self.read_u32_at(child_slot(node, bit))?;
            if child == 0 {
                return Ok(None);
            }
            node = child as u64;
        }

        Ok(Some(node))
    }

    fn locate_or_create(&mut self, key: &[u8]) -> Result<u64> {
        let mut node = ROOT;
        let mut bits = KeyBits::new(key);

        while let Some(bit) = bits.next() {
            let slot = child_slot(node, bit);
            let child = self.read_u32_at(slot)?;
            if child == 0 {
                return self.grow_branch(slot, bits);
            }
            node = child as u64;
        }

        Ok(node)
    }

    // Materialises the whole remaining key suffix as a chain of fresh
    // nodes.  The chain is written before it is linked into `slot`, so a
    // failed write never leaves a pointer to a truncated node.
    fn grow_branch(&mut self, slot: u64, rest: KeyBits) -> Result<u64> {
        let nr_nodes = rest.len() as u64 + 1;
        let first = self.file_end;

        if first + nr_nodes * NODE_SIZE > u32::MAX as u64 {
            return Err(ArrayError::FileFull);
        }

        let mut buf = vec![0u8; (nr_nodes * NODE_SIZE) as usize];
        for (i, bit) in rest.enumerate() {
            let child = (first + (i as u64 + 1) * NODE_SIZE) as u32;
            let at = child_slot(i as u64 * NODE_SIZE, bit) as usize;
            let mut w = &mut buf[at..at + 4];
            w.write_u32::<LittleEndian>(child)?;
        }

        self.write_at(first, &buf)?;
        self.write_u32_at(slot, first as u32)?;
        self.file_end += nr_nodes * NODE_SIZE;

        Ok(first + (nr_nodes - 1) * NODE_SIZE)
    }

    //-------------------------------

    pub(crate) fn value_of(&mut self, rec: &NodeRec) -> Result<Option<V>> {
        match rec.tag {
            ValueTag::Unset => Ok(None),
            ValueTag::Serialized => {
                if rec.value_ptr == 0 {
                    return Err(ArrayError::Corrupt(
                        "serialized value with null pointer".to_string(),
                    ));
                }

                let ptr = rec.value_ptr as u64;
                let used = self.read_u32_at(ptr + 4)?;
                let mut buf = vec![0u8; used as usize];
                self.read_at(ptr + BLOCK_HEADER_SIZE, &mut buf)?;

                let v = V::unpack(&mut &buf[..])
                    .map_err(|e| ArrayError::Corrupt(format!("undecodable value: {}", e)))?;
                Ok(Some(v))
            }
            tag => {
                let v = V::from_singleton(tag).ok_or_else(|| {
                    ArrayError::Corrupt(format!("value domain cannot represent {:?}", tag))
                })?;
                Ok(Some(v))
            }
        }
    }

    fn write_value(&mut self, node: u64, value: Option<&V>) -> Result<()> {
        let rec = self.read_node(node)?;
        let old_tag = rec.tag;
        let old_ptr = rec.value_ptr;

        let new_tag = match value {
            None => ValueTag::Unset,
            Some(v) => v.singleton().unwrap_or(ValueTag::Serialized),
        };

        // An equal singleton is already encoded by the tag alone.
        if new_tag == old_tag && new_tag != ValueTag::Unset && new_tag != ValueTag::Serialized {
            return Ok(());
        }

        let mut new_ptr = old_ptr;
        if let Some(v) = value {
            if new_tag == ValueTag::Serialized {
                new_ptr = self.store_payload(v, old_ptr)?;
            }
        }

        if new_tag != old_tag && new_ptr != old_ptr {
            let mut w = Vec::with_capacity(5);
            w.write_u8(new_tag as u8)?;
            w.write_u32::<LittleEndian>(new_ptr)?;
            self.write_at(node, &w)?;
        } else if new_tag != old_tag {
            self.write_at(node, &[new_tag as u8])?;
        } else if new_ptr != old_ptr {
            self.write_u32_at(node + VALUE_PTR_OFFSET, new_ptr)?;
        }

        if old_tag == ValueTag::Unset && new_tag != ValueTag::Unset {
            self.count += 1;
            self.write_count()?;
        } else if old_tag != ValueTag::Unset && new_tag == ValueTag::Unset {
            self.count -= 1;
            self.write_count()?;
        }

        Ok(())
    }

    // Reuses the old block in place when its capacity suffices, otherwise
    // appends a fresh block and abandons the old one.
    fn store_payload(&mut self, v: &V, old_ptr: u32) -> Result<u32> {
        let mut payload = Vec::new();
        v.pack(&mut payload)?;
        let len = payload.len() as u64;

        if len > u32::MAX as u64 {
            return Err(ArrayError::FileFull);
        }

        let cap = if old_ptr != 0 {
            self.read_u32_at(old_ptr as u64)?
        } else {
            0
        };

        if old_ptr != 0 && cap as u64 >= len {
            let mut w = Vec::with_capacity(payload.len() + 4);
            w.write_u32::<LittleEndian>(len as u32)?;
            w.extend_from_slice(&payload);
            self.write_at(old_ptr as u64 + 4, &w)?;
            return Ok(old_ptr);
        }

        let at = self.file_end;
        if at + BLOCK_HEADER_SIZE + len > u32::MAX as u64 {
            return Err(ArrayError::FileFull);
        }

        let mut w = Vec::with_capacity(payload.len() + BLOCK_HEADER_SIZE as usize);
        w.write_u32::<LittleEndian>(len as u32)?; // capacity
        w.write_u32::<LittleEndian>(len as u32)?; // used
        w.extend_from_slice(&payload);
        self.write_at(at, &w)?;

        self.file_end = at + BLOCK_HEADER_SIZE + len;
        Ok(at as u32)
    }

    fn write_count(&mut self) -> Result<()> {
        self.write_u32_at(COUNT_OFFSET, self.count)
    }

    //-------------------------------

    /// Checks the trie is well formed and returns the number of set
    /// values.  Fails if the walk disagrees with the header counter.
    pub fn check(&mut self) -> Result<u32> {
        let mut total = 0;
        let mut seen = BTreeSet::new();
        let mut pending = vec![ROOT];

        while let Some(node) = pending.pop() {
            if !seen.insert(node) {
                return Err(ArrayError::Corrupt(format!("node {} reached twice", node)));
            }

            if node + NODE_SIZE > self.file_end {
                return Err(ArrayError::Corrupt(format!(
                    "node {} past the end of the file",
                    node
                )));
            }

            let rec = self.read_node(node)?;
            if rec.tag != ValueTag::Unset {
                total += 1;
            }

            if rec.value_ptr != 0 {
                let ptr = rec.value_ptr as u64;
                if ptr + BLOCK_HEADER_SIZE > self.file_end {
                    return Err(ArrayError::Corrupt(format!(
                        "value block {} past the end of the file",
                        ptr
                    )));
                }

                let cap = self.read_u32_at(ptr)?;
                let used = self.read_u32_at(ptr + 4)?;
                if used > cap || ptr + BLOCK_HEADER_SIZE + cap as u64 > self.file_end {
                    return Err(ArrayError::Corrupt(format!(
                        "value block {} overruns its bounds ({}/{})",
                        ptr, used, cap
                    )));
                }
            }

            for child in rec.children {
                if child != 0 {
                    pending.push(child as u64);
                }
            }
        }

        if total != self.count {
            return Err(ArrayError::Corrupt(format!(
                "header count {} but {} reachable values",
                self.count, total
            )));
        }

        Ok(total)
    }
}

impl<V: StoredValue> Drop for HugeArray<V> {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
    }
}

//-------------------------------------------------------------------------
