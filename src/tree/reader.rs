//! Sorted key/value table: the on-disk form of one tree inside a snapshot.
//!
//! File layout (`kvs`):
//!
//! ```text
//! [count u64-LE]
//! [offset u64-LE] x count        absolute offsets, ascending key order
//! [klen u32-LE][vlen u32-LE][key][value] x count
//! ```
//!
//! Readers keep the whole file resident, either mmapped (zero-copy mode) or
//! loaded onto the heap, and answer point lookups by binary search over the
//! offset array.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{DbError, Result};

pub(crate) const KVS_FILE_NAME: &str = "kvs";

const COUNT_SIZE: usize = 8;
const OFFSET_SIZE: usize = 8;
const ENTRY_HEADER_SIZE: usize = 8;

enum TableBuf {
    Mmap(Mmap),
    Heap(Vec<u8>),
}

impl TableBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            TableBuf::Mmap(map) => map,
            TableBuf::Heap(buf) => buf,
        }
    }
}

/// Immutable, shareable view of one tree's snapshot table.
#[derive(Clone)]
pub struct TableReader {
    buf: Arc<TableBuf>,
    count: usize,
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("count", &self.count)
            .finish()
    }
}

impl TableReader {
    /// Open the table file, mmapped when `zero_copy` is set.
    pub fn open(path: &Path, zero_copy: bool) -> Result<Self> {
        let buf = if zero_copy {
            let file = File::open(path)?;
            // Safety: snapshot files are immutable once the directory is
            // renamed into place; no live writer mutates them.
            let map = unsafe { Mmap::map(&file)? };
            TableBuf::Mmap(map)
        } else {
            TableBuf::Heap(std::fs::read(path)?)
        };

        let data = buf.as_slice();
        if data.len() < COUNT_SIZE {
            return Err(DbError::Corrupt(format!(
                "table {} shorter than header",
                path.display()
            )));
        }
        let count = u64::from_le_bytes(data[..COUNT_SIZE].try_into().unwrap()) as usize;
        let index_end = COUNT_SIZE
            .checked_add(count.checked_mul(OFFSET_SIZE).ok_or_else(|| {
                DbError::Corrupt(format!("table {} count overflows", path.display()))
            })?)
            .ok_or_else(|| DbError::Corrupt(format!("table {} count overflows", path.display())))?;
        if data.len() < index_end {
            return Err(DbError::Corrupt(format!(
                "table {} truncated offset index",
                path.display()
            )));
        }

        let reader = Self {
            buf: Arc::new(buf),
            count,
        };
        // Validate every entry frame up front so lookups can slice without
        // rechecking bounds.
        for i in 0..count {
            reader.entry(i)?;
        }
        Ok(reader)
    }

    /// Empty table with no backing file.
    pub fn empty() -> Self {
        Self {
            buf: Arc::new(TableBuf::Heap(0u64.to_le_bytes().to_vec())),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn offset(&self, i: usize) -> usize {
        let pos = COUNT_SIZE + i * OFFSET_SIZE;
        let data = self.buf.as_slice();
        u64::from_le_bytes(data[pos..pos + OFFSET_SIZE].try_into().unwrap()) as usize
    }

    fn entry(&self, i: usize) -> Result<(&[u8], &[u8])> {
        let data = self.buf.as_slice();
        let off = self.offset(i);
        if off + ENTRY_HEADER_SIZE > data.len() {
            return Err(DbError::Corrupt(format!("entry {i} offset out of bounds")));
        }
        let klen = u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as usize;
        let vlen = u32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap()) as usize;
        let key_start = off + ENTRY_HEADER_SIZE;
        let val_end = key_start
            .checked_add(klen)
            .and_then(|ks| ks.checked_add(vlen))
            .ok_or_else(|| DbError::Corrupt(format!("entry {i} length overflows")))?;
        if val_end > data.len() {
            return Err(DbError::Corrupt(format!("entry {i} spills past file end")));
        }
        Ok((
            &data[key_start..key_start + klen],
            &data[key_start + klen..val_end],
        ))
    }

    /// Entry at `i`; valid after `open` succeeded.
    pub fn entry_at(&self, i: usize) -> (&[u8], &[u8]) {
        self.entry(i).expect("validated at open")
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let mut lo = 0usize;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (k, v) = self.entry_at(mid);
            match k.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(v),
            }
        }
        None
    }

    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            reader: self,
            next: 0,
        }
    }
}

pub struct TableIter<'a> {
    reader: &'a TableReader,
    next: usize,
}

impl<'a> Iterator for TableIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.reader.count {
            return None;
        }
        let (k, v) = self.reader.entry_at(self.next);
        self.next += 1;
        Some((k, v))
    }
}

/// Write a table file from pairs already in ascending key order.
///
/// Data and the containing directory are synced before returning, so a
/// subsequent rename of the snapshot directory publishes a complete file.
pub fn write_table<'a>(
    path: &Path,
    count: usize,
    pairs: impl Iterator<Item = (&'a [u8], &'a [u8])>,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&(count as u64).to_le_bytes())?;
    // Reserve the offset index; filled in after the entries are laid out.
    writer.write_all(&vec![0u8; count * OFFSET_SIZE])?;

    let mut offsets = Vec::with_capacity(count);
    let mut pos = (COUNT_SIZE + count * OFFSET_SIZE) as u64;
    let mut written = 0usize;
    for (key, value) in pairs {
        offsets.push(pos);
        writer.write_all(&(key.len() as u32).to_le_bytes())?;
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(key)?;
        writer.write_all(value)?;
        pos += (ENTRY_HEADER_SIZE + key.len() + value.len()) as u64;
        written += 1;
    }
    if written != count {
        return Err(DbError::Corrupt(format!(
            "table writer expected {count} pairs, got {written}"
        )));
    }

    let mut file = writer.into_inner().map_err(|err| err.into_error())?;
    file.seek(SeekFrom::Start(COUNT_SIZE as u64))?;
    let mut index = Vec::with_capacity(count * OFFSET_SIZE);
    for off in offsets {
        index.extend_from_slice(&off.to_le_bytes());
    }
    file.write_all(&index)?;
    file.sync_data()?;

    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
