//! Segmented write-ahead log keyed by contiguous u64 indices.
//!
//! Layout under `wal/`: segment files named `<20-digit first index>.seg`,
//! rotated at a size threshold. Entry framing:
//!
//! ```text
//! [index u64-LE][len u32-LE][payload]
//! ```
//!
//! Index 0 is the "empty log" sentinel and is never written. The handle is
//! shared (`Arc<Wal>`): the async writer appends, the coordinator truncates,
//! the snapshot rewriter reads; an interior `RwLock` keeps them apart.

pub(crate) mod writer;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{DbError, Result};

const SEGMENT_SUFFIX: &str = ".seg";
const FRAME_HEADER_SIZE: usize = 12;
const DEFAULT_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;

/// `wal_index(version) = version - initial_version + 1`; the inverse of
/// [`wal_version`]. Index 0 never maps to a version; versions below the
/// initial version saturate to that sentinel.
pub(crate) fn wal_index(version: u64, initial_version: u64) -> u64 {
    (version + 1).saturating_sub(initial_version)
}

/// `wal_version(index) = index + initial_version - 1`. Callers must handle
/// the `index == 0` sentinel before applying the formula.
pub(crate) fn wal_version(index: u64, initial_version: u64) -> u64 {
    debug_assert!(index > 0, "index 0 is the empty-log sentinel");
    index + initial_version - 1
}

#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Skip fsync on append and close; durability deferred to the OS.
    pub no_sync: bool,
    pub segment_bytes: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            no_sync: true,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
        }
    }
}

/// Reusable append batch.
#[derive(Debug, Default)]
pub struct WalBatch {
    entries: Vec<(u64, Vec<u8>)>,
}

impl WalBatch {
    pub fn write(&mut self, index: u64, payload: Vec<u8>) {
        self.entries.push((index, payload));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct Segment {
    first_index: u64,
    path: PathBuf,
    /// Frame start offsets; entry `i` has index `first_index + i`.
    offsets: Vec<u64>,
    len: u64,
    file: File,
}

impl Segment {
    fn last_index(&self) -> u64 {
        self.first_index + self.offsets.len() as u64 - 1
    }
}

#[derive(Debug, Default)]
struct WalInner {
    segments: Vec<Segment>,
    /// Append handle on the tail segment.
    tail: Option<File>,
    closed: bool,
}

#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    opts: WalOptions,
    inner: RwLock<WalInner>,
}

fn segment_path(dir: &Path, first_index: u64) -> PathBuf {
    dir.join(format!("{first_index:020}{SEGMENT_SUFFIX}"))
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let digits = name.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Scan one segment file, returning frame offsets and the usable length.
///
/// `tolerate_torn_tail` accepts a truncated final frame (crash mid-append)
/// and reports the length up to the last whole frame.
fn scan_segment(
    path: &Path,
    first_index: u64,
    tolerate_torn_tail: bool,
) -> Result<(Vec<u64>, u64)> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut offsets = Vec::new();
    let mut pos = 0usize;
    let mut expected = first_index;
    while pos < data.len() {
        if pos + FRAME_HEADER_SIZE > data.len() {
            break; // torn header
        }
        let index = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        let len = u32::from_le_bytes(data[pos + 8..pos + 12].try_into().unwrap()) as usize;
        if pos + FRAME_HEADER_SIZE + len > data.len() {
            break; // torn payload
        }
        if index != expected {
            return Err(DbError::wal(format!(
                "segment {} contains index {index}, expected {expected}",
                path.display()
            )));
        }
        offsets.push(pos as u64);
        pos += FRAME_HEADER_SIZE + len;
        expected += 1;
    }

    if pos < data.len() && !tolerate_torn_tail {
        return Err(DbError::wal(format!(
            "segment {} has a torn frame at offset {pos}",
            path.display()
        )));
    }
    Ok((offsets, pos as u64))
}

impl Wal {
    /// Open the log at `dir`. The directory is created lazily on first
    /// append, so read-only inspection never mutates the filesystem.
    pub fn open(dir: impl Into<PathBuf>, opts: WalOptions) -> Result<Self> {
        let dir = dir.into();
        let mut inner = WalInner::default();

        if dir.is_dir() {
            let mut firsts = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if name.ends_with(".seg-tmp") {
                    // interrupted front truncation
                    std::fs::remove_file(entry.path())?;
                    continue;
                }
                if let Some(first) = parse_segment_name(name) {
                    firsts.push(first);
                }
            }
            firsts.sort_unstable();

            for (i, first) in firsts.iter().copied().enumerate() {
                let path = segment_path(&dir, first);
                let is_last = i + 1 == firsts.len();
                let (offsets, len) = scan_segment(&path, first, is_last)?;
                if offsets.is_empty() {
                    if is_last {
                        // crash before the first full frame landed
                        std::fs::remove_file(&path)?;
                        continue;
                    }
                    return Err(DbError::wal(format!("empty segment {}", path.display())));
                }
                // A crash between the rename and the unlink of an interrupted
                // front truncation leaves the old segment behind, overlapping
                // the rewritten one. The overlapping prefix only held entries
                // the truncation was dropping, so discard it.
                while let Some(prev) = inner.segments.last() {
                    if prev.last_index() < first {
                        break;
                    }
                    warn!(segment = %prev.path.display(), "removing stale overlapping segment");
                    let stale = inner.segments.pop().expect("non-empty");
                    std::fs::remove_file(&stale.path)?;
                }
                if let Some(prev) = inner.segments.last() {
                    if prev.last_index() + 1 != first {
                        return Err(DbError::wal(format!(
                            "gap between segments at index {first}"
                        )));
                    }
                }
                // A torn tail is not repaired here: open must stay read-only
                // so inspection never mutates a live writer's log. The first
                // append truncates the stale bytes instead.
                let file = File::open(&path)?;
                inner.segments.push(Segment {
                    first_index: first,
                    path,
                    offsets,
                    len,
                    file,
                });
            }
        }

        Ok(Self {
            dir,
            opts,
            inner: RwLock::new(inner),
        })
    }

    /// First index, 0 when empty.
    pub fn first_index(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.first().map_or(0, |s| s.first_index)
    }

    /// Last index, 0 when empty.
    pub fn last_index(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.last().map_or(0, |s| s.last_index())
    }

    /// Read the payload at `index`.
    pub fn read(&self, index: u64) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let seg = inner
            .segments
            .iter()
            .rev()
            .find(|s| s.first_index <= index)
            .filter(|s| index <= s.last_index())
            .ok_or_else(|| DbError::wal(format!("index {index} not in log")))?;

        let pos = (index - seg.first_index) as usize;
        let start = seg.offsets[pos];
        let mut header = [0u8; FRAME_HEADER_SIZE];
        seg.file.read_exact_at(&mut header, start)?;
        let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        seg.file
            .read_exact_at(&mut payload, start + FRAME_HEADER_SIZE as u64)?;
        Ok(payload)
    }

    /// Append a batch. Entries must continue the log contiguously; the first
    /// entry of an empty log may start at any index.
    pub fn write_batch(&self, batch: &WalBatch) -> Result<()> {
        if batch.entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(DbError::wal("log is closed"));
        }

        let mut expected = inner.segments.last().map(|s| s.last_index() + 1);
        for (index, _) in &batch.entries {
            if let Some(want) = expected {
                if *index != want {
                    return Err(DbError::wal(format!(
                        "out-of-order append: index {index}, expected {want}"
                    )));
                }
            }
            expected = Some(*index + 1);
        }

        for (index, payload) in &batch.entries {
            self.append_one(&mut inner, *index, payload)?;
        }
        if !self.opts.no_sync {
            if let Some(tail) = &inner.tail {
                tail.sync_data()?;
            }
        }
        Ok(())
    }

    fn append_one(&self, inner: &mut WalInner, index: u64, payload: &[u8]) -> Result<()> {
        let rotate = match inner.segments.last() {
            Some(seg) => seg.len >= self.opts.segment_bytes,
            None => true,
        };
        if rotate {
            std::fs::create_dir_all(&self.dir)?;
            let path = segment_path(&self.dir, index);
            let tail = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)?;
            let file = File::open(&path)?;
            inner.segments.push(Segment {
                first_index: index,
                path,
                offsets: Vec::new(),
                len: 0,
                file,
            });
            inner.tail = Some(tail);
        } else if inner.tail.is_none() {
            let seg = inner.segments.last().expect("non-empty");
            // drop torn bytes left by a crash before appending past them
            if std::fs::metadata(&seg.path)?.len() > seg.len {
                warn!(segment = %seg.path.display(), "truncating torn wal tail");
                OpenOptions::new().write(true).open(&seg.path)?.set_len(seg.len)?;
            }
            inner.tail = Some(OpenOptions::new().append(true).open(&seg.path)?);
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&index.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        inner.tail.as_mut().expect("tail open").write_all(&frame)?;

        let seg = inner.segments.last_mut().expect("non-empty");
        seg.offsets.push(seg.len);
        seg.len += frame.len() as u64;
        Ok(())
    }

    /// Drop all entries before `index`, so `first_index() == index`.
    ///
    /// Idempotent: `index <= first_index()` is a no-op. `index == last + 1`
    /// empties the log.
    pub fn truncate_front(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(DbError::wal("log is closed"));
        }
        let Some(first_seg) = inner.segments.first() else {
            return Ok(());
        };
        let first = first_seg.first_index;
        let last = inner.segments.last().expect("non-empty").last_index();
        if index <= first {
            return Ok(());
        }
        if index > last + 1 {
            return Err(DbError::wal(format!(
                "truncate_front({index}) beyond last index {last}"
            )));
        }

        if index == last + 1 {
            inner.tail = None;
            let segments = std::mem::take(&mut inner.segments);
            for seg in segments {
                std::fs::remove_file(&seg.path)?;
            }
            return Ok(());
        }

        // Drop whole segments, then rewrite the one containing `index`.
        while inner.segments[0].last_index() < index {
            let seg = inner.segments.remove(0);
            std::fs::remove_file(&seg.path)?;
        }
        let seg = &inner.segments[0];
        if seg.first_index >= index {
            return Ok(());
        }

        let skip = (index - seg.first_index) as usize;
        let keep_from = seg.offsets[skip];
        let mut remainder = vec![0u8; (seg.len - keep_from) as usize];
        seg.file.read_exact_at(&mut remainder, keep_from)?;

        let new_path = segment_path(&self.dir, index);
        let tmp_path = new_path.with_extension("seg-tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&remainder)?;
        tmp.sync_data()?;
        std::fs::rename(&tmp_path, &new_path)?;

        let old_path = seg.path.clone();
        let was_tail = inner.segments.len() == 1;
        let new_len = seg.len - keep_from;
        let offsets: Vec<u64> = seg
            .offsets
            .iter()
            .skip(skip)
            .map(|off| off - keep_from)
            .collect();
        inner.segments[0] = Segment {
            first_index: index,
            path: new_path.clone(),
            offsets,
            len: new_len,
            file: File::open(&new_path)?,
        };
        if was_tail {
            inner.tail = Some(OpenOptions::new().append(true).open(&new_path)?);
        }
        if old_path != new_path {
            std::fs::remove_file(&old_path)?;
        }
        Ok(())
    }

    /// Drop all entries after `index`, so `last_index() == index`.
    ///
    /// Idempotent: `index >= last_index()` is a no-op. `index < first_index()`
    /// empties the log.
    pub fn truncate_back(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(DbError::wal("log is closed"));
        }
        let Some(last_seg) = inner.segments.last() else {
            return Ok(());
        };
        if index >= last_seg.last_index() {
            return Ok(());
        }
        inner.tail = None;

        while let Some(seg) = inner.segments.last() {
            if seg.first_index > index {
                let seg = inner.segments.pop().expect("non-empty");
                std::fs::remove_file(&seg.path)?;
            } else {
                break;
            }
        }
        let Some(seg) = inner.segments.last_mut() else {
            return Ok(());
        };

        if seg.last_index() > index {
            let keep = (index - seg.first_index + 1) as usize;
            let last_kept = seg.offsets[keep - 1];
            let new_len = last_kept + frame_len(&seg.file, last_kept)? as u64;
            OpenOptions::new()
                .write(true)
                .open(&seg.path)?
                .set_len(new_len)?;
            seg.offsets.truncate(keep);
            seg.len = new_len;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        if let Some(tail) = &inner.tail {
            tail.sync_data()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        if let Some(tail) = inner.tail.take() {
            tail.sync_data()?;
        }
        inner.closed = true;
        Ok(())
    }
}

fn frame_len(file: &File, offset: u64) -> Result<usize> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    file.read_exact_at(&mut header, offset)?;
    let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    Ok(FRAME_HEADER_SIZE + len)
}
