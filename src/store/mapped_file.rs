// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed size memory mapped segment.
//!
//! A segment tracks three positions:
//! - `write_pos`: next free byte, only moved by the single writer
//! - `committed_pos`: bytes readers may see
//! - `flushed_pos`: bytes known to be on stable storage
//!
//! Readers never look past `committed_pos`, the writer never touches bytes
//! below `write_pos`, so the two only share the mapping, not memory ranges.

use std::fmt;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, trace, warn};

use super::record::{encode_end_marker, END_MARKER_LEN};

pub struct MappedFile {
    path: PathBuf,
    base_offset: u64,
    file_size: u64,
    mmap: MmapRaw,
    write_pos: AtomicU64,
    committed_pos: AtomicU64,
    flushed_pos: AtomicU64,
    /// readers currently holding a slice of this segment
    ref_count: AtomicI64,
    available: AtomicBool,
}

impl fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("base_offset", &self.base_offset)
            .field("file_size", &self.file_size)
            .field("write_pos", &self.write_pos())
            .field("committed_pos", &self.committed_pos())
            .field("flushed_pos", &self.flushed_pos())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl MappedFile {
    /// Creates (or reuses) the file at `path`, sized to `file_size`, and maps it.
    pub fn create(path: impl AsRef<Path>, base_offset: u64, file_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(file_size)?;
        let mapped = Self::map(path, file, base_offset, file_size)?;
        debug!(
            "created segment {} base_offset={} size={}",
            mapped.path.display(),
            base_offset,
            file_size
        );
        Ok(mapped)
    }

    /// Maps an existing segment file. All positions start at 0, the loader
    /// decides where valid data ends.
    pub fn open(path: impl AsRef<Path>, base_offset: u64, file_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len != file_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "segment {} has size {}, expected {}",
                    path.display(),
                    len,
                    file_size
                ),
            ));
        }
        Self::map(path, file, base_offset, file_size)
    }

    fn map(path: PathBuf, file: File, base_offset: u64, file_size: u64) -> io::Result<Self> {
        let mmap = MmapOptions::new().len(file_size as usize).map_raw(&file)?;
        Ok(Self {
            path,
            base_offset,
            file_size,
            mmap,
            write_pos: AtomicU64::new(0),
            committed_pos: AtomicU64::new(0),
            flushed_pos: AtomicU64::new(0),
            ref_count: AtomicI64::new(0),
            available: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn write_pos(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    pub fn committed_pos(&self) -> u64 {
        self.committed_pos.load(Ordering::Acquire)
    }

    pub fn flushed_pos(&self) -> u64 {
        self.flushed_pos.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.file_size - self.write_pos()
    }

    pub fn is_full(&self) -> bool {
        self.write_pos() == self.file_size
    }

    /// Committed bytes not yet flushed.
    pub fn dirty_bytes(&self) -> u64 {
        self.committed_pos().saturating_sub(self.flushed_pos())
    }

    /// Appends `data` at `write_pos` and makes it visible to readers.
    ///
    /// Returns the in-segment position of the data, or `None` when it does
    /// not fit. Callers must serialize appends to the same segment.
    pub(crate) fn append(&self, data: &[u8]) -> Option<u64> {
        let pos = self.write_pos();
        let len = data.len() as u64;
        if pos + len > self.file_size {
            return None;
        }
        // SAFETY: [pos, pos + len) lies inside the mapping and above
        // committed_pos, no reader can observe it until the store below.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mmap.as_mut_ptr().add(pos as usize),
                data.len(),
            );
        }
        self.write_pos.store(pos + len, Ordering::Release);
        self.committed_pos.store(pos + len, Ordering::Release);
        trace!(
            "append {} bytes at {} of segment {}",
            len,
            pos,
            self.base_offset
        );
        Some(pos)
    }

    /// Writes the END marker over the unused tail and marks the segment full.
    pub(crate) fn seal(&self) {
        let remaining = self.remaining();
        if remaining >= END_MARKER_LEN as u64 {
            let marker = encode_end_marker(remaining as u32);
            let pos = self.write_pos();
            // SAFETY: same invariant as `append`, the marker fits in the tail.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    marker.as_ptr(),
                    self.mmap.as_mut_ptr().add(pos as usize),
                    END_MARKER_LEN,
                );
            }
        }
        self.write_pos.store(self.file_size, Ordering::Release);
        self.committed_pos.store(self.file_size, Ordering::Release);
    }

    /// Hands out a reference counted view of committed bytes.
    pub fn select(self: &Arc<Self>, pos: u64, size: u64) -> Option<SegmentSlice> {
        if pos + size > self.committed_pos() {
            return None;
        }
        if !self.hold() {
            return None;
        }
        Some(SegmentSlice {
            file: Arc::clone(self),
            pos: pos as usize,
            len: size as usize,
        })
    }

    /// The whole mapping, regardless of positions.
    ///
    /// Only for recovery and tooling, which run without a concurrent writer.
    pub(crate) fn raw_contents(&self) -> &[u8] {
        // SAFETY: the mapping is file_size bytes long and lives as long as self.
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr(), self.file_size as usize) }
    }

    /// Flushes committed bytes, returns the new flushed position.
    pub fn flush(&self) -> io::Result<u64> {
        let committed = self.committed_pos();
        let flushed = self.flushed_pos();
        if committed > flushed && self.hold() {
            let result = self
                .mmap
                .flush_range(flushed as usize, (committed - flushed) as usize);
            self.release();
            result?;
            self.flushed_pos.fetch_max(committed, Ordering::AcqRel);
            trace!(
                "flushed segment {} from {} to {}",
                self.base_offset,
                flushed,
                committed
            );
        }
        Ok(self.flushed_pos())
    }

    /// Moves all positions to `pos`. Recovery is the only caller allowed to
    /// move them backwards.
    pub(crate) fn set_positions(&self, pos: u64) {
        let pos = pos.min(self.file_size);
        self.write_pos.store(pos, Ordering::Release);
        self.committed_pos.store(pos, Ordering::Release);
        self.flushed_pos.store(pos, Ordering::Release);
    }

    /// Zeroes everything from `pos` to the end and flushes it, so a later
    /// scan sees a clean end of data.
    pub(crate) fn zero_from(&self, pos: u64) -> io::Result<()> {
        if pos >= self.file_size {
            return Ok(());
        }
        let len = (self.file_size - pos) as usize;
        // SAFETY: only called before the segment accepts appends or reads.
        unsafe {
            std::ptr::write_bytes(self.mmap.as_mut_ptr().add(pos as usize), 0, len);
        }
        self.mmap.flush_range(pos as usize, len)
    }

    pub fn hold(&self) -> bool {
        if !self.available.load(Ordering::Acquire) {
            return false;
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        if !self.available.load(Ordering::Acquire) {
            self.release();
            return false;
        }
        true
    }

    pub fn release(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Deletes the file when no reader holds a slice. Returns whether the
    /// file was deleted; a held segment keeps serving reads and is left for
    /// a later call.
    pub fn destroy(&self) -> io::Result<bool> {
        if !self.defer_if_referenced() {
            self.available.store(false, Ordering::Release);
            // a reader may have slipped in before the flag flipped
            if !self.defer_if_referenced() {
                return self.remove_file();
            }
            self.available.store(true, Ordering::Release);
        }
        Ok(false)
    }

    fn defer_if_referenced(&self) -> bool {
        let refs = self.ref_count();
        if refs > 0 {
            warn!(
                "segment {} still referenced by {} readers, delete deferred",
                self.path.display(),
                refs
            );
            return true;
        }
        false
    }

    fn remove_file(&self) -> io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        debug!("deleted segment {}", self.path.display());
        Ok(true)
    }

    pub fn last_modified(&self) -> io::Result<SystemTime> {
        std::fs::metadata(&self.path)?.modified()
    }
}

/// Read view of committed segment bytes. Keeps the segment referenced until
/// dropped.
pub struct SegmentSlice {
    file: Arc<MappedFile>,
    pos: usize,
    len: usize,
}

impl SegmentSlice {
    pub fn segment(&self) -> &Arc<MappedFile> {
        &self.file
    }

    /// Global offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.file.base_offset + self.pos as u64
    }
}

impl Deref for SegmentSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: select checked pos + len against committed_pos, committed
        // bytes are never rewritten while the segment is held.
        unsafe { std::slice::from_raw_parts(self.file.mmap.as_ptr().add(self.pos), self.len) }
    }
}

impl Drop for SegmentSlice {
    fn drop(&mut self) {
        self.file.release();
    }
}

impl fmt::Debug for SegmentSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentSlice")
            .field("base_offset", &self.file.base_offset)
            .field("pos", &self.pos)
            .field("len", &self.len)
            .finish()
    }
}
