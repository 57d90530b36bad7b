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

//! Ordered, gap free list of segments living in one directory.
//!
//! Segment `n + 1` always starts at `segment[n].base_offset + file_size`.
//! The last segment is the active one; every other segment is sealed.
//! The list is guarded by a read/write lock that is only held while finding,
//! adding or removing a segment, never while reading segment bytes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::mapped_file::MappedFile;
use super::segment_file_name;
use crate::{AppError, AppResult};

/// Creates the backing file of a new segment.
pub trait SegmentAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, base_offset: u64) -> AppResult<MappedFile>;
}

/// Allocates segments as `<dir>/<base_offset>`.
#[derive(Debug)]
pub struct DirSegmentAllocator {
    dir: PathBuf,
    file_size: u64,
}

impl DirSegmentAllocator {
    pub fn new(dir: impl Into<PathBuf>, file_size: u64) -> Self {
        Self {
            dir: dir.into(),
            file_size,
        }
    }
}

impl SegmentAllocator for DirSegmentAllocator {
    fn allocate(&self, base_offset: u64) -> AppResult<MappedFile> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            AppError::NoSpace(format!(
                "failed to create segment directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        let path = self.dir.join(segment_file_name(base_offset));
        MappedFile::create(&path, base_offset, self.file_size).map_err(|e| {
            AppError::NoSpace(format!(
                "failed to allocate segment {}: {}",
                path.display(),
                e
            ))
        })
    }
}

pub struct MappedFileQueue {
    dir: PathBuf,
    file_size: u64,
    /// 0 means unlimited
    max_files: usize,
    files: RwLock<Vec<Arc<MappedFile>>>,
    allocator: Arc<dyn SegmentAllocator>,
}

impl fmt::Debug for MappedFileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFileQueue")
            .field("dir", &self.dir)
            .field("file_size", &self.file_size)
            .field("files", &self.files.read().len())
            .finish()
    }
}

impl MappedFileQueue {
    pub fn new(
        dir: impl Into<PathBuf>,
        file_size: u64,
        max_files: usize,
        allocator: Arc<dyn SegmentAllocator>,
    ) -> Self {
        Self {
            dir: dir.into(),
            file_size,
            max_files,
            files: RwLock::new(Vec::new()),
            allocator,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Maps every segment file found in the directory.
    ///
    /// Loaded segments are treated as full, recovery moves the positions of
    /// the tail afterwards. A file that cannot be mapped, has the wrong size
    /// or breaks the offset sequence fails the load.
    pub fn load(&self) -> AppResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let read_dir = std::fs::read_dir(&self.dir).map_err(|e| {
            AppError::DiskFailure(format!(
                "read dir: {} error: {} while loading segments",
                self.dir.display(),
                e
            ))
        })?;

        let mut base_offsets = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| {
                AppError::DiskFailure(format!(
                    "read dir: {} error: {} while loading segments",
                    self.dir.display(),
                    e
                ))
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            match file_name.parse::<u64>() {
                Ok(base_offset) => base_offsets.push((base_offset, path)),
                Err(_) => {
                    warn!("skip unknown file in segment dir: {}", path.display());
                }
            }
        }
        base_offsets.sort_by_key(|(base_offset, _)| *base_offset);

        let mut files: Vec<Arc<MappedFile>> = Vec::with_capacity(base_offsets.len());
        for (base_offset, path) in base_offsets {
            if base_offset % self.file_size != 0 {
                return Err(AppError::DiskFailure(format!(
                    "segment {} base offset is not a multiple of {}",
                    path.display(),
                    self.file_size
                )));
            }
            if let Some(prev) = files.last() {
                if prev.base_offset() + self.file_size != base_offset {
                    return Err(AppError::DiskFailure(format!(
                        "segment {} does not follow segment {}",
                        path.display(),
                        prev.path().display()
                    )));
                }
            }
            let file = MappedFile::open(&path, base_offset, self.file_size).map_err(|e| {
                AppError::DiskFailure(format!("open segment {} error: {}", path.display(), e))
            })?;
            file.set_positions(self.file_size);
            files.push(Arc::new(file));
        }

        info!(
            "loaded {} segments from {}",
            files.len(),
            self.dir.display()
        );
        *self.files.write() = files;
        Ok(())
    }

    /// Snapshot of the current segments, oldest first.
    pub fn segments(&self) -> Vec<Arc<MappedFile>> {
        self.files.read().clone()
    }

    pub fn segment_count(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    pub fn first(&self) -> Option<Arc<MappedFile>> {
        self.files.read().first().cloned()
    }

    pub fn last(&self) -> Option<Arc<MappedFile>> {
        self.files.read().last().cloned()
    }

    /// Returns the active segment, creating the next one when the active
    /// segment is full. An empty queue starts at the segment containing
    /// `start_offset`.
    pub fn last_or_create(&self, start_offset: u64) -> AppResult<Arc<MappedFile>> {
        let base_offset = match self.last() {
            Some(last) if !last.is_full() => return Ok(last),
            Some(last) => last.base_offset() + self.file_size,
            None => start_offset - start_offset % self.file_size,
        };
        self.create(base_offset)
    }

    fn create(&self, base_offset: u64) -> AppResult<Arc<MappedFile>> {
        if self.max_files > 0 && self.segment_count() >= self.max_files {
            return Err(AppError::NoSpace(format!(
                "segment quota of {} reached in {}",
                self.max_files,
                self.dir.display()
            )));
        }
        let file = self.allocator.allocate(base_offset)?;
        if file.base_offset() != base_offset || file.file_size() != self.file_size {
            return Err(AppError::IllegalState(format!(
                "allocator returned segment {} (base {}, size {}), expected base {} size {}",
                file.path().display(),
                file.base_offset(),
                file.file_size(),
                base_offset,
                self.file_size
            )));
        }
        let file = Arc::new(file);
        self.files.write().push(Arc::clone(&file));
        debug!(
            "rolled to new segment {} in {}",
            base_offset,
            self.dir.display()
        );
        Ok(file)
    }

    /// Binary search for the segment whose range contains `offset`.
    pub fn find_by_offset(&self, offset: u64) -> Option<Arc<MappedFile>> {
        let files = self.files.read();
        let idx = files.partition_point(|f| f.base_offset() <= offset);
        if idx == 0 {
            return None;
        }
        let file = &files[idx - 1];
        if offset < file.base_offset() + self.file_size {
            Some(Arc::clone(file))
        } else {
            None
        }
    }

    pub fn min_offset(&self) -> u64 {
        self.first().map(|f| f.base_offset()).unwrap_or(0)
    }

    /// Global offset right after the last committed byte.
    pub fn max_offset(&self) -> u64 {
        self.last()
            .map(|f| f.base_offset() + f.committed_pos())
            .unwrap_or(0)
    }

    /// Global offset up to which every byte is flushed.
    pub fn flushed_offset(&self) -> u64 {
        let files = self.files.read();
        for file in files.iter() {
            if file.flushed_pos() < file.committed_pos() || !file.is_full() {
                return file.base_offset() + file.flushed_pos();
            }
        }
        files
            .last()
            .map(|f| f.base_offset() + f.flushed_pos())
            .unwrap_or(0)
    }

    /// Flushes every segment with dirty bytes, returns the flushed offset.
    pub fn flush(&self) -> AppResult<u64> {
        for file in self.segments() {
            if file.dirty_bytes() > 0 {
                file.flush().map_err(|e| {
                    AppError::DiskFailure(format!(
                        "flush segment {} error: {}",
                        file.path().display(),
                        e
                    ))
                })?;
            }
        }
        Ok(self.flushed_offset())
    }

    /// Drops everything at or after `offset`: the segment containing it is
    /// cut and zeroed, later segments are deleted.
    pub fn truncate_dirty(&self, offset: u64) -> AppResult<()> {
        let mut files = self.files.write();
        let mut keep = Vec::with_capacity(files.len());
        for file in files.drain(..) {
            let end = file.base_offset() + self.file_size;
            if end <= offset {
                keep.push(file);
            } else if file.base_offset() <= offset {
                let pos = offset - file.base_offset();
                file.zero_from(pos).map_err(|e| {
                    AppError::DiskFailure(format!(
                        "truncate segment {} error: {}",
                        file.path().display(),
                        e
                    ))
                })?;
                file.set_positions(pos);
                keep.push(file);
            } else {
                warn!(
                    "delete segment {} beyond truncation offset {}",
                    file.path().display(),
                    offset
                );
                file.destroy().map_err(|e| {
                    AppError::DiskFailure(format!(
                        "delete segment {} error: {}",
                        file.path().display(),
                        e
                    ))
                })?;
            }
        }
        *files = keep;
        Ok(())
    }

    /// Deletes every segment, including the active one.
    pub fn destroy_all(&self) -> AppResult<()> {
        let mut files = self.files.write();
        for file in files.drain(..) {
            file.destroy().map_err(|e| {
                AppError::DiskFailure(format!(
                    "delete segment {} error: {}",
                    file.path().display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Deletes leading sealed segments while `expired` holds. The active
    /// segment is never deleted, and deletion stops at the first segment
    /// still referenced by a reader.
    pub fn delete_leading_while(
        &self,
        mut expired: impl FnMut(&MappedFile) -> bool,
    ) -> AppResult<Vec<u64>> {
        let mut deleted = Vec::new();
        let mut files = self.files.write();
        while files.len() > 1 {
            let first = &files[0];
            if !expired(first.as_ref()) {
                break;
            }
            let destroyed = first.destroy().map_err(|e| {
                AppError::DiskFailure(format!(
                    "delete segment {} error: {}",
                    first.path().display(),
                    e
                ))
            })?;
            if !destroyed {
                break;
            }
            deleted.push(first.base_offset());
            files.remove(0);
        }
        Ok(deleted)
    }

    /// Deletes leading sealed segments last modified more than `retention`
    /// before `now`.
    pub fn delete_expired_by_time(
        &self,
        retention: Duration,
        now: SystemTime,
    ) -> AppResult<Vec<u64>> {
        let deleted = self.delete_leading_while(|file| match file.last_modified() {
            Ok(modified) => now
                .duration_since(modified)
                .map(|age| age >= retention)
                .unwrap_or(false),
            Err(e) => {
                warn!(
                    "can not stat segment {}: {}, keep it",
                    file.path().display(),
                    e
                );
                false
            }
        })?;
        if !deleted.is_empty() {
            info!(
                "deleted {} expired segments from {}",
                deleted.len(),
                self.dir.display()
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue(dir: &Path, file_size: u64, max_files: usize) -> MappedFileQueue {
        MappedFileQueue::new(
            dir,
            file_size,
            max_files,
            Arc::new(DirSegmentAllocator::new(dir, file_size)),
        )
    }

    #[test]
    fn test_roll_and_find() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path(), 64, 0);

        let first = queue.last_or_create(0)?;
        assert_eq!(first.base_offset(), 0);
        first.append(&[1u8; 64]);
        assert!(first.is_full());

        let second = queue.last_or_create(0)?;
        assert_eq!(second.base_offset(), 64);
        second.append(&[2u8; 10]);

        assert_eq!(queue.find_by_offset(0).unwrap().base_offset(), 0);
        assert_eq!(queue.find_by_offset(63).unwrap().base_offset(), 0);
        assert_eq!(queue.find_by_offset(70).unwrap().base_offset(), 64);
        assert!(queue.find_by_offset(128).is_none());
        assert_eq!(queue.min_offset(), 0);
        assert_eq!(queue.max_offset(), 74);
        Ok(())
    }

    #[test]
    fn test_quota_reports_no_space() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path(), 16, 1);
        let first = queue.last_or_create(0)?;
        first.append(&[0u8; 16]);
        assert!(matches!(queue.last_or_create(0), Err(AppError::NoSpace(_))));
        Ok(())
    }

    #[test]
    fn test_load_keeps_order_and_rejects_gaps() -> AppResult<()> {
        let dir = tempdir()?;
        {
            let queue = queue(dir.path(), 32, 0);
            for _ in 0..3 {
                let file = queue.last_or_create(0)?;
                file.append(&[5u8; 32]);
                file.flush()?;
            }
        }
        let loaded = queue(dir.path(), 32, 0);
        loaded.load()?;
        let bases: Vec<u64> = loaded.segments().iter().map(|f| f.base_offset()).collect();
        assert_eq!(bases, vec![0, 32, 64]);
        assert_eq!(loaded.max_offset(), 96);

        std::fs::remove_file(dir.path().join(segment_file_name(32)))?;
        let broken = queue(dir.path(), 32, 0);
        assert!(matches!(broken.load(), Err(AppError::DiskFailure(_))));
        Ok(())
    }

    #[test]
    fn test_truncate_dirty() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path(), 32, 0);
        for _ in 0..3 {
            let file = queue.last_or_create(0)?;
            file.append(&[5u8; 32]);
        }
        queue.truncate_dirty(40)?;
        assert_eq!(queue.segment_count(), 2);
        assert_eq!(queue.max_offset(), 40);
        assert!(!dir.path().join(segment_file_name(64)).exists());
        let last = queue.last().unwrap();
        assert_eq!(last.write_pos(), 8);
        assert!(last.raw_contents()[8..].iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn test_delete_leading_keeps_active_segment() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path(), 16, 0);
        for _ in 0..3 {
            let file = queue.last_or_create(0)?;
            file.append(&[1u8; 16]);
        }
        let deleted = queue.delete_expired_by_time(Duration::ZERO, SystemTime::now())?;
        assert_eq!(deleted, vec![0, 16]);
        assert_eq!(queue.segment_count(), 1);
        assert_eq!(queue.min_offset(), 32);
        Ok(())
    }

    #[test]
    fn test_delete_stops_at_referenced_segment() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path(), 16, 0);
        for _ in 0..2 {
            let file = queue.last_or_create(0)?;
            file.append(&[1u8; 16]);
        }
        let held = queue.first().unwrap().select(0, 4).unwrap();
        let deleted = queue.delete_leading_while(|_| true)?;
        assert!(deleted.is_empty());
        assert_eq!(queue.segment_count(), 2);
        // the kept segment still serves reads
        let first = queue.find_by_offset(0).unwrap();
        assert_eq!(&first.select(0, 4).unwrap()[..], &[1u8; 4]);
        drop(first);
        drop(held);
        assert_eq!(queue.delete_leading_while(|_| true)?, vec![0]);
        Ok(())
    }
}
