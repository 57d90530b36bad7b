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

//! Dense per topic/queue index into the commit log.
//!
//! Entry `i` lives at byte `i * CQ_ENTRY_SIZE` of the queue and describes the
//! record with queue offset `i`. Entries are fixed size, so a lookup is one
//! segment search and one 20 byte read.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use tracing::{debug, info, warn};

use super::mapped_file::MappedFile;
use super::mapped_file_queue::{MappedFileQueue, SegmentAllocator};
use super::CreateRequestListener;
use crate::{AppError, AppResult};

pub const CQ_ENTRY_SIZE: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub commit_log_offset: u64,
    pub size: u32,
    /// store timestamp, or the due timestamp for delay buckets
    pub tag: u64,
}

impl CqEntry {
    pub fn encode(&self) -> [u8; CQ_ENTRY_SIZE as usize] {
        let mut buf = [0u8; CQ_ENTRY_SIZE as usize];
        let mut cursor = &mut buf[..];
        cursor.put_u64(self.commit_log_offset);
        cursor.put_u32(self.size);
        cursor.put_u64(self.tag);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Self {
        Self {
            commit_log_offset: buf.get_u64(),
            size: buf.get_u32(),
            tag: buf.get_u64(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Commit log offset right after the indexed record.
    pub fn end_offset(&self) -> u64 {
        self.commit_log_offset + self.size as u64
    }
}

/// Routes segment allocation of one queue to its [`CreateRequestListener`].
#[derive(Debug)]
struct ListenerAllocator {
    topic: String,
    queue_id: u32,
    file_size: u64,
    listener: Arc<dyn CreateRequestListener>,
}

impl SegmentAllocator for ListenerAllocator {
    fn allocate(&self, base_offset: u64) -> AppResult<MappedFile> {
        self.listener
            .on_require_create(&self.topic, self.queue_id, base_offset / self.file_size)
    }
}

pub struct ConsumeQueue {
    topic: String,
    queue_id: u32,
    files: MappedFileQueue,
    /// first queue offset still served, moved by retention
    min_logical_offset: AtomicU64,
}

impl fmt::Debug for ConsumeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeQueue")
            .field("topic", &self.topic)
            .field("queue_id", &self.queue_id)
            .field("min_offset", &self.min_offset())
            .field("max_offset", &self.max_offset())
            .finish()
    }
}

impl ConsumeQueue {
    pub fn new(
        topic: impl Into<String>,
        queue_id: u32,
        dir: impl Into<PathBuf>,
        entries_per_file: u64,
        listener: Arc<dyn CreateRequestListener>,
    ) -> Self {
        let topic = topic.into();
        let file_size = entries_per_file * CQ_ENTRY_SIZE;
        let allocator = Arc::new(ListenerAllocator {
            topic: topic.clone(),
            queue_id,
            file_size,
            listener,
        });
        Self {
            topic,
            queue_id,
            files: MappedFileQueue::new(dir, file_size, 0, allocator),
            min_logical_offset: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    /// Maps the files of this queue and finds the end of written entries.
    pub fn load(&self) -> AppResult<()> {
        self.files.load()?;
        self.recover()
    }

    /// Moves the write position to the first unused entry of the last file.
    pub fn recover(&self) -> AppResult<()> {
        let Some(first) = self.files.first() else {
            return Ok(());
        };
        self.min_logical_offset
            .store(first.base_offset() / CQ_ENTRY_SIZE, Ordering::Release);

        let Some(last) = self.files.last() else {
            return Ok(());
        };
        let contents = last.raw_contents();
        let mut pos = 0u64;
        while pos + CQ_ENTRY_SIZE <= last.file_size() {
            let entry = CqEntry::decode(&contents[pos as usize..(pos + CQ_ENTRY_SIZE) as usize]);
            if entry.is_empty() {
                break;
            }
            pos += CQ_ENTRY_SIZE;
        }
        last.set_positions(pos);
        last.zero_from(pos).map_err(|e| {
            AppError::DiskFailure(format!(
                "zero consume queue tail {} error: {}",
                last.path().display(),
                e
            ))
        })?;
        debug!(
            "consume queue {}-{} recovered, max offset {}",
            self.topic,
            self.queue_id,
            self.max_offset()
        );
        Ok(())
    }

    /// Next queue offset to assign.
    pub fn max_offset(&self) -> u64 {
        self.files.max_offset() / CQ_ENTRY_SIZE
    }

    pub fn min_offset(&self) -> u64 {
        let first_file = self.files.min_offset() / CQ_ENTRY_SIZE;
        self.min_logical_offset
            .load(Ordering::Acquire)
            .max(first_file)
            .min(self.max_offset())
    }

    /// Makes sure the file that will hold the next entry exists.
    pub fn reserve(&self) -> AppResult<()> {
        let pos = self.files.max_offset();
        self.files.last_or_create(pos).map(|_| ())
    }

    /// Appends an entry, returns its queue offset.
    pub fn put(&self, commit_log_offset: u64, size: u32, tag: u64) -> AppResult<u64> {
        let queue_offset = self.max_offset();
        self.append_entry(
            queue_offset,
            CqEntry {
                commit_log_offset,
                size,
                tag,
            },
        )?;
        Ok(queue_offset)
    }

    /// Writes `entry` at `queue_offset`, which must be the next offset of the
    /// queue. An empty queue may start at any offset.
    pub fn append_entry(&self, queue_offset: u64, entry: CqEntry) -> AppResult<()> {
        if entry.is_empty() {
            return Err(AppError::ParameterError(format!(
                "empty entry for {}-{} at {}",
                self.topic, self.queue_id, queue_offset
            )));
        }
        let pos = queue_offset * CQ_ENTRY_SIZE;
        let file = if self.files.is_empty() {
            let file = self.files.last_or_create(pos)?;
            if pos > file.base_offset() {
                file.set_positions(pos - file.base_offset());
                self.min_logical_offset
                    .store(queue_offset, Ordering::Release);
            }
            file
        } else {
            let expected = self.max_offset();
            if queue_offset != expected {
                return Err(AppError::IllegalState(format!(
                    "consume queue {}-{} expects offset {}, got {}",
                    self.topic, self.queue_id, expected, queue_offset
                )));
            }
            self.files.last_or_create(pos)?
        };
        file.append(&entry.encode()).ok_or_else(|| {
            AppError::IllegalState(format!(
                "consume queue file {} has no room at {}",
                file.path().display(),
                pos
            ))
        })?;
        Ok(())
    }

    /// Entry at `queue_offset` if it was written, ignoring the retention mark.
    pub fn entry_at(&self, queue_offset: u64) -> Option<CqEntry> {
        let pos = queue_offset * CQ_ENTRY_SIZE;
        let file = self.files.find_by_offset(pos)?;
        let slice = file.select(pos - file.base_offset(), CQ_ENTRY_SIZE)?;
        let entry = CqEntry::decode(&slice);
        (!entry.is_empty()).then_some(entry)
    }

    pub fn get_entry(&self, queue_offset: i64) -> AppResult<CqEntry> {
        let invalid = || {
            AppError::OffsetInvalid(format!(
                "{}-{} offset {} not in [{}, {})",
                self.topic,
                self.queue_id,
                queue_offset,
                self.min_offset(),
                self.max_offset()
            ))
        };
        if queue_offset < 0 {
            return Err(invalid());
        }
        let queue_offset = queue_offset as u64;
        if queue_offset >= self.max_offset() || queue_offset < self.min_offset() {
            return Err(invalid());
        }
        self.entry_at(queue_offset).ok_or_else(invalid)
    }

    /// Drops trailing entries whose record ends after `max_commit_log_offset`.
    pub fn truncate_dirty(&self, max_commit_log_offset: u64) -> AppResult<()> {
        let max = self.max_offset();
        let mut keep = max;
        while keep > self.min_offset() {
            match self.entry_at(keep - 1) {
                Some(entry) if entry.end_offset() > max_commit_log_offset => keep -= 1,
                _ => break,
            }
        }
        if keep < max {
            warn!(
                "consume queue {}-{} drops offsets [{}, {}) beyond commit log end {}",
                self.topic, self.queue_id, keep, max, max_commit_log_offset
            );
            self.truncate_to(keep)?;
        }
        Ok(())
    }

    /// Drops every entry at or after `queue_offset`.
    pub fn truncate_to(&self, queue_offset: u64) -> AppResult<()> {
        if queue_offset <= self.min_offset() {
            return self.reset();
        }
        self.files.truncate_dirty(queue_offset * CQ_ENTRY_SIZE)
    }

    /// Deletes all files, the next append starts the queue afresh.
    pub fn reset(&self) -> AppResult<()> {
        self.files.destroy_all()?;
        self.min_logical_offset.store(0, Ordering::Release);
        Ok(())
    }

    /// Deletes leading files whose entries all point below
    /// `min_commit_log_offset`, then moves the minimum offset past every such
    /// entry.
    pub fn delete_expired(&self, min_commit_log_offset: u64) -> AppResult<usize> {
        let deleted = self.files.delete_leading_while(|file| {
            let contents = file.raw_contents();
            let last = (file.file_size() - CQ_ENTRY_SIZE) as usize;
            let entry = CqEntry::decode(&contents[last..last + CQ_ENTRY_SIZE as usize]);
            entry.end_offset() <= min_commit_log_offset
        })?;
        self.correct_min_offset(min_commit_log_offset);
        if !deleted.is_empty() {
            info!(
                "consume queue {}-{} deleted {} files, min offset now {}",
                self.topic,
                self.queue_id,
                deleted.len(),
                self.min_offset()
            );
        }
        Ok(deleted.len())
    }

    /// Moves the minimum offset to the first entry of the first file that
    /// points at or after `min_commit_log_offset`.
    pub fn correct_min_offset(&self, min_commit_log_offset: u64) {
        let Some(first) = self.files.first() else {
            return;
        };
        let base = first.base_offset() / CQ_ENTRY_SIZE;
        let count = first.committed_pos() / CQ_ENTRY_SIZE;
        let contents = first.raw_contents();
        let entry = |i: u64| {
            let pos = (i * CQ_ENTRY_SIZE) as usize;
            CqEntry::decode(&contents[pos..pos + CQ_ENTRY_SIZE as usize])
        };

        // commit log offsets grow with the queue offset
        let (mut lo, mut hi) = (0u64, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let e = entry(mid);
            if e.is_empty() || e.commit_log_offset < min_commit_log_offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.min_logical_offset
            .fetch_max(base + lo, Ordering::AcqRel);
    }

    pub fn flush(&self) -> AppResult<()> {
        self.files.flush().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DirCreateRequestListener;
    use rstest::{fixture, rstest};
    use tempfile::{tempdir, TempDir};

    #[fixture]
    fn root() -> TempDir {
        tempdir().expect("temp dir")
    }

    fn queue(root: &TempDir, entries_per_file: u64) -> ConsumeQueue {
        let listener = Arc::new(DirCreateRequestListener::new(
            root.path(),
            entries_per_file * CQ_ENTRY_SIZE,
        ));
        ConsumeQueue::new(
            "orders",
            0,
            root.path().join("orders").join("0"),
            entries_per_file,
            listener,
        )
    }

    #[rstest]
    fn test_put_and_get(root: TempDir) -> AppResult<()> {
        let cq = queue(&root, 4);
        for i in 0..10u64 {
            assert_eq!(cq.put(i * 100, 100, i)?, i);
        }
        assert_eq!(cq.max_offset(), 10);
        assert_eq!(cq.min_offset(), 0);

        let entry = cq.get_entry(7)?;
        assert_eq!(entry.commit_log_offset, 700);
        assert_eq!(entry.size, 100);
        assert_eq!(entry.tag, 7);

        // three files of four entries each
        assert!(root.path().join("orders/0/00000000000000000160").exists());
        Ok(())
    }

    #[rstest]
    #[case(-1)]
    #[case(10)]
    #[case(11)]
    fn test_get_entry_out_of_bounds(root: TempDir, #[case] offset: i64) -> AppResult<()> {
        let cq = queue(&root, 4);
        for i in 0..10u64 {
            cq.put(i * 100, 100, 0)?;
        }
        assert!(matches!(
            cq.get_entry(offset),
            Err(AppError::OffsetInvalid(_))
        ));
        Ok(())
    }

    #[rstest]
    fn test_recover_finds_last_entry(root: TempDir) -> AppResult<()> {
        {
            let cq = queue(&root, 4);
            for i in 0..6u64 {
                cq.put(i * 10, 10, 0)?;
            }
            cq.flush()?;
        }
        let cq = queue(&root, 4);
        cq.load()?;
        assert_eq!(cq.max_offset(), 6);
        assert_eq!(cq.put(60, 10, 0)?, 6);
        Ok(())
    }

    #[rstest]
    fn test_truncate_dirty(root: TempDir) -> AppResult<()> {
        let cq = queue(&root, 4);
        for i in 0..6u64 {
            cq.put(i * 10, 10, 0)?;
        }
        cq.truncate_dirty(35)?;
        assert_eq!(cq.max_offset(), 3);
        assert!(cq.get_entry(3).is_err());
        assert_eq!(cq.put(30, 5, 0)?, 3);
        Ok(())
    }

    #[rstest]
    fn test_empty_queue_starts_anywhere(root: TempDir) -> AppResult<()> {
        let cq = queue(&root, 4);
        cq.append_entry(
            5,
            CqEntry {
                commit_log_offset: 500,
                size: 10,
                tag: 0,
            },
        )?;
        assert_eq!(cq.min_offset(), 5);
        assert_eq!(cq.max_offset(), 6);
        assert_eq!(cq.get_entry(5)?.commit_log_offset, 500);
        assert!(cq.get_entry(4).is_err());

        // later appends must follow
        let gap = CqEntry {
            commit_log_offset: 700,
            size: 10,
            tag: 0,
        };
        assert!(cq.append_entry(7, gap).is_err());
        Ok(())
    }

    #[rstest]
    fn test_delete_expired_moves_min_offset(root: TempDir) -> AppResult<()> {
        let cq = queue(&root, 4);
        for i in 0..10u64 {
            cq.put(i * 10, 10, 0)?;
        }
        // entries 0..=5 point below 60
        assert_eq!(cq.delete_expired(60)?, 1);
        assert_eq!(cq.min_offset(), 6);
        assert!(matches!(cq.get_entry(5), Err(AppError::OffsetInvalid(_))));
        assert_eq!(cq.get_entry(6)?.commit_log_offset, 60);
        Ok(())
    }
}
