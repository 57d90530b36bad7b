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

//! Startup recovery of the commit log and consume queues.
//!
//! Recovery runs in three steps:
//! 1. Scan the commit log from the checkpoint and find the end of valid
//!    records. Everything after it is zeroed or deleted.
//! 2. Drop consume queue entries pointing past that end.
//! 3. Replay the scanned records through the reindex listener so every
//!    record has its consume queue entry.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::commit_log::CommitLog;
use super::consume_queue::CqEntry;
use super::consume_queue_store::ConsumeQueueStore;
use super::delay::DELAY_TOPIC;
use super::mapped_file::MappedFile;
use super::mapped_file_queue::MappedFileQueue;
use super::record::{self, DecodeOutcome, DelayEnvelope};
use super::RecoveryListener;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Scanning,
    /// the log ended cleanly
    Valid,
    /// a corrupt or torn tail was cut off
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub state: RecoveryState,
    /// commit log offset the scan started at
    pub start_offset: u64,
    /// end of the last valid record
    pub end_offset: u64,
    pub records_scanned: u64,
    /// consume queue entries written during replay
    pub entries_rebuilt: u64,
    /// non zero bytes discarded after the valid end
    pub truncated_bytes: u64,
}

/// Restores the consume queue entry of every replayed record.
struct ConsumeQueueReindexer {
    files: Arc<MappedFileQueue>,
    consume_queues: Arc<ConsumeQueueStore>,
    /// restart gapped queues at the record's offset instead of reporting
    force: AtomicBool,
    gap_detected: AtomicBool,
    rebuilt: AtomicU64,
    failure: Mutex<Option<AppError>>,
}

impl ConsumeQueueReindexer {
    fn reindex(&self, offset: u64, size: u32) -> AppResult<()> {
        let segment = self.files.find_by_offset(offset).ok_or_else(|| {
            AppError::OffsetOutOfRange(format!("no commit log segment holds {}", offset))
        })?;
        let slice = segment
            .select(offset - segment.base_offset(), size as u64)
            .ok_or_else(|| {
                AppError::OffsetOutOfRange(format!("commit log range at {} not readable", offset))
            })?;
        let record = match record::decode(&slice, false) {
            DecodeOutcome::Record(record) => record,
            other => {
                return Err(AppError::CorruptionDetected(format!(
                    "replay expected a record at {}, found {:?}",
                    offset, other
                )))
            }
        };
        drop(slice);

        let tag = if record.topic == DELAY_TOPIC {
            DelayEnvelope::decode(record.body.clone())?.due_timestamp
        } else {
            record.store_timestamp
        };
        let entry = CqEntry {
            commit_log_offset: offset,
            size,
            tag,
        };
        let queue = self
            .consume_queues
            .find_or_create(&record.topic, record.queue_id);
        let queue_offset = record.queue_offset;
        let max = queue.max_offset();

        if queue_offset < max {
            if queue_offset < queue.min_offset() {
                return Ok(());
            }
            if queue.entry_at(queue_offset) == Some(entry) {
                return Ok(());
            }
            warn!(
                "consume queue {}-{} entry {} does not match commit log offset {}, rebuilding",
                record.topic, record.queue_id, queue_offset, offset
            );
            queue.truncate_to(queue_offset)?;
        } else if queue_offset > max {
            if !self.force.load(Ordering::Acquire) {
                debug!(
                    "consume queue {}-{} has gap [{}, {})",
                    record.topic, record.queue_id, max, queue_offset
                );
                self.gap_detected.store(true, Ordering::Release);
                return Ok(());
            }
            warn!(
                "consume queue {}-{} restarts at {}, offsets [{}, {}) are lost",
                record.topic, record.queue_id, queue_offset, max, queue_offset
            );
            queue.reset()?;
        }
        queue.append_entry(queue_offset, entry)?;
        self.rebuilt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl RecoveryListener for ConsumeQueueReindexer {
    fn on_update_offset(&self, offset: u64, size: u32) {
        if let Err(e) = self.reindex(offset, size) {
            error!("reindex of commit log offset {} failed: {}", offset, e);
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(e);
            }
        }
    }
}

pub struct RecoveryService {
    files: Arc<MappedFileQueue>,
    consume_queues: Arc<ConsumeQueueStore>,
    reindexer: ConsumeQueueReindexer,
    state: RecoveryState,
}

impl fmt::Debug for RecoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryService")
            .field("files", &self.files)
            .field("state", &self.state)
            .finish()
    }
}

/// Where phase one stopped.
struct ScanEnd {
    end_offset: u64,
    records: u64,
    corrupt: bool,
    truncated_bytes: u64,
}

impl RecoveryService {
    pub fn new(commit_log: &CommitLog, consume_queues: Arc<ConsumeQueueStore>) -> Self {
        let files = Arc::clone(commit_log.files());
        Self {
            reindexer: ConsumeQueueReindexer {
                files: Arc::clone(&files),
                consume_queues: Arc::clone(&consume_queues),
                force: AtomicBool::new(false),
                gap_detected: AtomicBool::new(false),
                rebuilt: AtomicU64::new(0),
                failure: Mutex::new(None),
            },
            files,
            consume_queues,
            state: RecoveryState::Scanning,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Recovers from `checkpoint`, the offset up to which both the commit log
    /// and the consume queues are known to be durable.
    pub fn recover(&mut self, checkpoint: Option<u64>) -> AppResult<RecoveryReport> {
        self.state = RecoveryState::Scanning;
        let segments = self.files.segments();
        if segments.is_empty() {
            self.consume_queues.truncate_dirty(0)?;
            self.state = RecoveryState::Valid;
            info!("commit log is empty, nothing to recover");
            return Ok(RecoveryReport {
                state: self.state,
                start_offset: 0,
                end_offset: 0,
                records_scanned: 0,
                entries_rebuilt: 0,
                truncated_bytes: 0,
            });
        }

        let start_index = checkpoint
            .and_then(|offset| {
                segments.iter().position(|s| {
                    s.base_offset() <= offset && offset < s.base_offset() + s.file_size()
                })
            })
            .unwrap_or(0);
        let start_offset = segments[start_index].base_offset();
        info!(
            "recovering commit log from segment {} (checkpoint {:?})",
            start_offset, checkpoint
        );

        let scan = Self::scan(&segments[start_index..])?;
        if scan.corrupt || scan.truncated_bytes > 0 {
            warn!(
                "commit log truncated at {}, {} bytes discarded",
                scan.end_offset, scan.truncated_bytes
            );
        }
        self.files.truncate_dirty(scan.end_offset)?;
        self.consume_queues.truncate_dirty(scan.end_offset)?;

        self.reindexer
            .force
            .store(start_index == 0, Ordering::Release);
        self.replay(start_offset, scan.end_offset)?;
        if self.reindexer.gap_detected.swap(false, Ordering::AcqRel) && start_index > 0 {
            warn!("consume queue gap found, replaying the whole commit log");
            self.reindexer.force.store(true, Ordering::Release);
            self.replay(segments[0].base_offset(), scan.end_offset)?;
        }
        if let Some(e) = self.reindexer.failure.lock().take() {
            return Err(e);
        }

        self.state = if scan.corrupt || scan.truncated_bytes > 0 {
            RecoveryState::Truncated
        } else {
            RecoveryState::Valid
        };
        let report = RecoveryReport {
            state: self.state,
            start_offset,
            end_offset: scan.end_offset,
            records_scanned: scan.records,
            entries_rebuilt: self.reindexer.rebuilt.load(Ordering::Acquire),
            truncated_bytes: scan.truncated_bytes,
        };
        info!("recovery finished: {:?}", report);
        Ok(report)
    }

    fn scan(segments: &[Arc<MappedFile>]) -> AppResult<ScanEnd> {
        let mut records = 0;
        for (i, segment) in segments.iter().enumerate() {
            let contents = segment.raw_contents();
            let mut pos = 0usize;
            let stop = loop {
                if pos >= contents.len() {
                    break None;
                }
                match record::decode(&contents[pos..], true) {
                    DecodeOutcome::Record(record) => {
                        pos += record.total_size as usize;
                        records += 1;
                    }
                    DecodeOutcome::EndOfSegment => break None,
                    DecodeOutcome::EndOfData => break Some(false),
                    DecodeOutcome::Corrupt(reason) => {
                        warn!(
                            "corrupt record at {} in segment {}: {}",
                            segment.base_offset() + pos as u64,
                            segment.path().display(),
                            reason
                        );
                        break Some(true);
                    }
                }
            };

            let is_last = i + 1 == segments.len();
            if let Some(corrupt) = stop {
                let mut truncated_bytes = contents[pos..]
                    .iter()
                    .rposition(|b| *b != 0)
                    .map(|last| last as u64 + 1)
                    .unwrap_or(0);
                truncated_bytes += segments[i + 1..]
                    .iter()
                    .map(|s| written_len(s))
                    .sum::<u64>();
                return Ok(ScanEnd {
                    end_offset: segment.base_offset() + pos as u64,
                    records,
                    corrupt,
                    truncated_bytes,
                });
            }
            if is_last {
                return Ok(ScanEnd {
                    end_offset: segment.base_offset() + segment.file_size(),
                    records,
                    corrupt: false,
                    truncated_bytes: 0,
                });
            }
        }
        Err(AppError::IllegalState(
            "recovery scan without segments".to_string(),
        ))
    }

    /// Feeds every record in `[from, to)` to the reindex listener.
    fn replay(&self, from: u64, to: u64) -> AppResult<()> {
        let mut offset = from;
        while offset < to {
            let segment = self.files.find_by_offset(offset).ok_or_else(|| {
                AppError::IllegalState(format!("replay offset {} has no segment", offset))
            })?;
            let pos = (offset - segment.base_offset()) as usize;
            match record::decode(&segment.raw_contents()[pos..], false) {
                DecodeOutcome::Record(record) => {
                    self.reindexer
                        .on_update_offset(offset, record.total_size);
                    offset += record.total_size as u64;
                }
                DecodeOutcome::EndOfSegment => {
                    offset = segment.base_offset() + segment.file_size();
                }
                other => {
                    return Err(AppError::IllegalState(format!(
                        "replay found {:?} at {} before the valid end {}",
                        other, offset, to
                    )))
                }
            }
        }
        Ok(())
    }
}

fn written_len(segment: &MappedFile) -> u64 {
    segment
        .raw_contents()
        .iter()
        .rposition(|b| *b != 0)
        .map(|last| last as u64 + 1)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        CommitLogDispatcher, DelayLevels, DispatchRequest, StoreCheckpoint, CQ_ENTRY_SIZE,
    };
    use crate::{FlushMode, StoreConfig};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::{tempdir, TempDir};

    struct QueueDispatcher {
        queues: Arc<ConsumeQueueStore>,
    }

    impl CommitLogDispatcher for QueueDispatcher {
        fn next_queue_offset(&self, topic: &str, queue_id: u32) -> AppResult<u64> {
            let queue = self.queues.find_or_create(topic, queue_id);
            queue.reserve()?;
            Ok(queue.max_offset())
        }

        fn dispatch(&self, request: &DispatchRequest) -> AppResult<()> {
            self.queues
                .append_entry(
                    &request.topic,
                    request.queue_id,
                    request.commit_log_offset,
                    request.size,
                    request.tag,
                )
                .map(|_| ())
        }
    }

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            root_dir: dir.path().to_path_buf(),
            commit_log_segment_size: 512,
            consume_queue_entries_per_file: 8,
            flush_mode: FlushMode::Sync,
            ..Default::default()
        }
    }

    async fn open(config: &StoreConfig) -> AppResult<(CommitLog, Arc<ConsumeQueueStore>)> {
        let queues = Arc::new(ConsumeQueueStore::with_dir_layout(
            config.consume_queue_dir(),
            config.consume_queue_entries_per_file,
        ));
        queues.load()?;
        let dispatcher = Arc::new(QueueDispatcher {
            queues: Arc::clone(&queues),
        });
        let checkpoint = Arc::new(StoreCheckpoint::load(config.checkpoint_path()).await?);
        let log = CommitLog::new(config, Arc::new(DelayLevels::default()), dispatcher, checkpoint);
        log.load()?;
        Ok((log, queues))
    }

    #[tokio::test]
    async fn test_clean_log_is_valid() -> AppResult<()> {
        let dir = tempdir()?;
        let config = config(&dir);
        let end = {
            let (log, _) = open(&config).await?;
            for i in 0..5 {
                log.append("orders", 0, format!("m{}", i).as_bytes(), 0)?;
            }
            log.max_offset()
        };

        let (log, queues) = open(&config).await?;
        let report = RecoveryService::new(&log, Arc::clone(&queues)).recover(None)?;
        assert_eq!(report.state, RecoveryState::Valid);
        assert_eq!(report.end_offset, end);
        assert_eq!(report.records_scanned, 5);
        assert_eq!(report.entries_rebuilt, 0);
        assert_eq!(log.max_offset(), end);
        assert_eq!(queues.get_max_offset("orders", 0), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() -> AppResult<()> {
        let dir = tempdir()?;
        let config = config(&dir);
        let (valid_end, torn_at) = {
            let (log, _) = open(&config).await?;
            log.append("orders", 0, b"first", 0)?;
            let second = log.append("orders", 0, b"second", 0)?;
            let third = log.append("orders", 0, b"third", 0)?;
            (
                second.commit_log_offset + second.size as u64,
                third.commit_log_offset + 20,
            )
        };

        // tear the last record: keep its header, zero the rest
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(config.commit_log_dir().join("00000000000000000000"))?;
        file.seek(SeekFrom::Start(torn_at))?;
        file.write_all(&[0u8; 16])?;
        file.sync_all()?;

        let (log, queues) = open(&config).await?;
        let report = RecoveryService::new(&log, Arc::clone(&queues)).recover(None)?;
        assert_eq!(report.state, RecoveryState::Truncated);
        assert_eq!(report.end_offset, valid_end);
        assert!(report.truncated_bytes > 0);
        assert_eq!(log.max_offset(), valid_end);
        assert_eq!(log.files().last().map(|s| s.write_pos()), Some(valid_end));
        assert_eq!(queues.get_max_offset("orders", 0), 2);
        assert!(queues.get_entry("orders", 0, 2).is_err());

        let next = log.append("orders", 0, b"again", 0)?;
        assert_eq!(next.commit_log_offset, valid_end);
        assert_eq!(next.queue_offset, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_consume_queue_is_rebuilt() -> AppResult<()> {
        let dir = tempdir()?;
        let config = config(&dir);
        {
            let (log, _) = open(&config).await?;
            for i in 0..12 {
                log.append("orders", (i % 2) as u32, format!("m{}", i).as_bytes(), 0)?;
            }
        }
        std::fs::remove_dir_all(config.consume_queue_dir())?;

        let (log, queues) = open(&config).await?;
        let report = RecoveryService::new(&log, Arc::clone(&queues)).recover(None)?;
        assert_eq!(report.entries_rebuilt, 12);
        assert_eq!(queues.get_max_offset("orders", 0), 6);
        assert_eq!(queues.get_max_offset("orders", 1), 6);
        for offset in 0..6 {
            let entry = queues.get_entry("orders", 1, offset)?;
            let record = log.lookup_record(entry.commit_log_offset, entry.size)?;
            assert_eq!(record.queue_offset, offset as u64);
            assert_eq!(record.queue_id, 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_gap_after_checkpoint_rescans_from_first_segment() -> AppResult<()> {
        let dir = tempdir()?;
        let config = config(&dir);
        let checkpoint = {
            let (log, _) = open(&config).await?;
            // several segments of 512 bytes
            for i in 0..20 {
                log.append("orders", 0, format!("message-{:03}", i).as_bytes(), 0)?;
            }
            log.max_offset() - 1
        };
        // the consume queue lost everything, the checkpoint claims it is durable
        std::fs::remove_dir_all(config.consume_queue_dir())?;

        let (log, queues) = open(&config).await?;
        let report = RecoveryService::new(&log, Arc::clone(&queues)).recover(Some(checkpoint))?;
        assert!(report.start_offset > 0);
        assert_eq!(report.entries_rebuilt, 20);
        assert_eq!(queues.get_max_offset("orders", 0), 20);
        assert_eq!(queues.get_min_offset("orders", 0), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_dirty_consume_queue_entries_are_dropped() -> AppResult<()> {
        let dir = tempdir()?;
        let config = config(&dir);
        let end = {
            let (log, queues) = open(&config).await?;
            log.append("orders", 0, b"one", 0)?;
            let end = log.max_offset();
            // an index entry whose record never reached the log
            queues.append_entry("orders", 0, end, 64, 0)?;
            end
        };

        let (log, queues) = open(&config).await?;
        let report = RecoveryService::new(&log, Arc::clone(&queues)).recover(None)?;
        assert_eq!(report.end_offset, end);
        assert_eq!(queues.get_max_offset("orders", 0), 1);
        let cq_file = config
            .consume_queue_dir()
            .join("orders/0/00000000000000000000");
        assert_eq!(
            std::fs::metadata(cq_file)?.len(),
            8 * CQ_ENTRY_SIZE
        );
        Ok(())
    }
}
