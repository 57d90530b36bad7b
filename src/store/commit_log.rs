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

//! The global append-only commit log.
//!
//! All topics and queues share one log. Appends are serialized by a single
//! mutex that also covers the flush policy and the consume queue dispatch, so
//! queue offsets are gap free and an index entry never points at bytes a
//! reader can not see yet. Reads take no lock beyond the segment lookup.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use super::delay::{DelayLevels, DELAY_TOPIC};
use super::flush::{AsyncFlushService, FlushDiskService, SyncFlushService};
use super::mapped_file::SegmentSlice;
use super::mapped_file_queue::{DirSegmentAllocator, MappedFileQueue};
use super::record::{self, DecodeOutcome, DelayEnvelope, StoredRecord, END_MARKER_LEN};
use super::{now_millis, RecoveryListener};
use crate::{AppError, AppResult, FlushMode, StoreConfig};

/// Where an appended record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    pub commit_log_offset: u64,
    pub queue_offset: u64,
    pub size: u32,
    pub store_timestamp: u64,
    /// topic and queue the record was indexed under, the delay topic for
    /// delayed messages
    pub topic: String,
    pub queue_id: u32,
}

/// Index entry handed to the dispatcher for every appended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: u32,
    pub commit_log_offset: u64,
    pub size: u32,
    pub queue_offset: u64,
    pub tag: u64,
    pub delay_level: i32,
    pub store_timestamp: u64,
}

/// Builds the consume queue entries of appended records.
///
/// Both calls run under the append lock.
pub trait CommitLogDispatcher: Send + Sync {
    /// Next queue offset of the queue. Must also make sure the next entry can
    /// be written, so that `dispatch` does not fail after the record is in
    /// the log.
    fn next_queue_offset(&self, topic: &str, queue_id: u32) -> AppResult<u64>;

    fn dispatch(&self, request: &DispatchRequest) -> AppResult<()>;
}

/// Rejects topics that are empty, too long or contain characters other than
/// `[A-Za-z0-9_%-]`.
pub(crate) fn validate_topic(topic: &str, max_length: usize) -> AppResult<()> {
    if topic.is_empty() {
        return Err(AppError::ParameterError("topic is empty".to_string()));
    }
    if topic.len() > max_length {
        return Err(AppError::ParameterError(format!(
            "topic length {} exceeds {}",
            topic.len(),
            max_length
        )));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '%')))
    {
        return Err(AppError::ParameterError(format!(
            "topic {} contains illegal character {:?}",
            topic, c
        )));
    }
    Ok(())
}

pub struct CommitLog {
    files: Arc<MappedFileQueue>,
    segment_size: u64,
    max_message_size: usize,
    max_topic_length: usize,
    delay_levels: Arc<DelayLevels>,
    dispatcher: Arc<dyn CommitLogDispatcher>,
    flush_service: Arc<dyn FlushDiskService>,
    async_flush_service: Option<Arc<AsyncFlushService>>,
    put_lock: Mutex<()>,
    /// end of the last record whose index entry was dispatched
    confirm_offset: AtomicU64,
    closed: AtomicBool,
}

impl fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitLog")
            .field("dir", &self.files.dir())
            .field("segment_size", &self.segment_size)
            .field("max_offset", &self.max_offset())
            .field("confirm_offset", &self.confirm_offset())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CommitLog {
    pub fn new(
        config: &StoreConfig,
        delay_levels: Arc<DelayLevels>,
        dispatcher: Arc<dyn CommitLogDispatcher>,
        flush_listener: Arc<dyn RecoveryListener>,
    ) -> Self {
        let dir = config.commit_log_dir();
        let allocator = Arc::new(DirSegmentAllocator::new(
            dir.clone(),
            config.commit_log_segment_size,
        ));
        let files = Arc::new(MappedFileQueue::new(
            dir,
            config.commit_log_segment_size,
            config.commit_log_max_segments,
            allocator,
        ));

        let mut async_flush_service = None;
        let flush_service: Arc<dyn FlushDiskService> = match config.flush_mode {
            FlushMode::Sync => Arc::new(SyncFlushService::new(Arc::clone(&files), flush_listener)),
            FlushMode::Async => {
                let service = Arc::new(AsyncFlushService::new(
                    Arc::clone(&files),
                    flush_listener,
                    Duration::from_millis(config.flush_interval_ms),
                    config.flush_dirty_threshold_bytes,
                ));
                async_flush_service = Some(Arc::clone(&service));
                service
            }
        };

        Self {
            files,
            segment_size: config.commit_log_segment_size,
            max_message_size: config.max_message_size,
            max_topic_length: config.max_topic_length,
            delay_levels,
            dispatcher,
            flush_service,
            async_flush_service,
            put_lock: Mutex::new(()),
            confirm_offset: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn load(&self) -> AppResult<()> {
        self.files.load()
    }

    pub(crate) fn files(&self) -> &Arc<MappedFileQueue> {
        &self.files
    }

    /// Background flush task, only present in async mode.
    pub fn async_flush_service(&self) -> Option<Arc<AsyncFlushService>> {
        self.async_flush_service.clone()
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Appends a message and indexes it.
    ///
    /// Messages with a positive `delay_level` are wrapped in a delay envelope
    /// and indexed in the bucket of their level instead of their own queue.
    pub fn append(
        &self,
        topic: &str,
        queue_id: u32,
        body: &[u8],
        delay_level: i32,
    ) -> AppResult<AppendResult> {
        validate_topic(topic, self.max_topic_length)?;
        if topic == DELAY_TOPIC {
            return Err(AppError::ParameterError(format!(
                "topic {} is reserved",
                DELAY_TOPIC
            )));
        }
        if body.is_empty() {
            return Err(AppError::ParameterError("message body is empty".to_string()));
        }
        if body.len() > self.max_message_size {
            return Err(AppError::ParameterError(format!(
                "message body of {} bytes exceeds {}",
                body.len(),
                self.max_message_size
            )));
        }
        if delay_level < 0 {
            return Err(AppError::ParameterError(format!(
                "negative delay level {}",
                delay_level
            )));
        }

        let _guard = self.put_lock.lock();
        if self.is_closed() {
            return Err(AppError::ServiceNotAvailable(
                "commit log is shut down".to_string(),
            ));
        }

        let store_timestamp = now_millis();
        let envelope;
        let (stored_topic, stored_queue_id, payload, tag, level) = if delay_level > 0 {
            let level = self.delay_levels.clamp(delay_level);
            let due_timestamp =
                store_timestamp.saturating_add(self.delay_levels.delay_millis(level));
            envelope = DelayEnvelope::encode(topic, queue_id, due_timestamp, body);
            (
                DELAY_TOPIC,
                (level - 1) as u32,
                &envelope[..],
                due_timestamp,
                level,
            )
        } else {
            (topic, queue_id, body, store_timestamp, 0)
        };

        let total_size = record::record_size(stored_topic.len(), payload.len()) as u64;
        if total_size + END_MARKER_LEN as u64 > self.segment_size {
            return Err(AppError::ParameterError(format!(
                "record of {} bytes does not fit a segment of {}",
                total_size, self.segment_size
            )));
        }

        let queue_offset = self
            .dispatcher
            .next_queue_offset(stored_topic, stored_queue_id)?;
        let record = record::encode(
            stored_topic,
            stored_queue_id,
            queue_offset,
            store_timestamp,
            level,
            payload,
        );

        let mut segment = self.files.last_or_create(0)?;
        if segment.write_pos() + total_size + END_MARKER_LEN as u64 > segment.file_size() {
            segment.seal();
            self.flush_service.flush_segment(&segment)?;
            debug!(
                "sealed commit log segment {}, rolling",
                segment.base_offset()
            );
            segment = self.files.last_or_create(0)?;
        }
        let pos = segment.append(&record).ok_or_else(|| {
            AppError::IllegalState(format!(
                "commit log segment {} rejected {} bytes at {}",
                segment.base_offset(),
                total_size,
                segment.write_pos()
            ))
        })?;
        let commit_log_offset = segment.base_offset() + pos;

        let request = DispatchRequest {
            topic: stored_topic.to_string(),
            queue_id: stored_queue_id,
            commit_log_offset,
            size: total_size as u32,
            queue_offset,
            tag,
            delay_level: level,
            store_timestamp,
        };
        if let Err(e) = self.dispatcher.dispatch(&request) {
            error!(
                "dispatch of commit log offset {} to {}-{} failed: {}",
                commit_log_offset, stored_topic, stored_queue_id, e
            );
            return Err(e);
        }
        self.confirm_offset
            .store(commit_log_offset + total_size, Ordering::Release);
        self.flush_service.on_appended(&segment, total_size)?;

        trace!(
            "appended {} bytes at {} for {}-{} queue offset {}",
            total_size,
            commit_log_offset,
            stored_topic,
            stored_queue_id,
            queue_offset
        );
        Ok(AppendResult {
            commit_log_offset,
            queue_offset,
            size: total_size as u32,
            store_timestamp,
            topic: request.topic,
            queue_id: stored_queue_id,
        })
    }

    /// Zero copy view of `size` committed bytes at `offset`.
    pub fn read(&self, offset: u64, size: u32) -> AppResult<SegmentSlice> {
        let out_of_range = || {
            AppError::OffsetOutOfRange(format!(
                "commit log range [{}, {}) not readable, log spans [{}, {})",
                offset,
                offset + size as u64,
                self.min_offset(),
                self.max_offset()
            ))
        };
        let segment = self.files.find_by_offset(offset).ok_or_else(out_of_range)?;
        let pos = offset - segment.base_offset();
        if pos + size as u64 > segment.file_size() {
            return Err(out_of_range());
        }
        segment.select(pos, size as u64).ok_or_else(out_of_range)
    }

    /// Reads and decodes the record at `offset`, checking its crc.
    pub fn lookup_record(&self, offset: u64, size: u32) -> AppResult<StoredRecord> {
        let slice = self.read(offset, size)?;
        match record::decode(&slice, true) {
            DecodeOutcome::Record(record) if record.total_size == size => Ok(record),
            DecodeOutcome::Record(record) => Err(AppError::CorruptionDetected(format!(
                "record at {} has size {}, index says {}",
                offset, record.total_size, size
            ))),
            DecodeOutcome::Corrupt(reason) => Err(AppError::CorruptionDetected(format!(
                "record at {}: {}",
                offset, reason
            ))),
            other => Err(AppError::CorruptionDetected(format!(
                "no record at {}: {:?}",
                offset, other
            ))),
        }
    }

    pub fn max_offset(&self) -> u64 {
        self.files.max_offset()
    }

    pub fn min_offset(&self) -> u64 {
        self.files.min_offset()
    }

    pub fn flushed_offset(&self) -> u64 {
        self.files.flushed_offset()
    }

    pub fn confirm_offset(&self) -> u64 {
        self.confirm_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_confirm_offset(&self, offset: u64) {
        self.confirm_offset.store(offset, Ordering::Release);
    }

    pub fn flush(&self) -> AppResult<u64> {
        self.flush_service.flush()
    }

    /// Deletes sealed segments older than `retention`, returns their base
    /// offsets.
    pub fn delete_expired_files(
        &self,
        retention: Duration,
        now: SystemTime,
    ) -> AppResult<Vec<u64>> {
        self.files.delete_expired_by_time(retention, now)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects further appends once in-flight appends finished.
    pub fn shutdown(&self) {
        let _guard = self.put_lock.lock();
        self.closed.store(true, Ordering::Release);
        info!("commit log closed for appends at offset {}", self.max_offset());
    }
}
