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

//! Storage engine of the broker.
//!
//! This module provides:
//! - Fixed size memory mapped segments and ordered segment queues
//! - The global commit log and its record format
//! - Per topic/queue consume queues indexing the commit log
//! - Sync and async flush policies
//! - Startup recovery of a possibly torn commit log tail
//! - Delayed message scheduling
//!
//! `MessageStore` wires the pieces together and is the only entry point the
//! request processors need.

mod checkpoint;
mod commit_log;
mod consume_queue;
mod consume_queue_store;
mod delay;
mod flush;
mod mapped_file;
mod mapped_file_queue;
mod message_store;
mod record;
mod recovery;

use bytes::Bytes;

pub use checkpoint::{CheckPointFile, StoreCheckpoint};
pub use commit_log::{AppendResult, CommitLog, CommitLogDispatcher, DispatchRequest};
pub use consume_queue::{ConsumeQueue, CqEntry, CQ_ENTRY_SIZE};
pub use consume_queue_store::{ConsumeQueueStore, DirCreateRequestListener, TopicQueue};
pub use delay::{DelayBuckets, DelayLevels, DelayScheduler, DELAY_TOPIC};
pub use flush::{AsyncFlushService, FlushDiskService, SyncFlushService};
pub use mapped_file::{MappedFile, SegmentSlice};
pub use mapped_file_queue::{DirSegmentAllocator, MappedFileQueue, SegmentAllocator};
pub use message_store::{GetMessageResult, MessageStore, PutMessageResult};
pub use record::{
    decode as decode_record, DecodeOutcome, DelayEnvelope, StoredRecord, BLANK_MAGIC,
    END_MARKER_LEN, MESSAGE_MAGIC, RECORD_FIXED_LEN,
};
pub use recovery::{RecoveryReport, RecoveryService, RecoveryState};

use crate::AppResult;

/// Outcome code of an append, surfaced to the produce request processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResponseType {
    ParameterError,
    NoEnoughSpace,
    StoreOk,
}

/// Outcome code of a pull, surfaced to the pull request processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResultType {
    Done,
    NoMessage,
    OffsetInvalid,
    Error,
}

/// A message read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub topic: String,
    pub queue_id: u32,
    pub queue_offset: u64,
    pub commit_log_offset: u64,
    pub size: u32,
    pub store_timestamp: u64,
    pub delay_level: i32,
    pub body: Bytes,
}

/// Supplies the backing file of a consume queue.
///
/// Called with the sequence number (`index`) of the file the queue needs next;
/// the first file of a queue has index 0. Implementations decide paths and
/// naming, the returned segment must have base offset
/// `index * file_size`.
pub trait CreateRequestListener: Send + Sync + std::fmt::Debug {
    fn on_require_create(&self, topic: &str, queue_id: u32, index: u64) -> AppResult<MappedFile>;
}

/// Notified when the commit log byte range `[offset, offset + size)` is
/// confirmed, either durable after a flush or validated during recovery.
pub trait RecoveryListener: Send + Sync {
    fn on_update_offset(&self, offset: u64, size: u32);
}

/// Notified synchronously after a delayed record has been appended and
/// indexed in its delay bucket.
pub trait DelayMessageCommitListener: Send + Sync {
    fn on_commit(
        &self,
        commit_log_offset: u64,
        queue_offset: u64,
        topic: &str,
        queue_id: u32,
        delay: i32,
    );
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// File name of a segment with the given base offset.
pub(crate) fn segment_file_name(base_offset: u64) -> String {
    format!("{:020}", base_offset)
}
