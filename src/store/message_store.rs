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

//! Storage root.
//!
//! `MessageStore` owns the commit log, the consume queues, the checkpoint and
//! the delay scheduler. `open` loads and recovers everything, `start` spawns
//! the background tasks:
//! - async flush of the commit log (async flush mode only)
//! - periodic checkpoint of flush watermarks
//! - retention cleanup
//! - delayed message redelivery
//!
//! `shutdown` stops the tasks, waits for them, closes the commit log and
//! persists the final state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use super::checkpoint::StoreCheckpoint;
use super::commit_log::{AppendResult, CommitLog, CommitLogDispatcher, DispatchRequest};
use super::consume_queue_store::ConsumeQueueStore;
use super::delay::{DelayBuckets, DelayLevels, DelayScheduler};
use super::recovery::{RecoveryReport, RecoveryService};
use super::{AcquireResultType, DelayMessageCommitListener, StoreResponseType, StoredMessage};
use crate::{AppError, AppResult, DelayConfig, Shutdown, StoreConfig};

/// Outcome of `put_message`.
#[derive(Debug)]
pub struct PutMessageResult {
    pub status: StoreResponseType,
    pub append: Option<AppendResult>,
    pub error: Option<AppError>,
}

impl PutMessageResult {
    pub fn is_ok(&self) -> bool {
        self.status == StoreResponseType::StoreOk
    }
}

/// Outcome of `get_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMessageResult {
    pub status: AcquireResultType,
    pub messages: Vec<StoredMessage>,
    /// queue offset the next pull should start at
    pub next_offset: u64,
    pub min_offset: u64,
    pub max_offset: u64,
}

/// Indexes appended records and reports delayed ones to the delay buckets.
struct StoreDispatcher {
    consume_queues: Arc<ConsumeQueueStore>,
    delay_listener: Arc<dyn DelayMessageCommitListener>,
}

impl CommitLogDispatcher for StoreDispatcher {
    fn next_queue_offset(&self, topic: &str, queue_id: u32) -> AppResult<u64> {
        let queue = self.consume_queues.find_or_create(topic, queue_id);
        queue.reserve()?;
        Ok(queue.max_offset())
    }

    fn dispatch(&self, request: &DispatchRequest) -> AppResult<()> {
        let queue_offset = self.consume_queues.append_entry(
            &request.topic,
            request.queue_id,
            request.commit_log_offset,
            request.size,
            request.tag,
        )?;
        if queue_offset != request.queue_offset {
            return Err(AppError::IllegalState(format!(
                "{}-{} indexed at {}, record carries {}",
                request.topic, request.queue_id, queue_offset, request.queue_offset
            )));
        }
        if request.delay_level > 0 {
            self.delay_listener.on_commit(
                request.commit_log_offset,
                queue_offset,
                &request.topic,
                request.queue_id,
                request.delay_level,
            );
        }
        Ok(())
    }
}

fn disk_failure(context: &str) -> impl FnOnce(AppError) -> AppError + '_ {
    move |e| match e {
        AppError::IoError(e) => AppError::DiskFailure(format!("{}: {}", context, e)),
        other => other,
    }
}

pub struct MessageStore {
    config: StoreConfig,
    delay_config: DelayConfig,
    commit_log: Arc<CommitLog>,
    consume_queues: Arc<ConsumeQueueStore>,
    checkpoint: Arc<StoreCheckpoint>,
    delay_levels: Arc<DelayLevels>,
    scheduler: Arc<DelayScheduler>,
    recovery_report: RecoveryReport,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore")
            .field("root_dir", &self.config.root_dir)
            .field("commit_log", &self.commit_log)
            .field("consume_queues", &self.consume_queues)
            .field("recovery", &self.recovery_report)
            .finish()
    }
}

impl MessageStore {
    /// Loads and recovers the store under `config.root_dir`.
    pub async fn open(config: StoreConfig, delay_config: DelayConfig) -> AppResult<Self> {
        config.validate()?;
        let delay_levels = Arc::new(DelayLevels::parse(&delay_config.levels)?);

        for dir in [config.commit_log_dir(), config.consume_queue_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| AppError::DiskFailure(format!("create {}: {}", dir.display(), e)))?;
        }

        let checkpoint = Arc::new(StoreCheckpoint::load(config.checkpoint_path()).await?);
        let consume_queues = Arc::new(ConsumeQueueStore::with_dir_layout(
            config.consume_queue_dir(),
            config.consume_queue_entries_per_file,
        ));
        consume_queues
            .load()
            .map_err(disk_failure("load consume queues"))?;

        let buckets = Arc::new(DelayBuckets::new(Arc::clone(&delay_levels)));
        let dispatcher = Arc::new(StoreDispatcher {
            consume_queues: Arc::clone(&consume_queues),
            delay_listener: buckets.clone(),
        });
        let commit_log = Arc::new(CommitLog::new(
            &config,
            Arc::clone(&delay_levels),
            dispatcher,
            checkpoint.clone(),
        ));
        commit_log.load()?;

        let recovery_report = RecoveryService::new(&commit_log, Arc::clone(&consume_queues))
            .recover(checkpoint.recovery_start())
            .map_err(disk_failure("recover store"))?;
        consume_queues.correct_min_offset(commit_log.min_offset());
        let max_offset = commit_log.max_offset();
        commit_log.set_confirm_offset(max_offset);
        commit_log.flush()?;
        consume_queues.flush()?;
        checkpoint.reset(max_offset);
        checkpoint.persist().await?;

        let scheduler = Arc::new(DelayScheduler::new(
            buckets,
            Arc::clone(&commit_log),
            Arc::clone(&consume_queues),
            config.delay_offset_path(),
            Duration::from_millis(delay_config.tick_interval_ms),
        ));
        scheduler.load().await?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        info!(
            "message store opened at {}, commit log [{}, {})",
            config.root_dir.display(),
            commit_log.min_offset(),
            max_offset
        );
        Ok(Self {
            config,
            delay_config,
            commit_log,
            consume_queues,
            checkpoint,
            delay_levels,
            scheduler,
            recovery_report,
            notify_shutdown,
            shutdown_complete_tx: parking_lot::Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: tokio::sync::Mutex::new(shutdown_complete_rx),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Spawns the background tasks on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalState(
                "message store already started".to_string(),
            ));
        }
        let complete_tx = self.shutdown_complete_tx.lock().clone().ok_or_else(|| {
            AppError::ServiceNotAvailable("message store is shut down".to_string())
        })?;

        if let Some(flush_service) = self.commit_log.async_flush_service() {
            tokio::spawn(flush_service.run(self.shutdown_signal(), complete_tx.clone()));
        }
        tokio::spawn(
            Arc::clone(self).checkpoint_task(self.shutdown_signal(), complete_tx.clone()),
        );
        tokio::spawn(Arc::clone(self).clean_task(self.shutdown_signal(), complete_tx.clone()));
        tokio::spawn(Arc::clone(&self.scheduler).run(self.shutdown_signal(), complete_tx));
        info!("message store started");
        Ok(())
    }

    fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    async fn checkpoint_task(
        self: Arc<Self>,
        mut shutdown: Shutdown,
        _shutdown_complete: mpsc::Sender<()>,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.checkpoint_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {trace!("checkpoint tick")},
                _ = shutdown.recv() => break,
            }
            if let Err(e) = self.write_checkpoint().await {
                error!("write store checkpoint failed: {}", e);
            }
        }
        debug!("checkpoint task stopped");
    }

    /// Flushes the consume queues and persists both watermarks.
    async fn write_checkpoint(&self) -> AppResult<()> {
        let confirm_offset = self.commit_log.confirm_offset();
        let consume_queues = Arc::clone(&self.consume_queues);
        tokio::task::spawn_blocking(move || consume_queues.flush())
            .await
            .map_err(|e| AppError::IllegalState(format!("flush task failed: {}", e)))??;
        self.checkpoint.set_consume_queue_flushed(confirm_offset);
        self.checkpoint.persist().await
    }

    async fn clean_task(
        self: Arc<Self>,
        mut shutdown: Shutdown,
        _shutdown_complete: mpsc::Sender<()>,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.clean_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.recv() => break,
            }
            let store = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || store.delete_expired_files()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(deleted)) => debug!("retention deleted {} segments", deleted),
                Ok(Err(e)) => error!("retention cleanup failed: {}", e),
                Err(e) => error!("retention task panicked: {}", e),
            }
        }
        debug!("clean task stopped");
    }

    /// Deletes expired commit log segments and the consume queue files that
    /// only point into them. Returns the number of commit log segments
    /// deleted.
    pub fn delete_expired_files(&self) -> AppResult<usize> {
        let deleted = self
            .commit_log
            .delete_expired_files(self.config.retention(), SystemTime::now())?;
        if !deleted.is_empty() {
            let min_offset = self.commit_log.min_offset();
            let cq_deleted = self.consume_queues.delete_expired(min_offset)?;
            info!(
                "retention removed {} commit log segments and {} consume queue files, min offset {}",
                deleted.len(),
                cq_deleted,
                min_offset
            );
        }
        Ok(deleted.len())
    }

    pub fn put_message(
        &self,
        topic: &str,
        queue_id: u32,
        body: &[u8],
        delay_level: i32,
    ) -> PutMessageResult {
        match self.commit_log.append(topic, queue_id, body, delay_level) {
            Ok(append) => PutMessageResult {
                status: StoreResponseType::StoreOk,
                append: Some(append),
                error: None,
            },
            Err(e) => {
                warn!("put message to {}-{} failed: {}", topic, queue_id, e);
                PutMessageResult {
                    status: StoreResponseType::from(&e),
                    append: None,
                    error: Some(e),
                }
            }
        }
    }

    /// Stores a message that becomes visible after at least `delay`, rounded
    /// up to the next delay level.
    pub fn put_delay_message(
        &self,
        topic: &str,
        queue_id: u32,
        body: &[u8],
        delay: Duration,
    ) -> PutMessageResult {
        let level = self.delay_levels.level_for(delay);
        self.put_message(topic, queue_id, body, level)
    }

    pub fn get_message(
        &self,
        topic: &str,
        queue_id: u32,
        queue_offset: i64,
        max_count: usize,
    ) -> GetMessageResult {
        let mut result = GetMessageResult {
            status: AcquireResultType::NoMessage,
            messages: Vec::new(),
            next_offset: 0,
            min_offset: 0,
            max_offset: 0,
        };
        let Some(queue) = self.consume_queues.find(topic, queue_id) else {
            if queue_offset != 0 {
                result.status = AcquireResultType::OffsetInvalid;
            }
            return result;
        };

        let min = queue.min_offset();
        let max = queue.max_offset();
        result.min_offset = min;
        result.max_offset = max;
        if queue_offset < 0 || (queue_offset as u64) < min {
            result.status = AcquireResultType::OffsetInvalid;
            result.next_offset = min;
            return result;
        }
        let offset = queue_offset as u64;
        if offset > max {
            result.status = AcquireResultType::OffsetInvalid;
            result.next_offset = max;
            return result;
        }
        if offset == max {
            result.next_offset = max;
            return result;
        }

        let max_count = max_count.clamp(1, self.config.max_pull_batch);
        let mut next = offset;
        while next < max && result.messages.len() < max_count {
            let entry = match queue.get_entry(next as i64) {
                Ok(entry) => entry,
                Err(e) => {
                    if result.messages.is_empty() {
                        result.status = AcquireResultType::from(&e);
                    }
                    break;
                }
            };
            match self
                .commit_log
                .lookup_record(entry.commit_log_offset, entry.size)
            {
                Ok(record) => result.messages.push(StoredMessage {
                    topic: record.topic,
                    queue_id: record.queue_id,
                    queue_offset: next,
                    commit_log_offset: entry.commit_log_offset,
                    size: entry.size,
                    store_timestamp: record.store_timestamp,
                    delay_level: record.delay_level,
                    body: record.body,
                }),
                Err(e) => {
                    warn!(
                        "read of {}-{} offset {} at commit log {} failed: {}",
                        topic, queue_id, next, entry.commit_log_offset, e
                    );
                    if result.messages.is_empty() {
                        result.status = AcquireResultType::Error;
                    }
                    break;
                }
            }
            next += 1;
        }
        if !result.messages.is_empty() {
            result.status = AcquireResultType::Done;
        }
        result.next_offset = next;
        result
    }

    /// Copy of `size` commit log bytes at `offset`.
    pub fn read(&self, offset: u64, size: u32) -> AppResult<Bytes> {
        let slice = self.commit_log.read(offset, size)?;
        Ok(Bytes::copy_from_slice(&slice))
    }

    pub fn get_max_offset(&self, topic: &str, queue_id: u32) -> u64 {
        self.consume_queues.get_max_offset(topic, queue_id)
    }

    pub fn get_min_offset(&self, topic: &str, queue_id: u32) -> u64 {
        self.consume_queues.get_min_offset(topic, queue_id)
    }

    pub fn commit_log_max_offset(&self) -> u64 {
        self.commit_log.max_offset()
    }

    pub fn commit_log_min_offset(&self) -> u64 {
        self.commit_log.min_offset()
    }

    pub fn confirm_offset(&self) -> u64 {
        self.commit_log.confirm_offset()
    }

    pub fn flushed_offset(&self) -> u64 {
        self.commit_log.flushed_offset()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    pub fn delay_levels(&self) -> &Arc<DelayLevels> {
        &self.delay_levels
    }

    pub fn delay_config(&self) -> &DelayConfig {
        &self.delay_config
    }

    pub fn commit_log(&self) -> &Arc<CommitLog> {
        &self.commit_log
    }

    pub fn consume_queues(&self) -> &Arc<ConsumeQueueStore> {
        &self.consume_queues
    }

    /// Next offset of the delay bucket of `level` to redeliver.
    pub fn delay_delivered_offset(&self, level: i32) -> u64 {
        self.scheduler.buckets().delivered_offset(level)
    }

    /// Runs one delay tick as of `now_ms`, returns the number of delayed
    /// messages handled.
    pub fn deliver_due_messages(&self, now_ms: u64) -> usize {
        self.scheduler.tick(now_ms)
    }

    /// Stops the background tasks, closes the commit log and persists the
    /// final flush watermarks and delay offsets.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("message store shutting down");
        // no receivers when the store was never started
        let _ = self.notify_shutdown.send(());
        drop(self.shutdown_complete_tx.lock().take());
        self.shutdown_complete_rx.lock().await.recv().await;
        debug!("background tasks stopped");

        self.commit_log.shutdown();
        let flushed = self.commit_log.flush()?;
        self.consume_queues.flush()?;
        self.checkpoint
            .set_consume_queue_flushed(self.commit_log.confirm_offset());
        self.checkpoint.persist().await?;
        self.scheduler.persist().await?;
        info!("message store shut down, flushed to {}", flushed);
        Ok(())
    }
}
