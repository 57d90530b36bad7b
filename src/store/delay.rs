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

//! Delayed message scheduling.
//!
//! A delayed message is parked in the commit log under [`DELAY_TOPIC`], in the
//! bucket (queue) of its delay level. Every bucket is a FIFO sorted by due
//! time, since all its messages share the same delay. The scheduler walks
//! each bucket from its delivered offset and re-appends due messages to their
//! real queue.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::checkpoint::CheckPointFile;
use super::commit_log::CommitLog;
use super::consume_queue_store::ConsumeQueueStore;
use super::record::DelayEnvelope;
use super::{now_millis, DelayMessageCommitListener};
use crate::{AppError, AppResult, Shutdown};

/// Internal topic holding delayed messages until they are due.
pub const DELAY_TOPIC: &str = "%DELAY_TOPIC%";

const DEFAULT_LEVEL_SECS: [u64; 18] = [
    1, 5, 10, 30, 60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 1200, 1800, 3600, 7200,
];

/// Delay of every level, level `n` is entry `n - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayLevels {
    delays: Vec<Duration>,
}

impl Default for DelayLevels {
    fn default() -> Self {
        Self {
            delays: DEFAULT_LEVEL_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
        }
    }
}

impl DelayLevels {
    /// Parses space separated durations such as `"1s 5s 1m 2h"`. Units are
    /// `ms`, `s`, `m`, `h` and `d`.
    pub fn parse(levels: &str) -> AppResult<Self> {
        let mut delays = Vec::new();
        for token in levels.split_whitespace() {
            let split = token.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| {
                AppError::InvalidValue(format!("delay level {} has no unit", token))
            })?;
            let (value, unit) = token.split_at(split);
            let value: u64 = value.parse()?;
            let secs = |per_unit: u64| {
                value.checked_mul(per_unit).ok_or_else(|| {
                    AppError::InvalidValue(format!("delay level {} overflows", token))
                })
            };
            let delay = match unit {
                "ms" => Duration::from_millis(value),
                "s" => Duration::from_secs(value),
                "m" => Duration::from_secs(secs(60)?),
                "h" => Duration::from_secs(secs(3600)?),
                "d" => Duration::from_secs(secs(86400)?),
                other => {
                    return Err(AppError::InvalidValue(format!(
                        "delay level {} has unknown unit {}",
                        token, other
                    )))
                }
            };
            if delay.is_zero() {
                return Err(AppError::InvalidValue(format!(
                    "delay level {} is zero",
                    token
                )));
            }
            delays.push(delay);
        }
        if delays.is_empty() {
            return Err(AppError::InvalidValue("no delay levels".to_string()));
        }
        Ok(Self { delays })
    }

    pub fn max_level(&self) -> i32 {
        self.delays.len() as i32
    }

    /// Maps a positive level into `[1, max_level]`.
    pub fn clamp(&self, level: i32) -> i32 {
        level.clamp(1, self.max_level())
    }

    pub fn delay(&self, level: i32) -> Duration {
        self.delays[(self.clamp(level) - 1) as usize]
    }

    pub fn delay_millis(&self, level: i32) -> u64 {
        u64::try_from(self.delay(level).as_millis()).unwrap_or(u64::MAX)
    }

    /// Smallest level whose delay is at least `delay`, 0 for no delay.
    pub fn level_for(&self, delay: Duration) -> i32 {
        if delay.is_zero() {
            return 0;
        }
        self.delays
            .iter()
            .position(|d| *d >= delay)
            .map(|i| i as i32 + 1)
            .unwrap_or_else(|| self.max_level())
    }
}

struct Bucket {
    level: i32,
    /// next bucket offset to redeliver, persisted
    delivered_offset: AtomicU64,
    /// one past the last indexed bucket offset
    committed_offset: AtomicU64,
    busy: Mutex<()>,
}

/// Per level progress of the scheduler.
///
/// Kept apart from [`DelayScheduler`] so the commit log dispatcher can
/// report new delayed records without holding the commit log itself.
pub struct DelayBuckets {
    levels: Arc<DelayLevels>,
    buckets: Vec<Bucket>,
}

impl fmt::Debug for DelayBuckets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayBuckets")
            .field("levels", &self.levels.max_level())
            .field("delivered", &self.delivered_offsets())
            .finish()
    }
}

impl DelayBuckets {
    pub fn new(levels: Arc<DelayLevels>) -> Self {
        let buckets = (1..=levels.max_level())
            .map(|level| Bucket {
                level,
                delivered_offset: AtomicU64::new(0),
                committed_offset: AtomicU64::new(0),
                busy: Mutex::new(()),
            })
            .collect();
        Self { levels, buckets }
    }

    pub fn levels(&self) -> &Arc<DelayLevels> {
        &self.levels
    }

    fn bucket(&self, level: i32) -> Option<&Bucket> {
        if level < 1 {
            return None;
        }
        self.buckets.get((level - 1) as usize)
    }

    pub fn delivered_offset(&self, level: i32) -> u64 {
        self.bucket(level)
            .map(|b| b.delivered_offset.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, level: i32) -> u64 {
        self.bucket(level)
            .map(|b| b.committed_offset.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Bucket offsets keyed by `level-<n>`.
    pub fn delivered_offsets(&self) -> HashMap<String, u64> {
        self.buckets
            .iter()
            .map(|b| {
                (
                    level_key(b.level),
                    b.delivered_offset.load(Ordering::Acquire),
                )
            })
            .collect()
    }
}

fn level_key(level: i32) -> String {
    format!("level-{}", level)
}

impl DelayMessageCommitListener for DelayBuckets {
    fn on_commit(
        &self,
        commit_log_offset: u64,
        queue_offset: u64,
        topic: &str,
        queue_id: u32,
        delay: i32,
    ) {
        if let Some(bucket) = self.bucket(delay) {
            bucket
                .committed_offset
                .fetch_max(queue_offset + 1, Ordering::AcqRel);
            trace!(
                "delayed record at {} committed to bucket {} offset {} ({}-{})",
                commit_log_offset,
                delay,
                queue_offset,
                topic,
                queue_id
            );
        }
    }
}

/// Re-appends due delayed messages to their real queues.
pub struct DelayScheduler {
    buckets: Arc<DelayBuckets>,
    commit_log: Arc<CommitLog>,
    consume_queues: Arc<ConsumeQueueStore>,
    offset_file: CheckPointFile,
    tick_interval: Duration,
}

impl fmt::Debug for DelayScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("buckets", &self.buckets)
            .field("offset_file", &self.offset_file.path())
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

impl DelayScheduler {
    pub fn new(
        buckets: Arc<DelayBuckets>,
        commit_log: Arc<CommitLog>,
        consume_queues: Arc<ConsumeQueueStore>,
        offset_path: impl AsRef<Path>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            buckets,
            commit_log,
            consume_queues,
            offset_file: CheckPointFile::new(offset_path),
            tick_interval,
        }
    }

    pub fn buckets(&self) -> &Arc<DelayBuckets> {
        &self.buckets
    }

    /// Restores delivered offsets and syncs committed offsets with the
    /// bucket queues. Persisted offsets are clamped into the live range of
    /// their bucket.
    pub async fn load(&self) -> AppResult<()> {
        let saved = self.offset_file.read_checkpoints().await?;
        for bucket in &self.buckets.buckets {
            let queue_id = (bucket.level - 1) as u32;
            let min = self.consume_queues.get_min_offset(DELAY_TOPIC, queue_id);
            let max = self.consume_queues.get_max_offset(DELAY_TOPIC, queue_id);
            let delivered = saved
                .get(&level_key(bucket.level))
                .copied()
                .unwrap_or(0)
                .clamp(min, max);
            bucket.delivered_offset.store(delivered, Ordering::Release);
            bucket.committed_offset.store(max, Ordering::Release);
            if delivered < max {
                debug!(
                    "delay bucket {} has {} pending messages",
                    bucket.level,
                    max - delivered
                );
            }
        }
        Ok(())
    }

    /// Persists the delivered offsets. The commit log is flushed first so a
    /// persisted offset never runs ahead of a durable redelivery.
    pub async fn persist(&self) -> AppResult<()> {
        let delivered = self.buckets.delivered_offsets();
        let commit_log = Arc::clone(&self.commit_log);
        let flushed = tokio::task::spawn_blocking(move || commit_log.flush())
            .await
            .map_err(|e| AppError::IllegalState(format!("flush task failed: {}", e)))??;
        trace!("commit log flushed to {} before persisting delay offsets", flushed);
        self.offset_file.write_checkpoints(&delivered).await
    }

    /// Redelivers every message due at `now_ms`, returns how many bucket
    /// entries were consumed.
    pub fn tick(&self, now_ms: u64) -> usize {
        let mut consumed = 0;
        for bucket in &self.buckets.buckets {
            let Some(_busy) = bucket.busy.try_lock() else {
                continue;
            };
            consumed += self.deliver_bucket(bucket, now_ms);
        }
        consumed
    }

    fn deliver_bucket(&self, bucket: &Bucket, now_ms: u64) -> usize {
        let queue_id = (bucket.level - 1) as u32;
        let Some(queue) = self.consume_queues.find(DELAY_TOPIC, queue_id) else {
            return 0;
        };
        let mut offset = bucket.delivered_offset.load(Ordering::Acquire);
        let end = queue
            .max_offset()
            .max(bucket.committed_offset.load(Ordering::Acquire));
        let mut consumed = 0;

        while offset < end {
            let min = queue.min_offset();
            if offset < min {
                warn!(
                    "delay bucket {} offsets [{}, {}) removed by retention, skipped",
                    bucket.level, offset, min
                );
                offset = min;
                bucket.delivered_offset.store(offset, Ordering::Release);
                continue;
            }
            let entry = match queue.get_entry(offset as i64) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("delay bucket {} stops at {}: {}", bucket.level, offset, e);
                    break;
                }
            };
            if entry.tag > now_ms {
                break;
            }

            match self.redeliver(entry.commit_log_offset, entry.size) {
                Ok(()) => {}
                Err(Redelivery::Retry(e)) => {
                    warn!(
                        "redelivery of delay bucket {} offset {} failed, retry next tick: {}",
                        bucket.level, offset, e
                    );
                    break;
                }
                Err(Redelivery::Skip(e)) => {
                    error!(
                        "delay bucket {} offset {} can not be redelivered, skipped: {}",
                        bucket.level, offset, e
                    );
                }
            }
            offset += 1;
            consumed += 1;
            bucket.delivered_offset.store(offset, Ordering::Release);
        }
        consumed
    }

    fn redeliver(&self, commit_log_offset: u64, size: u32) -> Result<(), Redelivery> {
        let record = match self.commit_log.lookup_record(commit_log_offset, size) {
            Ok(record) => record,
            Err(AppError::OffsetOutOfRange(_)) => {
                warn!(
                    "delayed record at {} removed by retention, skipped",
                    commit_log_offset
                );
                return Ok(());
            }
            Err(e) => return Err(Redelivery::Skip(e)),
        };
        let envelope = DelayEnvelope::decode(record.body).map_err(Redelivery::Skip)?;
        match self
            .commit_log
            .append(&envelope.topic, envelope.queue_id, &envelope.body, 0)
        {
            Ok(appended) => {
                trace!(
                    "redelivered delayed record {} to {}-{} at queue offset {}",
                    commit_log_offset,
                    envelope.topic,
                    envelope.queue_id,
                    appended.queue_offset
                );
                Ok(())
            }
            Err(e @ AppError::ParameterError(_)) => Err(Redelivery::Skip(e)),
            Err(e) => Err(Redelivery::Retry(e)),
        }
    }

    /// Tick loop, persists offsets after productive ticks and on shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: Shutdown,
        _shutdown_complete: mpsc::Sender<()>,
    ) {
        info!(
            "delay scheduler started with {} levels, tick {:?}",
            self.buckets.levels.max_level(),
            self.tick_interval
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }
            let scheduler = Arc::clone(&self);
            let consumed =
                match tokio::task::spawn_blocking(move || scheduler.tick(now_millis())).await {
                    Ok(consumed) => consumed,
                    Err(e) => {
                        error!("delay tick panicked: {}", e);
                        0
                    }
                };
            if consumed > 0 {
                if let Err(e) = self.persist().await {
                    error!("persist delay offsets failed: {}", e);
                }
            }
        }

        if let Err(e) = self.persist().await {
            error!("persist delay offsets on shutdown failed: {}", e);
        }
        info!("delay scheduler stopped");
    }
}

enum Redelivery {
    Retry(AppError),
    Skip(AppError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1s", vec![Duration::from_secs(1)])]
    #[case("500ms 2m", vec![Duration::from_millis(500), Duration::from_secs(120)])]
    #[case(" 1h  1d ", vec![Duration::from_secs(3600), Duration::from_secs(86400)])]
    fn test_parse_levels(#[case] input: &str, #[case] expected: Vec<Duration>) -> AppResult<()> {
        assert_eq!(DelayLevels::parse(input)?.delays, expected);
        Ok(())
    }

    #[rstest]
    #[case("")]
    #[case("5")]
    #[case("5y")]
    #[case("0s")]
    #[case("s")]
    #[case("18446744073709551615m")]
    #[case("9999999999999999999d")]
    fn test_parse_rejects(#[case] input: &str) {
        assert!(DelayLevels::parse(input).is_err());
    }

    #[test]
    fn test_default_matches_documented_levels() -> AppResult<()> {
        let parsed =
            DelayLevels::parse("1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h")?;
        assert_eq!(parsed, DelayLevels::default());
        assert_eq!(parsed.delay_millis(2), 5_000);
        Ok(())
    }

    #[test]
    fn test_level_lookup() {
        let levels = DelayLevels::default();
        assert_eq!(levels.level_for(Duration::ZERO), 0);
        assert_eq!(levels.level_for(Duration::from_millis(1)), 1);
        assert_eq!(levels.level_for(Duration::from_secs(5)), 2);
        assert_eq!(levels.level_for(Duration::from_secs(6)), 3);
        assert_eq!(levels.level_for(Duration::from_secs(86400)), 18);
        assert_eq!(levels.clamp(40), 18);
        assert_eq!(levels.delay(40), Duration::from_secs(7200));
    }

    #[test]
    fn test_commit_listener_moves_committed_offset() {
        let buckets = DelayBuckets::new(Arc::new(DelayLevels::default()));
        buckets.on_commit(0, 0, DELAY_TOPIC, 1, 2);
        buckets.on_commit(100, 1, DELAY_TOPIC, 1, 2);
        // out of order reports never move it back
        buckets.on_commit(50, 0, DELAY_TOPIC, 1, 2);
        // unknown levels are ignored
        buckets.on_commit(0, 9, DELAY_TOPIC, 0, 0);

        assert_eq!(buckets.committed_offset(2), 2);
        assert_eq!(buckets.committed_offset(1), 0);
        assert_eq!(buckets.delivered_offsets().len(), 18);
        assert_eq!(buckets.delivered_offsets()["level-2"], 0);
    }
}
