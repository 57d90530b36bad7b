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

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<BrokerConfig> = OnceCell::new();

/// Returns the process wide configuration.
///
/// Only the binary sets it; library code receives its configuration explicitly.
pub fn global_config() -> Option<&'static BrokerConfig> {
    GLOBAL_CONFIG.get()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub id: i32,
    pub log_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            id: 0,
            log_dir: "logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// every append waits for its bytes to reach stable storage
    Sync,
    /// a background task flushes on an interval or a dirty-byte threshold
    Async,
}

/// Represents the configuration of the storage engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding the commit log, consume queues and checkpoints.
    pub root_dir: PathBuf,
    /// The size of each commit log segment.
    pub commit_log_segment_size: u64,
    /// Upper bound on the number of live commit log segments, 0 means unlimited.
    pub commit_log_max_segments: usize,
    /// Number of 20 byte entries held by one consume queue file.
    pub consume_queue_entries_per_file: u64,
    pub max_message_size: usize,
    pub max_topic_length: usize,
    pub flush_mode: FlushMode,
    /// The interval at which the async flush task runs.
    pub flush_interval_ms: u64,
    /// Dirty bytes that wake the async flush task before its interval elapses.
    pub flush_dirty_threshold_bytes: u64,
    /// The interval at which checkpoints are written.
    pub checkpoint_interval_secs: u64,
    /// Sealed segments older than this are removed by the clean task.
    pub retention_hours: u64,
    pub clean_interval_secs: u64,
    /// Upper bound on the number of messages returned by one pull.
    pub max_pull_batch: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("store"),
            commit_log_segment_size: 1024 * 1024 * 1024,
            commit_log_max_segments: 0,
            consume_queue_entries_per_file: 300_000,
            max_message_size: 4 * 1024 * 1024,
            max_topic_length: 127,
            flush_mode: FlushMode::Async,
            flush_interval_ms: 500,
            flush_dirty_threshold_bytes: 4 * 1024 * 1024,
            checkpoint_interval_secs: 5,
            retention_hours: 72,
            clean_interval_secs: 60,
            max_pull_batch: 32,
        }
    }
}

impl StoreConfig {
    pub fn commit_log_dir(&self) -> PathBuf {
        self.root_dir.join("commitlog")
    }

    pub fn consume_queue_dir(&self) -> PathBuf {
        self.root_dir.join("consumequeue")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root_dir.join("checkpoint")
    }

    pub fn delay_offset_path(&self) -> PathBuf {
        self.root_dir.join("delay_offsets")
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.commit_log_segment_size == 0 || self.commit_log_segment_size > u32::MAX as u64 {
            return Err(AppError::InvalidValue(format!(
                "commit_log_segment_size must be in (0, {}], got {}",
                u32::MAX,
                self.commit_log_segment_size
            )));
        }
        if self.consume_queue_entries_per_file == 0 {
            return Err(AppError::InvalidValue(
                "consume_queue_entries_per_file must be positive".to_string(),
            ));
        }
        if self.max_topic_length == 0 || self.max_topic_length > u16::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "max_topic_length must be in (0, {}], got {}",
                u16::MAX,
                self.max_topic_length
            )));
        }
        if self.max_pull_batch == 0 {
            return Err(AppError::InvalidValue(
                "max_pull_batch must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Space separated durations, level n is the n-th entry, e.g. "1s 5s 1m 2h".
    pub levels: String,
    /// The interval at which due delayed messages are redelivered.
    pub tick_interval_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            levels: "1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h".to_string(),
            tick_interval_ms: 100,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub store: StoreConfig,
    pub delay: DelayConfig,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("TIDEMQ").separator("__"))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.store.validate()?;

        Ok(broker_config)
    }
}
