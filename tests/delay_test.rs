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

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::{tempdir, TempDir};
use tidemq::store::{AcquireResultType, StoreResponseType, DELAY_TOPIC};
use tidemq::store::RecoveryState;
use tidemq::{
    setup_local_tracing, AppResult, CheckPointFile, DelayConfig, FlushMode, MessageStore,
    StoreConfig,
};

#[fixture]
#[once]
fn setup() {
    let _ = setup_local_tracing();
}

const SEGMENT_SIZE: u64 = 64 * 1024;

fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        root_dir: dir.path().to_path_buf(),
        commit_log_segment_size: SEGMENT_SIZE,
        consume_queue_entries_per_file: 64,
        flush_mode: FlushMode::Sync,
        ..Default::default()
    }
}

/// Copies a live store directory, as a crash would leave it on disk.
fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Drops every commit log byte from `offset` to the end of its segment.
fn lose_commit_log_tail(root: &Path, offset: u64) -> io::Result<()> {
    let base = offset - offset % SEGMENT_SIZE;
    let pos = offset - base;
    let mut file = OpenOptions::new()
        .write(true)
        .open(root.join("commitlog").join(format!("{:020}", base)))?;
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(&vec![0u8; (SEGMENT_SIZE - pos) as usize])?;
    file.sync_all()
}

fn flip_last_byte(root: &Path, offset: u64, size: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(root.join("commitlog").join(format!("{:020}", 0)))?;
    file.seek(SeekFrom::Start(offset + size as u64 - 1))?;
    file.write_all(b"?")?;
    file.sync_all()
}

#[rstest]
#[tokio::test]
async fn test_delayed_message_visible_once_due(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let store = MessageStore::open(store_config(&dir), DelayConfig::default()).await?;

    let put = store.put_message("orders", 0, b"later", 2);
    let append = put.append.expect("stored");
    assert_eq!(append.topic, DELAY_TOPIC);
    assert_eq!(append.queue_id, 1);
    let stored_at = append.store_timestamp;

    assert_eq!(store.deliver_due_messages(stored_at + 4_999), 0);
    assert_eq!(store.get_max_offset("orders", 0), 0);
    assert_eq!(
        store.get_message("orders", 0, 0, 1).status,
        AcquireResultType::NoMessage
    );

    assert_eq!(store.deliver_due_messages(stored_at + 5_000), 1);
    let result = store.get_message("orders", 0, 0, 8);
    assert_eq!(result.status, AcquireResultType::Done);
    assert_eq!(result.messages.len(), 1);
    assert_eq!(&result.messages[0].body[..], b"later");
    assert_eq!(result.messages[0].delay_level, 0);

    assert_eq!(store.deliver_due_messages(stored_at + 60_000), 0);
    assert_eq!(store.get_max_offset("orders", 0), 1);
    assert_eq!(store.delay_delivered_offset(2), 1);
    store.shutdown().await
}

#[rstest]
#[tokio::test]
async fn test_buckets_deliver_in_due_order(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let store = MessageStore::open(store_config(&dir), DelayConfig::default()).await?;

    let slow = store.put_message("orders", 0, b"slow", 3).append.expect("stored");
    let fast = store.put_message("orders", 0, b"fast", 1).append.expect("stored");

    assert_eq!(store.deliver_due_messages(fast.store_timestamp + 1_000), 1);
    assert_eq!(store.deliver_due_messages(slow.store_timestamp + 10_000), 1);

    let result = store.get_message("orders", 0, 0, 8);
    let bodies: Vec<&[u8]> = result.messages.iter().map(|m| &m.body[..]).collect();
    assert_eq!(bodies, vec![&b"fast"[..], &b"slow"[..]]);
    store.shutdown().await
}

#[rstest]
#[tokio::test]
async fn test_delivered_offsets_survive_restart(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let config = store_config(&dir);
    let slow_stored_at = {
        let store = MessageStore::open(config.clone(), DelayConfig::default()).await?;
        let fast = store.put_message("orders", 0, b"fast", 1).append.expect("stored");
        let slow = store.put_message("orders", 0, b"slow", 3).append.expect("stored");
        assert_eq!(store.deliver_due_messages(fast.store_timestamp + 1_000), 1);
        store.shutdown().await?;
        slow.store_timestamp
    };

    let store = MessageStore::open(config, DelayConfig::default()).await?;
    assert_eq!(store.delay_delivered_offset(1), 1);
    assert_eq!(store.delay_delivered_offset(3), 0);
    // the fast message must not be redelivered a second time
    assert_eq!(store.deliver_due_messages(slow_stored_at + 3_600_000), 1);
    assert_eq!(store.get_max_offset("orders", 0), 2);
    store.shutdown().await
}

#[rstest]
#[case::round_up(Duration::from_secs(3), 2)]
#[case::exact(Duration::from_secs(10), 3)]
#[case::beyond_last(Duration::from_secs(86_400), 18)]
#[tokio::test]
async fn test_put_delay_message_picks_level(
    _setup: (),
    #[case] delay: Duration,
    #[case] level: i32,
) -> AppResult<()> {
    let dir = tempdir()?;
    let store = MessageStore::open(store_config(&dir), DelayConfig::default()).await?;
    let put = store.put_delay_message("orders", 0, b"later", delay);
    assert_eq!(put.append.map(|a| a.queue_id), Some((level - 1) as u32));
    assert_eq!(store.get_max_offset(DELAY_TOPIC, (level - 1) as u32), 1);
    store.shutdown().await
}

#[rstest]
#[tokio::test]
async fn test_reserved_topic_rejected(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let store = MessageStore::open(store_config(&dir), DelayConfig::default()).await?;
    let put = store.put_message(DELAY_TOPIC, 0, b"x", 0);
    assert_eq!(put.status, StoreResponseType::ParameterError);
    let put = store.put_message("orders", 0, b"x", -1);
    assert_eq!(put.status, StoreResponseType::ParameterError);
    store.shutdown().await
}

#[rstest]
#[tokio::test]
async fn test_scheduler_task_redelivers(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let delay_config = DelayConfig {
        levels: "100ms 200ms".to_string(),
        tick_interval_ms: 10,
    };
    let store = Arc::new(MessageStore::open(store_config(&dir), delay_config).await?);
    store.start()?;

    assert!(store.put_message("orders", 0, b"soon", 1).is_ok());
    for _ in 0..300 {
        if store.get_max_offset("orders", 0) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.get_max_offset("orders", 0), 1);
    store.shutdown().await?;

    let saved = std::fs::read_to_string(dir.path().join("delay_offsets"))?;
    assert!(saved.contains("level-1 1"));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_persisted_delay_offsets_never_outrun_flush(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        flush_mode: FlushMode::Async,
        flush_interval_ms: 3_600_000,
        ..store_config(&dir)
    };
    let delay_config = DelayConfig {
        levels: "100ms".to_string(),
        tick_interval_ms: 10,
    };
    let store = Arc::new(MessageStore::open(config.clone(), delay_config.clone()).await?);
    assert!(store.put_message("orders", 0, b"soon", 1).is_ok());
    store.commit_log().flush()?;
    store.start()?;

    let offset_path = config.delay_offset_path();
    for _ in 0..300 {
        let saved = std::fs::read_to_string(&offset_path).unwrap_or_default();
        if saved.contains("level-1 1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(std::fs::read_to_string(&offset_path)?.contains("level-1 1"));
    // the redelivered record is durable before its offset is
    let flushed = store.flushed_offset();
    assert_eq!(flushed, store.commit_log_max_offset());

    let crashed = tempdir()?;
    copy_dir(dir.path(), crashed.path())?;
    lose_commit_log_tail(crashed.path(), flushed)?;
    store.shutdown().await?;

    let reopened = MessageStore::open(
        StoreConfig {
            root_dir: crashed.path().to_path_buf(),
            ..config
        },
        delay_config,
    )
    .await?;
    assert_eq!(reopened.delay_delivered_offset(1), 1);
    let result = reopened.get_message("orders", 0, 0, 1);
    assert_eq!(result.status, AcquireResultType::Done);
    assert_eq!(&result.messages[0].body[..], b"soon");
    reopened.shutdown().await
}

#[rstest]
#[tokio::test]
async fn test_lost_redelivery_is_redone_after_crash(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        flush_mode: FlushMode::Async,
        flush_interval_ms: 3_600_000,
        ..store_config(&dir)
    };
    let store = MessageStore::open(config.clone(), DelayConfig::default()).await?;
    let delayed = store
        .put_message("orders", 0, b"late", 1)
        .append
        .expect("stored");
    let flushed = store.commit_log().flush()?;
    assert_eq!(store.deliver_due_messages(delayed.store_timestamp + 1_000), 1);
    assert!(store.flushed_offset() < store.commit_log_max_offset());

    // crash before the redelivered record reaches the disk
    let crashed = tempdir()?;
    copy_dir(dir.path(), crashed.path())?;
    lose_commit_log_tail(crashed.path(), flushed)?;
    store.shutdown().await?;

    let reopened = MessageStore::open(
        StoreConfig {
            root_dir: crashed.path().to_path_buf(),
            ..config
        },
        DelayConfig::default(),
    )
    .await?;
    assert_eq!(reopened.get_max_offset("orders", 0), 0);
    assert_eq!(reopened.get_max_offset(DELAY_TOPIC, 0), 1);
    assert_eq!(reopened.delay_delivered_offset(1), 0);

    assert_eq!(
        reopened.deliver_due_messages(delayed.store_timestamp + 1_000),
        1
    );
    let result = reopened.get_message("orders", 0, 0, 8);
    assert_eq!(result.messages.len(), 1);
    assert_eq!(&result.messages[0].body[..], b"late");
    reopened.shutdown().await
}

#[rstest]
#[tokio::test]
async fn test_torn_bucket_tail_clamps_delivered_offset(_setup: ()) -> AppResult<()> {
    let dir = tempdir()?;
    let config = store_config(&dir);
    let (first_due, torn) = {
        let store = MessageStore::open(config.clone(), DelayConfig::default()).await?;
        let first = store
            .put_message("orders", 0, b"first", 1)
            .append
            .expect("stored");
        assert_eq!(store.deliver_due_messages(first.store_timestamp + 1_000), 1);
        let second = store
            .put_message("orders", 0, b"second", 1)
            .append
            .expect("stored");
        assert_eq!(second.queue_offset, 1);
        store.shutdown().await?;
        (first.store_timestamp + 1_000, second)
    };

    // offsets saved past the bucket entry the torn write takes away
    CheckPointFile::new(config.delay_offset_path())
        .write_checkpoints(&HashMap::from([("level-1".to_string(), 2)]))
        .await?;
    flip_last_byte(dir.path(), torn.commit_log_offset, torn.size)?;

    let store = MessageStore::open(config, DelayConfig::default()).await?;
    assert_eq!(store.recovery_report().state, RecoveryState::Truncated);
    assert_eq!(store.get_max_offset(DELAY_TOPIC, 0), 1);
    assert_eq!(store.delay_delivered_offset(1), 1);
    assert_eq!(store.deliver_due_messages(first_due), 0);

    let third = store
        .put_message("orders", 0, b"third", 1)
        .append
        .expect("stored");
    assert_eq!(third.queue_offset, 1);
    assert_eq!(store.deliver_due_messages(third.store_timestamp + 1_000), 1);

    let result = store.get_message("orders", 0, 0, 8);
    let bodies: Vec<&[u8]> = result.messages.iter().map(|m| &m.body[..]).collect();
    assert_eq!(bodies, vec![&b"first"[..], &b"third"[..]]);
    store.shutdown().await
}
