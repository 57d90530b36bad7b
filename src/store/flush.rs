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

//! Commit log durability policies.
//!
//! Both policies report every newly durable byte range to a
//! [`RecoveryListener`], which keeps the flushed watermark of the store
//! checkpoint current.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace};

use super::mapped_file::MappedFile;
use super::mapped_file_queue::MappedFileQueue;
use super::RecoveryListener;
use crate::{AppError, AppResult, Shutdown};

pub trait FlushDiskService: Send + Sync + fmt::Debug {
    /// Called under the append lock once `bytes` were appended to `segment`.
    fn on_appended(&self, segment: &MappedFile, bytes: u64) -> AppResult<()>;

    /// Flushes a single segment, used when a segment is sealed.
    fn flush_segment(&self, segment: &MappedFile) -> AppResult<()>;

    /// Flushes every dirty segment, returns the flushed offset.
    fn flush(&self) -> AppResult<u64>;
}

/// Reports the flushed watermark of a segment queue, each byte once.
struct FlushNotifier {
    queue: Arc<MappedFileQueue>,
    listener: Arc<dyn RecoveryListener>,
    reported: AtomicU64,
}

impl fmt::Debug for FlushNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushNotifier")
            .field("reported", &self.reported.load(Ordering::Relaxed))
            .finish()
    }
}

impl FlushNotifier {
    fn new(queue: Arc<MappedFileQueue>, listener: Arc<dyn RecoveryListener>) -> Self {
        let reported = AtomicU64::new(queue.flushed_offset());
        Self {
            queue,
            listener,
            reported,
        }
    }

    fn notify(&self) -> u64 {
        let flushed = self.queue.flushed_offset();
        let mut from = self.reported.fetch_max(flushed, Ordering::AcqRel);
        while from < flushed {
            let size = (flushed - from).min(u32::MAX as u64);
            self.listener.on_update_offset(from, size as u32);
            from += size;
        }
        flushed
    }

    fn flush_segment(&self, segment: &MappedFile) -> AppResult<()> {
        flush_file(segment)?;
        self.notify();
        Ok(())
    }

    fn flush_all(&self) -> AppResult<u64> {
        self.queue.flush()?;
        Ok(self.notify())
    }
}

fn flush_file(segment: &MappedFile) -> AppResult<u64> {
    segment.flush().map_err(|e| {
        AppError::DiskFailure(format!(
            "flush segment {} error: {}",
            segment.path().display(),
            e
        ))
    })
}

/// Every append returns only after its bytes reached stable storage.
#[derive(Debug)]
pub struct SyncFlushService {
    notifier: FlushNotifier,
}

impl SyncFlushService {
    pub fn new(queue: Arc<MappedFileQueue>, listener: Arc<dyn RecoveryListener>) -> Self {
        Self {
            notifier: FlushNotifier::new(queue, listener),
        }
    }
}

impl FlushDiskService for SyncFlushService {
    fn on_appended(&self, segment: &MappedFile, _bytes: u64) -> AppResult<()> {
        self.notifier.flush_segment(segment)
    }

    fn flush_segment(&self, segment: &MappedFile) -> AppResult<()> {
        self.notifier.flush_segment(segment)
    }

    fn flush(&self) -> AppResult<u64> {
        self.notifier.flush_all()
    }
}

/// Flushes from a background task, on an interval or once enough dirty bytes
/// piled up.
#[derive(Debug)]
pub struct AsyncFlushService {
    notifier: FlushNotifier,
    interval: Duration,
    dirty_threshold: u64,
    dirty_bytes: AtomicU64,
    wakeup: Notify,
}

impl AsyncFlushService {
    pub fn new(
        queue: Arc<MappedFileQueue>,
        listener: Arc<dyn RecoveryListener>,
        interval: Duration,
        dirty_threshold: u64,
    ) -> Self {
        Self {
            notifier: FlushNotifier::new(queue, listener),
            interval,
            dirty_threshold,
            dirty_bytes: AtomicU64::new(0),
            wakeup: Notify::new(),
        }
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes.load(Ordering::Acquire)
    }

    /// Flush loop. Holds `_shutdown_complete` until the final flush is done.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: Shutdown,
        _shutdown_complete: mpsc::Sender<()>,
    ) {
        info!("async flush service started, interval {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wakeup.notified() => {
                    trace!("dirty threshold reached, flush early");
                }
                _ = shutdown.recv() => break,
            }
            if self.dirty_bytes() == 0 {
                continue;
            }
            let service = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || service.flush()).await {
                Ok(Ok(flushed)) => debug!("async flush done, flushed offset {}", flushed),
                Ok(Err(e)) => error!("async flush failed: {}", e),
                Err(e) => error!("async flush task panicked: {}", e),
            }
        }

        if let Err(e) = self.flush() {
            error!("final flush failed: {}", e);
        }
        info!("async flush service stopped");
    }
}

impl FlushDiskService for AsyncFlushService {
    fn on_appended(&self, _segment: &MappedFile, bytes: u64) -> AppResult<()> {
        let dirty = self.dirty_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if dirty >= self.dirty_threshold {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    fn flush_segment(&self, segment: &MappedFile) -> AppResult<()> {
        self.notifier.flush_segment(segment)
    }

    fn flush(&self) -> AppResult<u64> {
        self.dirty_bytes.store(0, Ordering::Release);
        self.notifier.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mapped_file_queue::DirSegmentAllocator;
    use parking_lot::Mutex;
    use tempfile::tempdir;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct RecordingListener {
        ranges: Mutex<Vec<(u64, u32)>>,
    }

    impl RecoveryListener for RecordingListener {
        fn on_update_offset(&self, offset: u64, size: u32) {
            self.ranges.lock().push((offset, size));
        }
    }

    fn queue(dir: &std::path::Path) -> Arc<MappedFileQueue> {
        Arc::new(MappedFileQueue::new(
            dir,
            256,
            0,
            Arc::new(DirSegmentAllocator::new(dir, 256)),
        ))
    }

    #[test]
    fn test_sync_flush_reports_each_append() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path());
        let listener = Arc::new(RecordingListener::default());
        let service = SyncFlushService::new(Arc::clone(&queue), listener.clone());

        let segment = queue.last_or_create(0)?;
        segment.append(&[1u8; 40]);
        service.on_appended(&segment, 40)?;
        segment.append(&[2u8; 10]);
        service.on_appended(&segment, 10)?;

        assert_eq!(segment.flushed_pos(), 50);
        assert_eq!(*listener.ranges.lock(), vec![(0, 40), (40, 10)]);
        Ok(())
    }

    #[test]
    fn test_async_flush_defers_until_flush() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path());
        let listener = Arc::new(RecordingListener::default());
        let service = AsyncFlushService::new(
            Arc::clone(&queue),
            listener.clone(),
            Duration::from_secs(60),
            1024,
        );

        let segment = queue.last_or_create(0)?;
        segment.append(&[1u8; 64]);
        service.on_appended(&segment, 64)?;
        assert_eq!(segment.flushed_pos(), 0);
        assert_eq!(service.dirty_bytes(), 64);

        assert_eq!(service.flush()?, 64);
        assert_eq!(service.dirty_bytes(), 0);
        assert_eq!(*listener.ranges.lock(), vec![(0, 64)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_flush_task_flushes_on_threshold_and_shutdown() -> AppResult<()> {
        let dir = tempdir()?;
        let queue = queue(dir.path());
        let listener = Arc::new(RecordingListener::default());
        let service = Arc::new(AsyncFlushService::new(
            Arc::clone(&queue),
            listener.clone(),
            Duration::from_secs(3600),
            16,
        ));

        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        let task = tokio::spawn(Arc::clone(&service).run(
            Shutdown::new(notify_shutdown.subscribe()),
            complete_tx,
        ));

        let segment = queue.last_or_create(0)?;
        segment.append(&[1u8; 32]);
        service.on_appended(&segment, 32)?;

        for _ in 0..100 {
            if segment.flushed_pos() == 32 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(segment.flushed_pos(), 32);

        segment.append(&[2u8; 8]);
        service.on_appended(&segment, 8)?;
        notify_shutdown.send(()).ok();
        let _ = complete_rx.recv().await;
        task.await.ok();

        assert_eq!(segment.flushed_pos(), 40);
        assert_eq!(*listener.ranges.lock(), vec![(0, 32), (32, 8)]);
        Ok(())
    }
}
