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
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{trace, warn};

use super::RecoveryListener;
use crate::AppError::InvalidValue;
use crate::AppResult;

/// Text file of named offsets: a version line followed by `name offset`
/// lines. Written to a sibling temp file and renamed into place.
#[derive(Debug, Clone)]
pub struct CheckPointFile {
    path: PathBuf,
    version: i8,
}

impl CheckPointFile {
    pub const CK_FILE_VERSION_1: i8 = 1;

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            version: Self::CK_FILE_VERSION_1,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_checkpoints(&self, points: &HashMap<String, u64>) -> AppResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        let mut names: Vec<&String> = points.keys().collect();
        names.sort();
        for name in names {
            buf_writer
                .write_all(format!("{} {}\n", name, points[name]).as_bytes())
                .await?;
        }
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        drop(buf_writer);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        trace!("wrote {} checkpoints to {}", points.len(), self.path.display());
        Ok(())
    }

    pub async fn read_checkpoints(&self) -> AppResult<HashMap<String, u64>> {
        let error = |line: &str| InvalidValue(format!("checkpoint line: {}", line.trim()));
        trace!("read checkpoints from {}", self.path.display());
        let open_file = OpenOptions::new().read(true).open(&self.path).await;
        let open_file = match open_file {
            Ok(file) => file,
            Err(_) => {
                warn!(
                    "checkpoint file {} not found, starting without it",
                    self.path.display()
                );
                return Ok(HashMap::new());
            }
        };

        let mut reader = BufReader::new(open_file);
        let mut line_buffer = String::new();
        reader.read_line(&mut line_buffer).await?;
        let version = line_buffer.trim().parse::<i8>()?;
        if version != self.version {
            return Err(InvalidValue(format!(
                "checkpoint version {} in {}, expected {}",
                version,
                self.path.display(),
                self.version
            )));
        }
        let mut points = HashMap::new();
        let mut line = String::new();
        while reader.read_line(&mut line).await? > 0 {
            if line.trim().is_empty() {
                line.clear();
                continue;
            }
            let mut parts = line.split_whitespace();
            if parts.clone().count() != 2 {
                return Err(error(&line));
            }
            let name = parts.next().ok_or_else(|| error(&line))?.to_string();
            let offset = parts.next().ok_or_else(|| error(&line))?.parse()?;
            points.insert(name, offset);
            line.clear();
        }
        Ok(points)
    }
}

const COMMIT_LOG_FLUSHED: &str = "commitlog_flushed";
const CONSUME_QUEUE_FLUSHED: &str = "consumequeue_flushed";

/// Flush watermarks of the commit log and the consume queues.
///
/// The commit log watermark follows the flush service through
/// [`RecoveryListener`]. The consume queue watermark is the confirm offset
/// captured right before the consume queues were flushed.
#[derive(Debug)]
pub struct StoreCheckpoint {
    file: CheckPointFile,
    commit_log_flushed: AtomicU64,
    consume_queue_flushed: AtomicU64,
    loaded: bool,
}

impl StoreCheckpoint {
    pub async fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let file = CheckPointFile::new(path);
        let points = file.read_checkpoints().await?;
        let commit_log_flushed = points.get(COMMIT_LOG_FLUSHED).copied();
        let consume_queue_flushed = points.get(CONSUME_QUEUE_FLUSHED).copied();
        Ok(Self {
            file,
            commit_log_flushed: AtomicU64::new(commit_log_flushed.unwrap_or(0)),
            consume_queue_flushed: AtomicU64::new(consume_queue_flushed.unwrap_or(0)),
            loaded: commit_log_flushed.is_some() && consume_queue_flushed.is_some(),
        })
    }

    pub fn commit_log_flushed(&self) -> u64 {
        self.commit_log_flushed.load(Ordering::Acquire)
    }

    pub fn consume_queue_flushed(&self) -> u64 {
        self.consume_queue_flushed.load(Ordering::Acquire)
    }

    pub fn set_consume_queue_flushed(&self, offset: u64) {
        self.consume_queue_flushed.store(offset, Ordering::Release);
    }

    /// Where a recovery scan may start, `None` without a persisted checkpoint.
    pub fn recovery_start(&self) -> Option<u64> {
        self.loaded
            .then(|| self.commit_log_flushed().min(self.consume_queue_flushed()))
    }

    /// Resets both watermarks after recovery moved the commit log end.
    pub fn reset(&self, offset: u64) {
        self.commit_log_flushed.store(offset, Ordering::Release);
        self.consume_queue_flushed.store(offset, Ordering::Release);
    }

    pub async fn persist(&self) -> AppResult<()> {
        let mut points = HashMap::with_capacity(2);
        points.insert(COMMIT_LOG_FLUSHED.to_string(), self.commit_log_flushed());
        points.insert(
            CONSUME_QUEUE_FLUSHED.to_string(),
            self.consume_queue_flushed(),
        );
        self.file.write_checkpoints(&points).await
    }
}

impl RecoveryListener for StoreCheckpoint {
    fn on_update_offset(&self, offset: u64, size: u32) {
        self.commit_log_flushed
            .fetch_max(offset + size as u64, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};
    use tokio::fs;

    #[tokio::test]
    async fn test_write_and_read_checkpoints() -> AppResult<()> {
        let temp_file = NamedTempFile::new()?;
        let checkpoint_file = CheckPointFile::new(temp_file.path());

        let mut points = HashMap::new();
        points.insert("level-1".to_string(), 100);
        points.insert("level-2".to_string(), 200);

        checkpoint_file.write_checkpoints(&points).await?;
        let read_points = checkpoint_file.read_checkpoints().await?;

        assert_eq!(points, read_points);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() -> AppResult<()> {
        let dir = tempdir()?;
        let checkpoint_file = CheckPointFile::new(dir.path().join("absent"));
        assert!(checkpoint_file.read_checkpoints().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_version() -> AppResult<()> {
        let temp_file = NamedTempFile::new()?;
        fs::write(temp_file.path(), "2\n").await?;

        let checkpoint_file = CheckPointFile::new(temp_file.path());
        let result = checkpoint_file.read_checkpoints().await;

        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_format() -> AppResult<()> {
        let temp_file = NamedTempFile::new()?;
        fs::write(temp_file.path(), "1\nlevel-1 invalid\n").await?;

        let checkpoint_file = CheckPointFile::new(temp_file.path());
        let result = checkpoint_file.read_checkpoints().await;

        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_store_checkpoint_watermarks() -> AppResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("checkpoint");

        let checkpoint = StoreCheckpoint::load(&path).await?;
        assert_eq!(checkpoint.recovery_start(), None);

        checkpoint.on_update_offset(0, 100);
        checkpoint.on_update_offset(100, 50);
        // a stale report never moves the watermark back
        checkpoint.on_update_offset(0, 10);
        checkpoint.set_consume_queue_flushed(120);
        checkpoint.persist().await?;

        let reloaded = StoreCheckpoint::load(&path).await?;
        assert_eq!(reloaded.commit_log_flushed(), 150);
        assert_eq!(reloaded.consume_queue_flushed(), 120);
        assert_eq!(reloaded.recovery_start(), Some(120));
        Ok(())
    }
}
