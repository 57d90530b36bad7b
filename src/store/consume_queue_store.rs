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

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::consume_queue::{ConsumeQueue, CqEntry, CQ_ENTRY_SIZE};
use super::mapped_file::MappedFile;
use super::{segment_file_name, CreateRequestListener};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicQueue {
    pub topic: String,
    pub queue_id: u32,
}

impl TopicQueue {
    pub fn new(topic: impl Into<String>, queue_id: u32) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
        }
    }
}

impl fmt::Display for TopicQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.queue_id)
    }
}

/// Lays consume queue files out as `<root>/<topic>/<queue_id>/<base_offset>`.
#[derive(Debug)]
pub struct DirCreateRequestListener {
    root: PathBuf,
    file_size: u64,
}

impl DirCreateRequestListener {
    pub fn new(root: impl Into<PathBuf>, file_size: u64) -> Self {
        Self {
            root: root.into(),
            file_size,
        }
    }

    pub fn queue_dir(&self, topic: &str, queue_id: u32) -> PathBuf {
        queue_dir(&self.root, topic, queue_id)
    }
}

fn queue_dir(root: &Path, topic: &str, queue_id: u32) -> PathBuf {
    root.join(topic).join(queue_id.to_string())
}

impl CreateRequestListener for DirCreateRequestListener {
    fn on_require_create(&self, topic: &str, queue_id: u32, index: u64) -> AppResult<MappedFile> {
        let dir = self.queue_dir(topic, queue_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::NoSpace(format!(
                "create consume queue dir {} error: {}",
                dir.display(),
                e
            ))
        })?;
        let base_offset = index * self.file_size;
        let path = dir.join(segment_file_name(base_offset));
        debug!(
            "create consume queue file {} for {}-{}",
            path.display(),
            topic,
            queue_id
        );
        MappedFile::create(&path, base_offset, self.file_size).map_err(|e| {
            AppError::NoSpace(format!(
                "create consume queue file {} error: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Registry of every consume queue of the store.
pub struct ConsumeQueueStore {
    root: PathBuf,
    entries_per_file: u64,
    queues: DashMap<TopicQueue, Arc<ConsumeQueue>>,
    listener: Arc<dyn CreateRequestListener>,
}

impl fmt::Debug for ConsumeQueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeQueueStore")
            .field("root", &self.root)
            .field("entries_per_file", &self.entries_per_file)
            .field("queues", &self.queues.len())
            .finish()
    }
}

impl ConsumeQueueStore {
    pub fn new(
        root: impl Into<PathBuf>,
        entries_per_file: u64,
        listener: Arc<dyn CreateRequestListener>,
    ) -> Self {
        Self {
            root: root.into(),
            entries_per_file,
            queues: DashMap::new(),
            listener,
        }
    }

    /// Store using the default directory layout under `root`.
    pub fn with_dir_layout(root: impl Into<PathBuf>, entries_per_file: u64) -> Self {
        let root = root.into();
        let listener = Arc::new(DirCreateRequestListener::new(
            root.clone(),
            entries_per_file * CQ_ENTRY_SIZE,
        ));
        Self::new(root, entries_per_file, listener)
    }

    /// Opens every `<topic>/<queue_id>` directory under the root.
    pub fn load(&self) -> AppResult<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for topic_entry in std::fs::read_dir(&self.root)? {
            let topic_entry = topic_entry?;
            if !topic_entry.path().is_dir() {
                continue;
            }
            let topic = topic_entry.file_name().to_string_lossy().to_string();
            for queue_entry in std::fs::read_dir(topic_entry.path())? {
                let queue_entry = queue_entry?;
                let name = queue_entry.file_name().to_string_lossy().to_string();
                let Ok(queue_id) = name.parse::<u32>() else {
                    warn!(
                        "skip unknown consume queue dir {}",
                        queue_entry.path().display()
                    );
                    continue;
                };
                let queue = self.find_or_create(&topic, queue_id);
                queue.load()?;
            }
        }
        info!(
            "loaded {} consume queues from {}",
            self.queues.len(),
            self.root.display()
        );
        Ok(())
    }

    pub fn find(&self, topic: &str, queue_id: u32) -> Option<Arc<ConsumeQueue>> {
        self.queues
            .get(&TopicQueue::new(topic, queue_id))
            .map(|queue| Arc::clone(queue.value()))
    }

    pub fn find_or_create(&self, topic: &str, queue_id: u32) -> Arc<ConsumeQueue> {
        if let Some(queue) = self.find(topic, queue_id) {
            return queue;
        }
        let entry = self
            .queues
            .entry(TopicQueue::new(topic, queue_id))
            .or_insert_with(|| {
                Arc::new(ConsumeQueue::new(
                    topic,
                    queue_id,
                    queue_dir(&self.root, topic, queue_id),
                    self.entries_per_file,
                    Arc::clone(&self.listener),
                ))
            });
        Arc::clone(entry.value())
    }

    pub fn queues(&self) -> Vec<Arc<ConsumeQueue>> {
        self.queues
            .iter()
            .map(|queue| Arc::clone(queue.value()))
            .collect()
    }

    /// Appends an entry to the queue, creating the queue on first use.
    /// Returns the assigned queue offset.
    pub fn append_entry(
        &self,
        topic: &str,
        queue_id: u32,
        commit_log_offset: u64,
        size: u32,
        tag: u64,
    ) -> AppResult<u64> {
        self.find_or_create(topic, queue_id)
            .put(commit_log_offset, size, tag)
    }

    pub fn get_entry(&self, topic: &str, queue_id: u32, queue_offset: i64) -> AppResult<CqEntry> {
        match self.find(topic, queue_id) {
            Some(queue) => queue.get_entry(queue_offset),
            None => Err(AppError::OffsetInvalid(format!(
                "unknown queue {}-{}",
                topic, queue_id
            ))),
        }
    }

    /// Next offset to assign, 0 for an unknown queue.
    pub fn get_max_offset(&self, topic: &str, queue_id: u32) -> u64 {
        self.find(topic, queue_id)
            .map(|queue| queue.max_offset())
            .unwrap_or(0)
    }

    pub fn get_min_offset(&self, topic: &str, queue_id: u32) -> u64 {
        self.find(topic, queue_id)
            .map(|queue| queue.min_offset())
            .unwrap_or(0)
    }

    pub fn truncate_dirty(&self, max_commit_log_offset: u64) -> AppResult<()> {
        for queue in self.queues() {
            queue.truncate_dirty(max_commit_log_offset)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        for queue in self.queues() {
            queue.flush()?;
        }
        Ok(())
    }

    pub fn delete_expired(&self, min_commit_log_offset: u64) -> AppResult<usize> {
        let mut deleted = 0;
        for queue in self.queues() {
            deleted += queue.delete_expired(min_commit_log_offset)?;
        }
        Ok(deleted)
    }

    pub fn correct_min_offset(&self, min_commit_log_offset: u64) {
        for queue in self.queues() {
            queue.correct_min_offset(min_commit_log_offset);
        }
    }
}
