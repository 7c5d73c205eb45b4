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

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::log::{truncate_segment, LogSegment, LogSegmentFactory, RecoveredTail};
use crate::{AppError, AppResult};

/// Segments and high-water mark of one topic.
///
/// The active segment only changes on roll; the high-water mark only moves
/// forward and is advanced by the appender once a write has completed.
#[derive(Debug)]
pub struct TopicSegmentRegistry {
    topic: String,
    directory: PathBuf,
    segments: RwLock<BTreeMap<u64, LogSegment>>,
    active_segment: RwLock<LogSegment>,
    high_water_mark: AtomicU64,
    /// Latest timestamp the appender stamped, epoch milliseconds.
    last_timestamp: AtomicU64,
}

impl TopicSegmentRegistry {
    pub fn new(
        topic: impl Into<String>,
        directory: PathBuf,
        segments: BTreeMap<u64, LogSegment>,
        active_segment: LogSegment,
        high_water_mark: u64,
    ) -> Self {
        let mut segments = segments;
        segments.insert(active_segment.base_offset, active_segment.clone());
        Self {
            topic: topic.into(),
            directory,
            segments: RwLock::new(segments),
            active_segment: RwLock::new(active_segment),
            high_water_mark: AtomicU64::new(high_water_mark),
            last_timestamp: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn active_segment(&self) -> LogSegment {
        self.active_segment.read().clone()
    }

    /// Makes `segment` the active one; the previous active segment is sealed at
    /// the new base offset.
    pub fn update_active_segment(&self, segment: LogSegment) {
        let mut segments = self.segments.write();
        let mut active = self.active_segment.write();
        if let Some(previous) = segments.get_mut(&active.base_offset) {
            previous.next_offset = segment.base_offset;
        }
        segments.insert(segment.base_offset, segment.clone());
        debug!(
            topic = %self.topic,
            previous = active.base_offset,
            active = segment.base_offset,
            "switched active segment"
        );
        *active = segment;
    }

    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark.load(Ordering::Acquire)
    }

    /// Advances the high-water mark; a smaller value is ignored.
    pub fn update_current_offset(&self, offset: u64) {
        let previous = self.high_water_mark.fetch_max(offset, Ordering::AcqRel);
        if offset > previous {
            let mut segments = self.segments.write();
            let mut active = self.active_segment.write();
            active.next_offset = active.next_offset.max(offset);
            if let Some(segment) = segments.get_mut(&active.base_offset) {
                segment.next_offset = active.next_offset;
            }
        }
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp.load(Ordering::Acquire)
    }

    /// Raises the last stamped timestamp; a smaller value is ignored.
    pub fn update_last_timestamp(&self, timestamp: u64) {
        self.last_timestamp.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// The segment whose offset range holds `offset`, or `None` when the offset
    /// is not below the high-water mark or precedes every segment.
    pub fn segment_containing_offset(&self, offset: u64) -> Option<LogSegment> {
        if offset >= self.high_water_mark() {
            return None;
        }
        self.segments
            .read()
            .range(..=offset)
            .next_back()
            .map(|(_, segment)| segment.clone())
    }

    /// All segments in base offset order.
    pub fn segments(&self) -> Vec<LogSegment> {
        self.segments.read().values().cloned().collect()
    }
}

/// Hands out one registry per topic, recovering existing segments from disk on
/// first use.
#[derive(Debug)]
pub struct TopicSegmentRegistryFactory {
    segment_factory: LogSegmentFactory,
    registries: DashMap<String, Arc<TopicSegmentRegistry>>,
}

impl TopicSegmentRegistryFactory {
    pub fn new(segment_factory: LogSegmentFactory) -> Self {
        Self {
            segment_factory,
            registries: DashMap::new(),
        }
    }

    /// Repeat calls for the same topic return the same instance; `directory` and
    /// `base_offset` only matter on the first call.
    pub async fn get_or_create(
        &self,
        topic: &str,
        directory: impl AsRef<Path>,
        base_offset: u64,
    ) -> AppResult<Arc<TopicSegmentRegistry>> {
        if let Some(registry) = self.registries.get(topic) {
            return Ok(Arc::clone(registry.value()));
        }
        let registry = Arc::new(self.recover(topic, directory.as_ref(), base_offset).await?);
        Ok(Arc::clone(
            self.registries
                .entry(topic.to_string())
                .or_insert(registry)
                .value(),
        ))
    }

    async fn recover(
        &self,
        topic: &str,
        directory: &Path,
        base_offset: u64,
    ) -> AppResult<TopicSegmentRegistry> {
        let mut base_offsets = Vec::new();
        match tokio::fs::read_dir(directory).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if let Some(offset) = LogSegment::parse_base_offset(&entry.path()) {
                        base_offsets.push(offset);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::DetailedIoError(format!(
                    "list topic directory {}: {}",
                    directory.display(),
                    e
                )))
            }
        }
        base_offsets.sort_unstable();

        let Some(&active_base) = base_offsets.last() else {
            info!(topic, base_offset, "starting empty topic");
            let active = self.segment_factory.create_log_segment(directory, base_offset);
            return Ok(TopicSegmentRegistry::new(
                topic,
                directory.to_path_buf(),
                BTreeMap::new(),
                active,
                base_offset,
            ));
        };

        let mut segments = BTreeMap::new();
        for window in base_offsets.windows(2) {
            let mut segment = self.segment_factory.create_log_segment(directory, window[0]);
            segment.next_offset = window[1];
            segments.insert(segment.base_offset, segment);
        }

        let mut active = self.segment_factory.create_log_segment(directory, active_base);
        let tail = self.recover_tail(&active).await?;
        let high_water_mark = tail.next_offset.unwrap_or(active_base).max(active_base);
        active.next_offset = high_water_mark;

        // appends must start right after the last intact batch
        let segment = active.clone();
        let truncated = tokio::task::spawn_blocking(move || {
            truncate_segment(&segment, tail.valid_bytes, high_water_mark)
        })
        .await
        .map_err(|e| {
            AppError::IllegalStateError(format!("segment truncate task failed: {}", e))
        })??;
        if truncated {
            warn!(
                topic,
                valid_bytes = tail.valid_bytes,
                high_water_mark,
                "truncated damaged tail of {}",
                active.log_path.display()
            );
        }

        // an empty active segment leaves the last timestamp in the sealed one before it
        let last_timestamp = match (tail.last_timestamp, segments.values().next_back()) {
            (Some(timestamp), _) => Some(timestamp),
            (None, Some(sealed)) => self.recover_tail(sealed).await?.last_timestamp,
            (None, None) => None,
        };

        info!(
            topic,
            segments = base_offsets.len(),
            active_segment = active_base,
            high_water_mark,
            "recovered topic from {}",
            directory.display()
        );
        let registry = TopicSegmentRegistry::new(
            topic,
            directory.to_path_buf(),
            segments,
            active,
            high_water_mark,
        );
        if let Some(timestamp) = last_timestamp {
            registry.update_last_timestamp(timestamp);
        }
        Ok(registry)
    }

    async fn recover_tail(&self, segment: &LogSegment) -> AppResult<RecoveredTail> {
        let reader = self.segment_factory.create_reader(segment)?;
        let recovered = reader.recover_tail().await;
        reader.dispose().await;
        recovered
    }
}
