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

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::log::{LogSegment, LogSegmentFactory, LogSegmentReader, TopicSegmentRegistry};
use crate::message::{BatchHeader, LogRecord, LogRecordBatch};
use crate::AppResult;

/// Offset-addressed reads over all segments of one topic, bounded by the
/// high-water mark.
///
/// One segment reader is kept open and replaced whenever a read lands in a
/// different segment.
#[derive(Debug)]
pub struct CommitLogReader {
    registry: Arc<TopicSegmentRegistry>,
    segment_factory: LogSegmentFactory,
    current: Mutex<Option<Arc<LogSegmentReader>>>,
}

impl CommitLogReader {
    pub fn new(registry: Arc<TopicSegmentRegistry>, segment_factory: LogSegmentFactory) -> Self {
        Self {
            registry,
            segment_factory,
            current: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        self.registry.topic()
    }

    pub fn high_water_mark(&self) -> u64 {
        self.registry.high_water_mark()
    }

    async fn reader_for(&self, segment: &LogSegment) -> AppResult<Arc<LogSegmentReader>> {
        let mut current = self.current.lock().await;
        if let Some(reader) = current.as_ref() {
            if reader.segment().base_offset == segment.base_offset {
                return Ok(Arc::clone(reader));
            }
        }
        // reads still holding the stale reader finish before its files close
        if let Some(stale) = current.take() {
            debug!(
                topic = %self.topic(),
                from = stale.segment().base_offset,
                to = segment.base_offset,
                "switching segment reader"
            );
        }
        let reader = Arc::new(self.segment_factory.create_reader(segment)?);
        *current = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// The batch holding `offset`, or `None` when `offset` is not below the
    /// high-water mark.
    pub async fn read_record_batch(&self, offset: u64) -> AppResult<Option<LogRecordBatch>> {
        let Some(segment) = self.registry.segment_containing_offset(offset) else {
            trace!(topic = %self.topic(), offset, "offset beyond high-water mark");
            return Ok(None);
        };
        self.reader_for(&segment).await?.read_batch(offset).await
    }

    pub async fn read_record(&self, offset: u64) -> AppResult<Option<LogRecord>> {
        Ok(self.read_record_batch(offset).await?.and_then(|batch| {
            batch
                .into_records()
                .into_iter()
                .find(|record| record.offset == offset)
        }))
    }

    /// Raw CRC-verified frame holding `offset`, for serving without a decode.
    pub async fn read_batch_bytes(&self, offset: u64) -> AppResult<Option<(BatchHeader, Bytes)>> {
        let Some(segment) = self.registry.segment_containing_offset(offset) else {
            return Ok(None);
        };
        self.reader_for(&segment)
            .await?
            .read_batch_bytes(offset)
            .await
    }

    /// Batches across all segments holding a record stamped at or after
    /// `timestamp`, in offset order.
    pub async fn read_from_timestamp(&self, timestamp: u64) -> AppResult<Vec<LogRecordBatch>> {
        let high_water_mark = self.high_water_mark();
        let mut batches = Vec::new();
        for segment in self.registry.segments() {
            if segment.base_offset >= high_water_mark {
                break;
            }
            let reader = self.reader_for(&segment).await?;
            batches.extend(
                reader
                    .read_from_timestamp(timestamp)
                    .await?
                    .into_iter()
                    .filter(|batch| batch.last_offset() < high_water_mark),
            );
        }
        Ok(batches)
    }

    /// Releases the open segment reader.
    pub async fn dispose(&self) {
        if let Some(reader) = self.current.lock().await.take() {
            reader.dispose().await;
        }
    }
}
