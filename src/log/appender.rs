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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::log::{LogSegmentFactory, LogSegmentWriter, TopicSegmentRegistry};
use crate::message::{
    assign_offsets, validate_encoded_batch, BatchHeader, CompressionType, LogRecord,
    LogRecordBatch,
};
use crate::{AppError, AppResult};

/// Entry in an appender's pending queue.
#[derive(Debug)]
enum PendingAppend {
    Payload(Bytes),
    /// Publisher-encoded frame; offsets are assigned at flush time.
    EncodedBatch(BytesMut),
}

type FlushReply = oneshot::Sender<AppResult<u64>>;

/// Per-topic batching writer.
///
/// Producers only touch a bounded queue; a single background task drains it on
/// every flush interval, turns the drained payloads into one batch with
/// consecutive offsets starting at the high-water mark, writes it to the active
/// segment and only then advances the high-water mark. Rolling happens on the
/// same task, before a write, once the active segment reached its size limit.
#[derive(Debug)]
pub struct CommitLogAppender {
    topic: String,
    sender: async_channel::Sender<PendingAppend>,
    flush_requests: mpsc::Sender<FlushReply>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<AppResult<()>>>>,
}

impl CommitLogAppender {
    /// Opens a writer on the registry's active segment and starts the flush loop.
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<TopicSegmentRegistry>,
        segment_factory: LogSegmentFactory,
        flush_interval: Duration,
        compression: CompressionType,
    ) -> AppResult<Self> {
        let topic = registry.topic().to_string();
        let writer = segment_factory.create_writer(&registry.active_segment())?;
        let queue_capacity = segment_factory.config().queue_capacity.max(1);
        let (sender, receiver) = async_channel::bounded(queue_capacity);
        let (flush_requests, flush_receiver) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let worker = AppendWorker {
            directory: registry.directory().to_path_buf(),
            registry,
            segment_factory,
            writer,
            receiver,
            flush_receiver,
            shutdown: shutdown.clone(),
            flush_interval,
            compression,
        };
        let span = info_span!("commit_log_appender", topic = %topic);
        let handle = tokio::spawn(worker.run().instrument(span));
        info!(topic = %topic, ?flush_interval, "commit log appender started");

        Ok(Self {
            topic,
            sender,
            flush_requests,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queues one payload; waits while the queue is full.
    pub async fn append(&self, payload: impl Into<Bytes>) -> AppResult<()> {
        self.enqueue(PendingAppend::Payload(payload.into())).await
    }

    /// Like [`append`](Self::append), but gives up waiting for queue space once
    /// `cancel` fires. A payload that made it into the queue is flushed
    /// regardless.
    pub async fn append_cancellable(
        &self,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let item = PendingAppend::Payload(payload.into());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled(format!("append to topic {}", self.topic))),
            result = self.enqueue(item) => result,
        }
    }

    /// Queues a publisher-encoded batch frame. Its offsets are rewritten in place
    /// at flush time, keeping its position in the queue relative to single
    /// payload appends.
    pub async fn append_batch(&self, frame: BytesMut) -> AppResult<()> {
        validate_encoded_batch(&frame)?;
        self.enqueue(PendingAppend::EncodedBatch(frame)).await
    }

    async fn enqueue(&self, item: PendingAppend) -> AppResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(self.disposed_error());
        }
        self.sender.send(item).await.map_err(|_| {
            if self.shutdown.is_cancelled() {
                self.disposed_error()
            } else {
                AppError::IllegalStateError(format!(
                    "appender for topic {} stopped after a failed flush",
                    self.topic
                ))
            }
        })
    }

    /// Flushes everything queued so far and returns the resulting high-water mark.
    pub async fn flush(&self) -> AppResult<u64> {
        if self.shutdown.is_cancelled() {
            return Err(self.disposed_error());
        }
        let (reply, response) = oneshot::channel();
        self.flush_requests.send(reply).await.map_err(|_| {
            AppError::IllegalStateError(format!("appender for topic {} is not running", self.topic))
        })?;
        response
            .await
            .map_err(|e| AppError::ChannelRecvError(e.to_string()))?
    }

    /// Stops accepting appends, flushes what is still queued and closes the
    /// active segment. Returns the error that stopped the flush loop, if any.
    /// Later calls return `Ok(())`.
    pub async fn dispose(&self) -> AppResult<()> {
        self.sender.close();
        self.shutdown.cancel();
        let mut worker = self.worker.lock().await;
        let Some(handle) = worker.take() else {
            return Ok(());
        };
        let result = handle
            .await
            .map_err(|e| AppError::IllegalStateError(format!("appender task failed: {}", e)))?;
        debug!(topic = %self.topic, "commit log appender disposed");
        result
    }

    fn disposed_error(&self) -> AppError {
        AppError::Disposed(format!("appender for topic {}", self.topic))
    }
}

/// Takes at most `limit` queued appends, so producers refilling the queue
/// during a flush wait for the next cycle.
fn drain_pending(
    receiver: &async_channel::Receiver<PendingAppend>,
    limit: usize,
) -> Vec<PendingAppend> {
    let mut pending = Vec::with_capacity(limit);
    while pending.len() < limit {
        match receiver.try_recv() {
            Ok(item) => pending.push(item),
            Err(_) => break,
        }
    }
    pending
}

struct AppendWorker {
    directory: PathBuf,
    registry: Arc<TopicSegmentRegistry>,
    segment_factory: LogSegmentFactory,
    writer: LogSegmentWriter,
    receiver: async_channel::Receiver<PendingAppend>,
    flush_receiver: mpsc::Receiver<FlushReply>,
    shutdown: CancellationToken,
    flush_interval: Duration,
    compression: CompressionType,
}

impl AppendWorker {
    async fn run(mut self) -> AppResult<()> {
        let mut ticker = time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("flush loop cancelled, flushing remaining appends");
                    break self.flush_pending().await.map(|_| ());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_pending().await {
                        break Err(e);
                    }
                    if self.receiver.is_closed() && self.receiver.is_empty() {
                        break Ok(());
                    }
                }
                Some(reply) = self.flush_receiver.recv() => {
                    match self.flush_pending().await {
                        Ok(high_water_mark) => {
                            let _ = reply.send(Ok(high_water_mark));
                        }
                        Err(e) => {
                            // refuse appends before the caller learns about the failure
                            self.receiver.close();
                            let _ = reply.send(Err(AppError::IllegalStateError(format!(
                                "flush of topic {} failed: {}",
                                self.registry.topic(),
                                e
                            ))));
                            break Err(e);
                        }
                    }
                }
            }
        };

        if let Err(e) = &result {
            error!("flush loop stopped, queued appends are dropped: {}", e);
        }
        // nothing can be appended once the loop is gone
        self.receiver.close();
        let disposed = self.writer.dispose().await;
        result.and(disposed)
    }

    /// Drains the queue, writes the drained appends and returns the high-water
    /// mark. Appends drained in a failed cycle are lost.
    async fn flush_pending(&mut self) -> AppResult<u64> {
        let pending = drain_pending(&self.receiver, self.receiver.len());
        if pending.is_empty() {
            return Ok(self.registry.high_water_mark());
        }
        trace!(count = pending.len(), "flushing pending appends");

        let mut payloads = Vec::new();
        for item in pending {
            match item {
                PendingAppend::Payload(payload) => payloads.push(payload),
                PendingAppend::EncodedBatch(frame) => {
                    self.write_payloads(std::mem::take(&mut payloads)).await?;
                    self.write_encoded(frame).await?;
                }
            }
        }
        self.write_payloads(payloads).await?;
        Ok(self.registry.high_water_mark())
    }

    async fn write_payloads(&mut self, payloads: Vec<Bytes>) -> AppResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        self.roll_if_needed().await?;

        let base_offset = self.registry.high_water_mark();
        let timestamp = self.next_timestamp();
        let records = payloads
            .into_iter()
            .zip(base_offset..)
            .map(|(payload, offset)| LogRecord::new(offset, timestamp, payload))
            .collect();
        let batch = LogRecordBatch::new(base_offset, records, self.compression)?;
        let frame = batch.encode()?.freeze();

        self.writer.append(frame, base_offset, timestamp).await?;
        self.registry.update_current_offset(batch.last_offset() + 1);
        Ok(())
    }

    async fn write_encoded(&mut self, mut frame: BytesMut) -> AppResult<()> {
        self.roll_if_needed().await?;

        let base_offset = self.registry.high_water_mark();
        let next_offset = match assign_offsets(base_offset, &mut frame) {
            Ok(next_offset) => next_offset,
            Err(e) => {
                // validated on enqueue, so this only drops the one batch
                warn!("dropping encoded batch: {}", e);
                return Ok(());
            }
        };
        let header = BatchHeader::parse(&frame)?;

        self.writer
            .append(frame.freeze(), base_offset, header.base_timestamp)
            .await?;
        self.registry.update_current_offset(next_offset);
        Ok(())
    }

    /// Wall clock in epoch milliseconds, never behind the last stamped batch of
    /// the topic, including batches recovered from disk.
    fn next_timestamp(&self) -> u64 {
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let timestamp = self.registry.last_timestamp().max(now);
        self.registry.update_last_timestamp(timestamp);
        timestamp
    }

    /// Closes the full active segment and opens a new one at the high-water mark.
    async fn roll_if_needed(&mut self) -> AppResult<()> {
        if !self.writer.should_roll() {
            return Ok(());
        }
        let base_offset = self.registry.high_water_mark();
        let previous = self.writer.segment().base_offset;
        self.writer.dispose().await?;

        let segment = self
            .segment_factory
            .create_log_segment(&self.directory, base_offset);
        self.writer = self.segment_factory.create_writer(&segment)?;
        self.registry.update_active_segment(segment);
        info!(previous, base_offset, "rolled to new segment");
        Ok(())
    }
}
