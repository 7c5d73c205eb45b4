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

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::log::index_file::{OffsetIndexEntry, TimeIndexEntry, INDEX_ENTRY_SIZE};
use crate::log::LogSegment;
use crate::{AppError, AppResult, CommitLogConfig};

/// Buffered handles of the three segment files.
#[derive(Debug)]
struct SegmentFiles {
    log: BufWriter<File>,
    index: BufWriter<File>,
    time_index: BufWriter<File>,
}

impl SegmentFiles {
    fn flush(&mut self) -> io::Result<()> {
        self.log.flush()?;
        self.index.flush()?;
        self.time_index.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.log.get_ref().sync_all()?;
        self.index.get_ref().sync_all()?;
        self.time_index.get_ref().sync_all()
    }
}

#[derive(Debug)]
struct WriterState {
    /// Taken out while a blocking write is in flight.
    files: Option<SegmentFiles>,
    bytes_since_last_index_entry: u64,
    /// `None` until the first time index entry has been written.
    last_time_index_timestamp: Option<u64>,
    disposed: bool,
}

/// Append-only writer of one segment's log and index files.
///
/// Appends are serialized by an internal lock; the appender's single flush loop
/// is the only caller in practice.
#[derive(Debug)]
pub struct LogSegmentWriter {
    segment: LogSegment,
    config: Arc<CommitLogConfig>,
    current_size: AtomicU64,
    state: Mutex<WriterState>,
}

impl LogSegmentWriter {
    /// Creates the directory and all three files up front. An existing segment
    /// is reopened for append.
    pub fn open(segment: LogSegment, config: Arc<CommitLogConfig>) -> AppResult<Self> {
        if let Some(dir) = segment.log_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                AppError::DetailedIoError(format!(
                    "create segment directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        let buffer_size = config.file_buffer_size.max(1);
        let log = open_append(&segment.log_path)?;
        let current_size = log.metadata()?.len();
        let files = SegmentFiles {
            log: BufWriter::with_capacity(buffer_size, log),
            index: BufWriter::new(open_append(&segment.index_path)?),
            time_index: BufWriter::new(open_append(&segment.time_index_path)?),
        };
        debug!(
            base_offset = segment.base_offset,
            current_size, "opened segment writer"
        );

        Ok(Self {
            segment,
            config,
            current_size: AtomicU64::new(current_size),
            state: Mutex::new(WriterState {
                files: Some(files),
                bytes_since_last_index_entry: 0,
                last_time_index_timestamp: None,
                disposed: false,
            }),
        })
    }

    pub fn segment(&self) -> &LogSegment {
        &self.segment
    }

    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    pub fn should_roll(&self) -> bool {
        self.size() >= self.config.max_segment_bytes
    }

    /// Appends one encoded batch frame and returns the file position it starts at.
    ///
    /// Index entries point at the batch start: an offset index entry once the
    /// bytes written since the previous entry reach `index_interval_bytes`, a time
    /// index entry on the first append and whenever the batch timestamp moved at
    /// least `time_index_interval_ms` past the previous entry.
    pub async fn append(
        &self,
        frame: Bytes,
        base_offset: u64,
        base_timestamp: u64,
    ) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(AppError::Disposed(format!(
                "segment writer {}",
                self.segment.base_offset
            )));
        }
        let mut files = state.files.take().ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "segment writer {} lost its files after a failed write",
                self.segment.base_offset
            ))
        })?;

        let position = self.size();
        let relative_offset = self.segment.relative_offset(base_offset);
        let frame_size = frame.len() as u64;

        let accumulated = state.bytes_since_last_index_entry + frame_size;
        let index_entry = (accumulated >= self.config.index_interval_bytes).then_some(
            OffsetIndexEntry {
                relative_offset,
                file_position: position,
            },
        );
        let time_index_entry = match state.last_time_index_timestamp {
            Some(last)
                if base_timestamp.saturating_sub(last) < self.config.time_index_interval_ms =>
            {
                None
            }
            _ => Some(TimeIndexEntry {
                timestamp: base_timestamp,
                relative_offset,
            }),
        };

        let (files, result) = tokio::task::spawn_blocking(move || {
            let result = (|| -> io::Result<()> {
                files.log.write_all(&frame)?;
                if let Some(entry) = index_entry {
                    files.index.write_all(&entry.encode())?;
                }
                if let Some(entry) = time_index_entry {
                    files.time_index.write_all(&entry.encode())?;
                }
                files.flush()
            })();
            (files, result)
        })
        .await
        .map_err(|e| AppError::IllegalStateError(format!("segment write task failed: {}", e)))?;
        state.files = Some(files);
        result.map_err(|e| {
            AppError::DetailedIoError(format!(
                "append to {}: {}",
                self.segment.log_path.display(),
                e
            ))
        })?;

        self.current_size.fetch_add(frame_size, Ordering::AcqRel);
        state.bytes_since_last_index_entry = if index_entry.is_some() {
            0
        } else {
            accumulated
        };
        if let Some(entry) = time_index_entry {
            state.last_time_index_timestamp = Some(entry.timestamp);
        }
        trace!(
            base_offset,
            position,
            frame_size,
            indexed = index_entry.is_some(),
            "appended batch to segment {}",
            self.segment.base_offset
        );
        Ok(position)
    }

    /// Flushes and closes all three files. Safe to call more than once.
    pub async fn dispose(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;
        let Some(mut files) = state.files.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || files.sync())
            .await
            .map_err(|e| AppError::IllegalStateError(format!("segment sync task failed: {}", e)))??;
        debug!(
            base_offset = self.segment.base_offset,
            size = self.size(),
            "closed segment writer"
        );
        Ok(())
    }
}

/// Cuts a segment back to its intact prefix: the log to `log_size` bytes, the
/// offset index to entries pointing below it and the time index to entries of
/// batches before `next_offset`. Returns whether anything was removed.
///
/// Must run before a writer is opened on the segment.
pub fn truncate_segment(segment: &LogSegment, log_size: u64, next_offset: u64) -> AppResult<bool> {
    let log = OpenOptions::new()
        .write(true)
        .open(&segment.log_path)
        .map_err(|e| {
            AppError::DetailedIoError(format!("open {}: {}", segment.log_path.display(), e))
        })?;
    let mut truncated = false;
    if log.metadata()?.len() > log_size {
        log.set_len(log_size)?;
        log.sync_all()?;
        truncated = true;
    }

    let relative_end = segment.relative_offset(next_offset);
    truncated |= truncate_index(&segment.index_path, |entry| {
        OffsetIndexEntry::decode(entry).map(|entry| entry.file_position < log_size)
    })?;
    truncated |= truncate_index(&segment.time_index_path, |entry| {
        TimeIndexEntry::decode(entry).map(|entry| entry.relative_offset < relative_end)
    })?;
    Ok(truncated)
}

/// Keeps the leading whole entries accepted by `keep`; a missing file is left alone.
fn truncate_index<F>(path: &Path, keep: F) -> AppResult<bool>
where
    F: Fn(&[u8]) -> AppResult<bool>,
{
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(AppError::DetailedIoError(format!(
                "read {}: {}",
                path.display(),
                e
            )))
        }
    };
    let mut kept = 0;
    for entry in bytes.chunks_exact(INDEX_ENTRY_SIZE) {
        if !keep(entry)? {
            break;
        }
        kept += INDEX_ENTRY_SIZE;
    }
    if kept == bytes.len() {
        return Ok(false);
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(kept as u64)?;
    file.sync_all()?;
    debug!(
        kept_entries = kept / INDEX_ENTRY_SIZE,
        "truncated index {}",
        path.display()
    );
    Ok(true)
}

fn open_append(path: &Path) -> AppResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::DetailedIoError(format!("open {}: {}", path.display(), e)))
}
