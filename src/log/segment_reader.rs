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

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::log::index_file::IndexCache;
use crate::log::LogSegment;
use crate::message::constants::RECORD_BATCH_OVERHEAD;
use crate::message::{BatchHeader, LogRecordBatch};
use crate::{AppError, AppResult, CommitLogConfig};

/// Intact prefix of a segment found by [`LogSegmentReader::recover_tail`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredTail {
    /// Offset after the last intact batch, `None` when there is none.
    pub next_offset: Option<u64>,
    /// Log bytes covered by intact batches.
    pub valid_bytes: u64,
    /// Greatest base timestamp among the scanned batches.
    pub last_timestamp: Option<u64>,
}

#[derive(Debug)]
struct ReaderFiles {
    log: BufReader<File>,
    index: Option<File>,
    time_index: Option<File>,
    offset_cache: IndexCache,
    time_cache: IndexCache,
}

impl ReaderFiles {
    /// File position to start scanning from for `offset`.
    fn position_for_offset(&mut self, base_offset: u64, offset: u64) -> io::Result<u64> {
        let Some(index) = self.index.as_mut() else {
            return Ok(0);
        };
        self.offset_cache.refresh(index)?;
        Ok(self
            .offset_cache
            .lookup(offset.saturating_sub(base_offset))
            .map(|(_, position)| position)
            .unwrap_or(0))
    }

    /// File position to start scanning from for `timestamp`, through the time
    /// index and then the offset index.
    fn position_for_timestamp(&mut self, base_offset: u64, timestamp: u64) -> io::Result<u64> {
        let Some(time_index) = self.time_index.as_mut() else {
            return Ok(0);
        };
        self.time_cache.refresh(time_index)?;
        match self.time_cache.lookup(timestamp) {
            Some((_, relative_offset)) => {
                self.position_for_offset(base_offset, base_offset + relative_offset)
            }
            None => Ok(0),
        }
    }

    /// Reads the next complete frame. A missing or partial frame at the end of
    /// the file ends the scan.
    fn next_frame(&mut self) -> AppResult<Option<(BatchHeader, Bytes)>> {
        let mut header_bytes = [0u8; RECORD_BATCH_OVERHEAD];
        if !read_fully(&mut self.log, &mut header_bytes)? {
            return Ok(None);
        }
        let header = BatchHeader::parse(&header_bytes)?;
        let mut frame = BytesMut::zeroed(header.frame_size());
        frame[..RECORD_BATCH_OVERHEAD].copy_from_slice(&header_bytes);
        if !read_fully(&mut self.log, &mut frame[RECORD_BATCH_OVERHEAD..])? {
            return Ok(None);
        }
        Ok(Some((header, frame.freeze())))
    }

    fn seek(&mut self, position: u64) -> io::Result<()> {
        self.log.seek(SeekFrom::Start(position)).map(|_| ())
    }

    fn find_frame(
        &mut self,
        base_offset: u64,
        offset: u64,
    ) -> AppResult<Option<(BatchHeader, Bytes)>> {
        let position = self.position_for_offset(base_offset, offset)?;
        self.seek(position)?;
        while let Some((header, frame)) = self.next_frame()? {
            if header.contains(offset) {
                return Ok(Some((header, frame)));
            }
            if header.base_offset > offset {
                break;
            }
        }
        Ok(None)
    }
}

/// `read_exact` that reports a clean or torn end of file as `false`.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Offset-addressed reads over one segment.
///
/// The log file is read concurrently with the writer appending to it; only
/// complete frames are ever returned. The index files are optional.
#[derive(Debug)]
pub struct LogSegmentReader {
    segment: LogSegment,
    files: Mutex<Option<ReaderFiles>>,
}

impl LogSegmentReader {
    pub fn open(segment: LogSegment, config: &CommitLogConfig) -> AppResult<Self> {
        let log = File::open(&segment.log_path).map_err(|e| {
            AppError::DetailedIoError(format!("open {}: {}", segment.log_path.display(), e))
        })?;
        let files = ReaderFiles {
            log: BufReader::with_capacity(config.reader_log_buffer_size.max(1), log),
            index: open_optional(&segment.index_path)?,
            time_index: open_optional(&segment.time_index_path)?,
            offset_cache: IndexCache::with_capacity(config.reader_index_buffer_size),
            time_cache: IndexCache::with_capacity(config.reader_index_buffer_size),
        };
        Ok(Self {
            segment,
            files: Mutex::new(Some(files)),
        })
    }

    pub fn segment(&self) -> &LogSegment {
        &self.segment
    }

    /// Moves the file handles onto the blocking pool for `f` and puts them back
    /// afterwards.
    async fn with_files<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ReaderFiles, u64) -> AppResult<T> + Send + 'static,
    {
        let mut guard = self.files.lock().await;
        let mut files = guard.take().ok_or_else(|| {
            AppError::Disposed(format!("segment reader {}", self.segment.base_offset))
        })?;
        let base_offset = self.segment.base_offset;
        let (files, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut files, base_offset);
            (files, result)
        })
        .await
        .map_err(|e| AppError::IllegalStateError(format!("segment read task failed: {}", e)))?;
        *guard = Some(files);
        result
    }

    /// Decodes the batch containing `offset`, or `None` if no complete batch in
    /// this segment holds it.
    pub async fn read_batch(&self, offset: u64) -> AppResult<Option<LogRecordBatch>> {
        let frame = self
            .with_files(move |files, base_offset| files.find_frame(base_offset, offset))
            .await?;
        match frame {
            Some((_, mut frame)) => LogRecordBatch::read_batch(&mut frame).map(Some),
            None => Ok(None),
        }
    }

    /// Raw frame of the batch containing `offset`, CRC-verified but not decoded.
    pub async fn read_batch_bytes(&self, offset: u64) -> AppResult<Option<(BatchHeader, Bytes)>> {
        let frame = self
            .with_files(move |files, base_offset| files.find_frame(base_offset, offset))
            .await?;
        if let Some((header, frame)) = &frame {
            header.verify_crc(frame)?;
        }
        Ok(frame)
    }

    /// Batches overlapping `[start, end)`.
    pub async fn read_range(&self, start: u64, end: u64) -> AppResult<Vec<LogRecordBatch>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let frames = self
            .with_files(move |files, base_offset| {
                let position = files.position_for_offset(base_offset, start)?;
                files.seek(position)?;
                let mut frames = Vec::new();
                while let Some((header, frame)) = files.next_frame()? {
                    if header.base_offset >= end {
                        break;
                    }
                    if header.last_offset >= start {
                        frames.push(frame);
                    }
                }
                Ok(frames)
            })
            .await?;
        decode_all(frames)
    }

    /// Batches holding at least one record with a timestamp at or after `timestamp`.
    pub async fn read_from_timestamp(&self, timestamp: u64) -> AppResult<Vec<LogRecordBatch>> {
        let frames = self
            .with_files(move |files, base_offset| {
                let position = files.position_for_timestamp(base_offset, timestamp)?;
                files.seek(position)?;
                let mut frames = Vec::new();
                while let Some((_, frame)) = files.next_frame()? {
                    frames.push(frame);
                }
                Ok(frames)
            })
            .await?;
        let batches = decode_all(frames)?;
        Ok(batches
            .into_iter()
            .filter(|batch| batch.max_timestamp() >= timestamp)
            .collect())
    }

    /// Offset after the last complete, intact batch, or `None` for an empty
    /// segment. A torn or corrupt tail stops the scan.
    pub async fn recover_high_water_mark(&self) -> AppResult<Option<u64>> {
        Ok(self.recover_tail().await?.next_offset)
    }

    /// Scans from the last offset index entry to the end of the intact prefix
    /// of the log file.
    pub async fn recover_tail(&self) -> AppResult<RecoveredTail> {
        let log_path = self.segment.log_path.clone();
        self.with_files(move |files, base_offset| {
            if let Some(index) = files.index.as_mut() {
                files.offset_cache.refresh(index)?;
            }
            let log_size = files.log.get_ref().metadata()?.len();
            // an entry past the end of the log was written ahead of its batch
            let mut tail = match files.offset_cache.last() {
                Some((relative_offset, position)) if position < log_size => RecoveredTail {
                    next_offset: Some(base_offset + relative_offset),
                    valid_bytes: position,
                    last_timestamp: None,
                },
                _ => RecoveredTail::default(),
            };
            files.seek(tail.valid_bytes)?;

            loop {
                match files.next_frame() {
                    Ok(Some((header, frame))) => {
                        if let Err(e) = header.verify_crc(&frame) {
                            warn!(
                                "stopping recovery of {} at corrupt batch: {}",
                                log_path.display(),
                                e
                            );
                            break;
                        }
                        tail.next_offset = Some(header.last_offset + 1);
                        tail.valid_bytes += header.frame_size() as u64;
                        let timestamp = tail.last_timestamp.unwrap_or_default();
                        tail.last_timestamp = Some(timestamp.max(header.base_timestamp));
                    }
                    Ok(None) => break,
                    Err(e) if e.is_data_error() => {
                        warn!(
                            "stopping recovery of {} at corrupt tail: {}",
                            log_path.display(),
                            e
                        );
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            trace!(?tail, log_size, "recovered {}", log_path.display());
            Ok(tail)
        })
        .await
    }

    /// Releases the file handles. Later reads fail with `Disposed`.
    pub async fn dispose(&self) {
        self.files.lock().await.take();
    }
}

fn decode_all(frames: Vec<Bytes>) -> AppResult<Vec<LogRecordBatch>> {
    frames
        .into_iter()
        .map(|mut frame| LogRecordBatch::read_batch(&mut frame))
        .collect()
}

fn open_optional(path: &Path) -> AppResult<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::DetailedIoError(format!(
            "open {}: {}",
            path.display(),
            e
        ))),
    }
}
