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

use bytes::{Buf, BufMut, Bytes};

use crate::message::constants::RECORD_HEADER_SIZE;
use crate::{AppError, AppResult};

/// A single message stored in the commit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: u64,
    /// epoch milliseconds
    pub timestamp: u64,
    pub payload: Bytes,
}

impl LogRecord {
    pub fn new(offset: u64, timestamp: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            offset,
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    pub(crate) fn write_to<B: BufMut>(&self, buf: &mut B, base_timestamp: u64) {
        buf.put_u64(self.offset);
        buf.put_u64(self.timestamp - base_timestamp);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Reads one record out of an already CRC-verified, decompressed record region.
    pub(crate) fn read_from<B: Buf>(buf: &mut B, base_timestamp: u64) -> AppResult<Self> {
        if buf.remaining() < RECORD_HEADER_SIZE {
            return Err(AppError::CorruptMessage(format!(
                "record header needs {} bytes, only {} left in batch",
                RECORD_HEADER_SIZE,
                buf.remaining()
            )));
        }
        let offset = buf.get_u64();
        let timestamp_delta = buf.get_u64();
        let payload_length = buf.get_u32() as usize;
        if buf.remaining() < payload_length {
            return Err(AppError::CorruptMessage(format!(
                "record {} declares {} payload bytes, only {} left in batch",
                offset,
                payload_length,
                buf.remaining()
            )));
        }
        let timestamp = base_timestamp.checked_add(timestamp_delta).ok_or_else(|| {
            AppError::CorruptMessage(format!(
                "record {} timestamp delta {} overflows base timestamp {}",
                offset, timestamp_delta, base_timestamp
            ))
        })?;
        let payload = buf.copy_to_bytes(payload_length);
        Ok(Self {
            offset,
            timestamp,
            payload,
        })
    }
}
