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

use std::fmt::{Display, Formatter};

use chrono::{Local, TimeZone};

use crate::message::compressor::CompressionType;
use crate::message::constants::*;
use crate::{AppError, AppResult};

/// Fixed-width header of an encoded batch frame, read without touching the record bytes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct BatchHeader {
    pub base_offset: u64,
    pub batch_length: u32,
    pub last_offset: u64,
    pub magic: u8,
    pub crc: u32,
    pub attributes: u8,
    pub base_timestamp: u64,
    pub record_bytes_length: u32,
}

impl BatchHeader {
    /// Parses the header at the start of `bytes`.
    ///
    /// Fails with `UnexpectedEof` when fewer than [`RECORD_BATCH_OVERHEAD`] bytes are
    /// present, `InvalidMagic` on a version mismatch and `CorruptMessage` when the
    /// batch length disagrees with the record bytes length.
    pub fn parse(bytes: &[u8]) -> AppResult<Self> {
        if bytes.len() < RECORD_BATCH_OVERHEAD {
            return Err(AppError::UnexpectedEof(format!(
                "batch header needs {} bytes, only {} available",
                RECORD_BATCH_OVERHEAD,
                bytes.len()
            )));
        }
        let magic = bytes[MAGIC_OFFSET];
        if magic != MAGIC {
            return Err(AppError::InvalidMagic {
                expected: MAGIC,
                actual: magic,
            });
        }
        let header = BatchHeader {
            base_offset: read_u64(bytes, BASE_OFFSET_OFFSET),
            batch_length: read_u32(bytes, LENGTH_OFFSET),
            last_offset: read_u64(bytes, LAST_OFFSET_OFFSET),
            magic,
            crc: read_u32(bytes, CRC_OFFSET),
            attributes: bytes[ATTRIBUTES_OFFSET],
            base_timestamp: read_u64(bytes, BASE_TIMESTAMP_OFFSET),
            record_bytes_length: read_u32(bytes, RECORD_BYTES_LENGTH_OFFSET),
        };
        let expected_length = BATCH_LENGTH_FIXED_PART as u64 + header.record_bytes_length as u64;
        if header.batch_length as u64 != expected_length {
            return Err(AppError::CorruptMessage(format!(
                "batch at offset {} declares length {} but its record bytes need {}",
                header.base_offset, header.batch_length, expected_length
            )));
        }
        Ok(header)
    }

    /// Total size of the frame including the offset/length prefix.
    pub fn frame_size(&self) -> usize {
        LOG_OVERHEAD + self.batch_length as usize
    }

    pub fn records_range(&self) -> std::ops::Range<usize> {
        RECORDS_OFFSET..RECORDS_OFFSET + self.record_bytes_length as usize
    }

    pub fn compression(&self) -> AppResult<CompressionType> {
        CompressionType::from_attributes(self.attributes)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset <= self.last_offset
    }

    /// Recomputes the CRC over the record bytes of a complete frame.
    pub fn verify_crc(&self, frame: &[u8]) -> AppResult<()> {
        let range = self.records_range();
        if frame.len() < range.end {
            return Err(AppError::CorruptMessage(format!(
                "batch at offset {} declares {} record bytes, only {} available",
                self.base_offset,
                self.record_bytes_length,
                frame.len().saturating_sub(RECORDS_OFFSET)
            )));
        }
        let computed = crc32c::crc32c(&frame[range]);
        if computed != self.crc {
            return Err(AppError::CrcMismatch {
                base_offset: self.base_offset,
                stored: self.crc,
                computed,
            });
        }
        Ok(())
    }
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(raw)
}

impl Display for BatchHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let base_timestamp = Local
            .timestamp_millis_opt(self.base_timestamp as i64)
            .single()
            .map(|t| t.to_string())
            .unwrap_or_else(|| self.base_timestamp.to_string());
        f.debug_struct("BatchHeader")
            .field("base_offset", &self.base_offset)
            .field("batch_length", &self.batch_length)
            .field("last_offset", &self.last_offset)
            .field("magic", &self.magic)
            .field("crc", &self.crc)
            .field("attributes", &self.attributes)
            .field("base_timestamp", &base_timestamp)
            .field("record_bytes_length", &self.record_bytes_length)
            .finish()
    }
}
