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

//! Message Format Constants
//!
//! One big-endian, fixed-width layout is shared by the segment files, the
//! publisher wire path and the in-place offset assigner.
//!
//! # Batch Format
//!
//! - Base offset (8 bytes)
//! - Batch length (4 bytes, counts every byte after this field)
//! - Last offset (8 bytes)
//! - Magic byte (1 byte)
//! - CRC-32C of the stored record bytes (4 bytes)
//! - Attributes (1 byte, bit 0..=2 compression codec)
//! - Base timestamp (8 bytes)
//! - Record bytes length (4 bytes)
//! - Record bytes (variable length, possibly compressed)
//!
//! # Record Format
//!
//! - Absolute offset (8 bytes)
//! - Timestamp delta from the batch base timestamp (8 bytes)
//! - Payload length (4 bytes)
//! - Payload (variable length)

// Record batch field offsets and lengths
pub const BASE_OFFSET_OFFSET: usize = 0;
pub const BASE_OFFSET_LENGTH: usize = 8;
pub const LENGTH_OFFSET: usize = BASE_OFFSET_OFFSET + BASE_OFFSET_LENGTH;
pub const LENGTH_LENGTH: usize = 4;
/// Bytes preceding the part of the frame counted by the batch length.
pub const LOG_OVERHEAD: usize = LENGTH_OFFSET + LENGTH_LENGTH;
pub const LAST_OFFSET_OFFSET: usize = LOG_OVERHEAD;
pub const LAST_OFFSET_LENGTH: usize = 8;
pub const MAGIC_OFFSET: usize = LAST_OFFSET_OFFSET + LAST_OFFSET_LENGTH;
pub const MAGIC_LENGTH: usize = 1;
pub const CRC_OFFSET: usize = MAGIC_OFFSET + MAGIC_LENGTH;
pub const CRC_LENGTH: usize = 4;
pub const ATTRIBUTES_OFFSET: usize = CRC_OFFSET + CRC_LENGTH;
pub const ATTRIBUTES_LENGTH: usize = 1;
pub const BASE_TIMESTAMP_OFFSET: usize = ATTRIBUTES_OFFSET + ATTRIBUTES_LENGTH;
pub const BASE_TIMESTAMP_LENGTH: usize = 8;
pub const RECORD_BYTES_LENGTH_OFFSET: usize = BASE_TIMESTAMP_OFFSET + BASE_TIMESTAMP_LENGTH;
pub const RECORD_BYTES_LENGTH_LENGTH: usize = 4;
pub const RECORDS_OFFSET: usize = RECORD_BYTES_LENGTH_OFFSET + RECORD_BYTES_LENGTH_LENGTH;
pub const RECORD_BATCH_OVERHEAD: usize = RECORDS_OFFSET;
/// Fixed part of the batch length that does not belong to the record bytes.
pub const BATCH_LENGTH_FIXED_PART: usize = RECORDS_OFFSET - LOG_OVERHEAD;

// Record field offsets and lengths
pub const RECORD_OFFSET_OFFSET: usize = 0;
pub const RECORD_OFFSET_LENGTH: usize = 8;
pub const TIMESTAMP_DELTA_OFFSET: usize = RECORD_OFFSET_OFFSET + RECORD_OFFSET_LENGTH;
pub const TIMESTAMP_DELTA_LENGTH: usize = 8;
pub const PAYLOAD_LENGTH_OFFSET: usize = TIMESTAMP_DELTA_OFFSET + TIMESTAMP_DELTA_LENGTH;
pub const PAYLOAD_LENGTH_LENGTH: usize = 4;
pub const RECORD_HEADER_SIZE: usize = PAYLOAD_LENGTH_OFFSET + PAYLOAD_LENGTH_LENGTH;

/// Magic value for the current batch format version
pub const MAGIC: u8 = 1;
/// Attribute bits holding the compression codec id
pub const COMPRESSION_CODEC_MASK: u8 = 0x07;
