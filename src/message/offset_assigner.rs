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

use tracing::trace;

use crate::message::batch_header::{read_u32, BatchHeader};
use crate::message::constants::*;
use crate::{AppError, AppResult};

/// Checks that `batch` is a complete, uncompressed, intact frame whose offsets
/// can be assigned in place. Returns its record count.
pub fn validate_encoded_batch(batch: &[u8]) -> AppResult<usize> {
    inspect(batch).map(|(_, positions)| positions.len())
}

/// Rewrites the offsets of a publisher-encoded batch in place.
///
/// The frame is checked against its stored CRC, every record offset is replaced
/// with `base_offset, base_offset + 1, ...`, the header's base and last offsets
/// are patched and the CRC is recomputed. Payload bytes are never copied.
///
/// The buffer is left unmodified when any check fails. Returns the next free
/// offset.
pub fn assign_offsets(base_offset: u64, batch: &mut [u8]) -> AppResult<u64> {
    let (header, record_positions) = inspect(batch)?;
    let records = header.records_range();

    let mut offset = base_offset;
    for position in &record_positions {
        let at = records.start + position + RECORD_OFFSET_OFFSET;
        batch[at..at + RECORD_OFFSET_LENGTH].copy_from_slice(&offset.to_be_bytes());
        offset += 1;
    }
    let last_offset = offset - 1;

    batch[BASE_OFFSET_OFFSET..BASE_OFFSET_OFFSET + BASE_OFFSET_LENGTH]
        .copy_from_slice(&base_offset.to_be_bytes());
    batch[LAST_OFFSET_OFFSET..LAST_OFFSET_OFFSET + LAST_OFFSET_LENGTH]
        .copy_from_slice(&last_offset.to_be_bytes());
    let crc = crc32c::crc32c(&batch[records]);
    batch[CRC_OFFSET..CRC_OFFSET + CRC_LENGTH].copy_from_slice(&crc.to_be_bytes());

    trace!(
        base_offset,
        last_offset,
        records = record_positions.len(),
        "assigned offsets to encoded batch"
    );
    Ok(offset)
}

fn inspect(batch: &[u8]) -> AppResult<(BatchHeader, Vec<usize>)> {
    let header = BatchHeader::parse(batch)?;
    if batch.len() != header.frame_size() {
        return Err(AppError::CorruptMessage(format!(
            "batch frame declares {} bytes but buffer holds {}",
            header.frame_size(),
            batch.len()
        )));
    }
    if header.compression()?.is_compressed() {
        return Err(AppError::InvalidRequest(
            "compressed batches cannot have their offsets assigned in place".to_string(),
        ));
    }
    header.verify_crc(batch)?;

    let record_positions = record_positions(&batch[header.records_range()])?;
    if record_positions.is_empty() {
        return Err(AppError::InvalidRequest(
            "batch contains no records".to_string(),
        ));
    }
    Ok((header, record_positions))
}

/// Walks the fixed-size record headers, returning each record's start position.
fn record_positions(records: &[u8]) -> AppResult<Vec<usize>> {
    let mut positions = Vec::new();
    let mut position = 0;
    while position < records.len() {
        if records.len() - position < RECORD_HEADER_SIZE {
            return Err(AppError::CorruptMessage(format!(
                "record header at byte {} is truncated",
                position
            )));
        }
        let payload_length = read_u32(records, position + PAYLOAD_LENGTH_OFFSET) as usize;
        let end = position + RECORD_HEADER_SIZE + payload_length;
        if end > records.len() {
            return Err(AppError::CorruptMessage(format!(
                "record at byte {} declares {} payload bytes past the end of the batch",
                position, payload_length
            )));
        }
        positions.push(position);
        position = end;
    }
    Ok(positions)
}
