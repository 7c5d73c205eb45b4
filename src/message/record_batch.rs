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

//! Batch binary codec.
//!
//! A [`LogRecordBatch`] is the unit written to segment files and sent over the
//! wire. Encoding lays out the fixed header described in
//! [`constants`](crate::message::constants), followed by the (possibly
//! compressed) record bytes. Decoding is fail-closed: truncated input, a wrong
//! magic byte, inconsistent lengths and CRC mismatches are all hard errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::batch_header::BatchHeader;
use crate::message::compressor::CompressionType;
use crate::message::constants::*;
use crate::message::record::LogRecord;
use crate::{AppError, AppResult};

/// An ordered, non-empty run of records with contiguous offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecordBatch {
    magic: u8,
    base_offset: u64,
    records: Vec<LogRecord>,
    compression: CompressionType,
}

impl LogRecordBatch {
    /// Creates a batch, checking that the records start at `base_offset` and have
    /// no gaps or duplicates.
    pub fn new(
        base_offset: u64,
        records: Vec<LogRecord>,
        compression: CompressionType,
    ) -> AppResult<Self> {
        Self::check_records(base_offset, &records)?;
        Ok(Self {
            magic: MAGIC,
            base_offset,
            records,
            compression,
        })
    }

    fn check_records(base_offset: u64, records: &[LogRecord]) -> AppResult<()> {
        if records.is_empty() {
            return Err(AppError::InvalidRequest(format!(
                "batch at offset {} has no records",
                base_offset
            )));
        }
        for (index, record) in records.iter().enumerate() {
            let expected = base_offset + index as u64;
            if record.offset != expected {
                return Err(AppError::InvalidRequest(format!(
                    "record offsets must be contiguous from {}: expected {}, found {}",
                    base_offset, expected, record.offset
                )));
            }
        }
        Ok(())
    }

    pub fn magic(&self) -> u8 {
        self.magic
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn last_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64 - 1
    }

    /// Smallest record timestamp; record timestamps are stored as deltas from it.
    pub fn base_timestamp(&self) -> u64 {
        self.records
            .iter()
            .map(|record| record.timestamp)
            .min()
            .unwrap_or_default()
    }

    pub fn max_timestamp(&self) -> u64 {
        self.records
            .iter()
            .map(|record| record.timestamp)
            .max()
            .unwrap_or_default()
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn compressed(&self) -> bool {
        self.compression.is_compressed()
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset <= self.last_offset()
    }

    /// Writes the framed batch into `buf`.
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> AppResult<()> {
        let base_timestamp = self.base_timestamp();
        let records_size = self.records.iter().map(LogRecord::encoded_size).sum();
        let mut record_bytes = BytesMut::with_capacity(records_size);
        for record in &self.records {
            record.write_to(&mut record_bytes, base_timestamp);
        }

        let stored = self
            .compression
            .compressor()
            .compress(record_bytes.freeze())?;
        let record_bytes_length = u32::try_from(stored.len())
            .ok()
            .filter(|len| (*len as usize) <= u32::MAX as usize - BATCH_LENGTH_FIXED_PART)
            .ok_or_else(|| {
                AppError::InvalidRequest(format!(
                    "batch at offset {} is too large: {} record bytes",
                    self.base_offset,
                    stored.len()
                ))
            })?;
        let crc = crc32c::crc32c(&stored);

        buf.put_u64(self.base_offset);
        buf.put_u32(BATCH_LENGTH_FIXED_PART as u32 + record_bytes_length);
        buf.put_u64(self.last_offset());
        buf.put_u8(self.magic);
        buf.put_u32(crc);
        buf.put_u8(self.compression.codec_id());
        buf.put_u64(base_timestamp);
        buf.put_u32(record_bytes_length);
        buf.put_slice(&stored);
        Ok(())
    }

    pub fn encode(&self) -> AppResult<BytesMut> {
        let payload_size: usize = self.records.iter().map(LogRecord::encoded_size).sum();
        let mut buf = BytesMut::with_capacity(RECORD_BATCH_OVERHEAD + payload_size);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf` and advances past it.
    ///
    /// `buf` is left untouched when decoding fails.
    pub fn read_batch(buf: &mut Bytes) -> AppResult<Self> {
        let header = BatchHeader::parse(buf)?;
        let frame_size = header.frame_size();
        if buf.len() < frame_size {
            return Err(AppError::CorruptMessage(format!(
                "batch at offset {} declares {} bytes, only {} available",
                header.base_offset,
                frame_size,
                buf.len()
            )));
        }
        header.verify_crc(&buf[..frame_size])?;

        let compression = header.compression()?;
        let stored = buf.slice(header.records_range());
        let mut record_bytes = compression.compressor().decompress(stored)?;

        let mut records = Vec::new();
        while record_bytes.has_remaining() {
            records.push(LogRecord::read_from(
                &mut record_bytes,
                header.base_timestamp,
            )?);
        }
        Self::check_records(header.base_offset, &records)
            .map_err(|e| AppError::CorruptMessage(e.to_string()))?;
        let last_offset = header.base_offset + records.len() as u64 - 1;
        if last_offset != header.last_offset {
            return Err(AppError::CorruptMessage(format!(
                "batch at offset {} declares last offset {} but holds records up to {}",
                header.base_offset, header.last_offset, last_offset
            )));
        }

        buf.advance(frame_size);
        Ok(Self {
            magic: header.magic,
            base_offset: header.base_offset,
            records,
            compression,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rstest::rstest;

    fn sample_batch(
        base_offset: u64,
        payloads: &[&str],
        compression: CompressionType,
    ) -> LogRecordBatch {
        let records = payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                LogRecord::new(
                    base_offset + i as u64,
                    1_700_000_000_000 + i as u64 * 3,
                    Bytes::copy_from_slice(payload.as_bytes()),
                )
            })
            .collect();
        LogRecordBatch::new(base_offset, records, compression).unwrap()
    }

    #[rstest]
    #[case(0, vec!["p1"], CompressionType::None)]
    #[case(42, vec!["", "x", ""], CompressionType::None)]
    #[case(7, vec!["hello", "world"], CompressionType::Lz4)]
    #[case(u32::MAX as u64, vec![""], CompressionType::Lz4)]
    fn test_round_trip(
        #[case] base_offset: u64,
        #[case] payloads: Vec<&str>,
        #[case] compression: CompressionType,
    ) {
        let batch = sample_batch(base_offset, &payloads, compression);
        let mut frame = batch.encode().unwrap().freeze();
        let decoded = LogRecordBatch::read_batch(&mut frame).unwrap();

        assert!(frame.is_empty());
        assert_eq!(decoded.base_offset(), base_offset);
        assert_eq!(decoded.compressed(), compression.is_compressed());
        assert_eq!(decoded.records().len(), payloads.len());
        for (record, original) in decoded.records().iter().zip(batch.records()) {
            assert_eq!(record.offset, original.offset);
            assert_eq!(record.timestamp, original.timestamp);
            assert_eq!(record.payload, original.payload);
        }
    }

    #[test]
    fn test_sequential_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        sample_batch(0, &["a", "b"], CompressionType::None)
            .write_to(&mut buf)
            .unwrap();
        sample_batch(2, &["c"], CompressionType::Lz4)
            .write_to(&mut buf)
            .unwrap();
        let mut buf = buf.freeze();

        assert_eq!(LogRecordBatch::read_batch(&mut buf).unwrap().last_offset(), 1);
        assert_eq!(LogRecordBatch::read_batch(&mut buf).unwrap().base_offset(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_flipping_any_record_byte_is_crc_mismatch() {
        let batch = sample_batch(5, &["alpha", "", "gamma-delta"], CompressionType::None);
        let frame = batch.encode().unwrap();
        let mut rng = rand::thread_rng();

        for position in RECORDS_OFFSET..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[position] ^= rng.gen_range(1..=u8::MAX);
            let result = LogRecordBatch::read_batch(&mut corrupted.freeze());
            assert!(
                matches!(result, Err(AppError::CrcMismatch { base_offset: 5, .. })),
                "byte {} did not trigger a CRC mismatch: {:?}",
                position,
                result
            );
        }
    }

    #[test]
    fn test_bad_magic_is_not_a_crc_error() {
        let mut frame = sample_batch(0, &["x"], CompressionType::None)
            .encode()
            .unwrap();
        frame[MAGIC_OFFSET] = MAGIC + 1;
        let result = LogRecordBatch::read_batch(&mut frame.freeze());
        assert!(matches!(
            result,
            Err(AppError::InvalidMagic {
                expected: MAGIC,
                actual
            }) if actual == MAGIC + 1
        ));
    }

    #[test]
    fn test_every_truncation_fails() {
        let frame = sample_batch(3, &["one", "two", "three"], CompressionType::None)
            .encode()
            .unwrap()
            .freeze();

        for len in 1..frame.len() {
            let mut truncated = frame.slice(..len);
            let err = LogRecordBatch::read_batch(&mut truncated).unwrap_err();
            assert!(
                matches!(err, AppError::UnexpectedEof(_) | AppError::CorruptMessage(_)),
                "prefix of {} bytes gave {:?}",
                len,
                err
            );
            assert_eq!(truncated.len(), len);
        }
        assert!(matches!(
            LogRecordBatch::read_batch(&mut Bytes::new()),
            Err(AppError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_header_last_offset_must_match_records() {
        let mut frame = sample_batch(0, &["a", "b"], CompressionType::None)
            .encode()
            .unwrap();
        frame[LAST_OFFSET_OFFSET..LAST_OFFSET_OFFSET + 8].copy_from_slice(&9u64.to_be_bytes());
        let result = LogRecordBatch::read_batch(&mut frame.freeze());
        assert!(matches!(result, Err(AppError::CorruptMessage(_))));
    }

    #[test]
    fn test_new_rejects_gaps_and_empty() {
        assert!(LogRecordBatch::new(0, vec![], CompressionType::None).is_err());
        let gap = vec![LogRecord::new(0, 1, "a"), LogRecord::new(2, 1, "")];
        assert!(LogRecordBatch::new(0, gap, CompressionType::None).is_err());
        let wrong_start = vec![LogRecord::new(1, 1, "a")];
        assert!(LogRecordBatch::new(0, wrong_start, CompressionType::None).is_err());
    }

    #[test]
    fn test_timestamps_stored_as_delta() {
        let records = vec![
            LogRecord::new(0, 500, "late"),
            LogRecord::new(1, 100, "early"),
        ];
        let batch = LogRecordBatch::new(0, records, CompressionType::None).unwrap();
        assert_eq!(batch.base_timestamp(), 100);
        assert_eq!(batch.max_timestamp(), 500);

        let decoded = LogRecordBatch::read_batch(&mut batch.encode().unwrap().freeze()).unwrap();
        assert_eq!(decoded.records()[0].timestamp, 500);
        assert_eq!(decoded.records()[1].timestamp, 100);
    }
}
