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
use std::io::{self, Read, Seek, SeekFrom};

use crate::{AppError, AppResult};

/// Both index kinds use 16-byte big-endian entries: an 8-byte search key
/// followed by an 8-byte value.
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Sparse mapping from a segment-relative offset to the log file position of
/// the batch starting there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetIndexEntry {
    pub relative_offset: u64,
    pub file_position: u64,
}

/// Sparse mapping from a batch base timestamp to its segment-relative offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeIndexEntry {
    pub timestamp: u64,
    pub relative_offset: u64,
}

impl OffsetIndexEntry {
    pub fn encode(&self) -> [u8; INDEX_ENTRY_SIZE] {
        encode_entry(self.relative_offset, self.file_position)
    }

    pub fn decode(bytes: &[u8]) -> AppResult<Self> {
        let (relative_offset, file_position) = decode_entry(bytes)?;
        Ok(Self {
            relative_offset,
            file_position,
        })
    }
}

impl TimeIndexEntry {
    pub fn encode(&self) -> [u8; INDEX_ENTRY_SIZE] {
        encode_entry(self.timestamp, self.relative_offset)
    }

    pub fn decode(bytes: &[u8]) -> AppResult<Self> {
        let (timestamp, relative_offset) = decode_entry(bytes)?;
        Ok(Self {
            timestamp,
            relative_offset,
        })
    }
}

fn encode_entry(key: u64, value: u64) -> [u8; INDEX_ENTRY_SIZE] {
    let mut entry = [0u8; INDEX_ENTRY_SIZE];
    entry[..8].copy_from_slice(&key.to_be_bytes());
    entry[8..].copy_from_slice(&value.to_be_bytes());
    entry
}

fn decode_entry(bytes: &[u8]) -> AppResult<(u64, u64)> {
    if bytes.len() < INDEX_ENTRY_SIZE {
        return Err(AppError::UnexpectedEof(format!(
            "index entry needs {} bytes, only {} available",
            INDEX_ENTRY_SIZE,
            bytes.len()
        )));
    }
    Ok((read_key(bytes, 0), read_value(bytes, 0)))
}

fn read_key(slice: &[u8], entry: usize) -> u64 {
    let at = entry * INDEX_ENTRY_SIZE;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&slice[at..at + 8]);
    u64::from_be_bytes(raw)
}

fn read_value(slice: &[u8], entry: usize) -> u64 {
    let at = entry * INDEX_ENTRY_SIZE + 8;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&slice[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Finds the entry with the greatest key not above `target` in a byte slice of
/// whole index entries sorted by key. Returns `(key, value)`, or `None` when
/// every key is greater than `target` or the index is empty.
pub fn binary_search_index(slice: &[u8], target: u64) -> Option<(u64, u64)> {
    let entries = slice.len() / INDEX_ENTRY_SIZE;
    if entries == 0 || read_key(slice, 0) > target {
        return None;
    }

    // invariant: key(left) <= target, key(right) > target (right may be one past the end)
    let mut left = 0;
    let mut right = entries;
    while right - left > 1 {
        let mid = left + (right - left) / 2;
        if read_key(slice, mid) <= target {
            left = mid;
        } else {
            right = mid;
        }
    }
    Some((read_key(slice, left), read_value(slice, left)))
}

/// In-memory copy of an append-only index file, refreshed incrementally.
///
/// Only whole entries are kept, so a concurrently half-written tail entry is
/// picked up by a later refresh.
#[derive(Debug, Default)]
pub struct IndexCache {
    bytes: Vec<u8>,
}

impl IndexCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn refresh(&mut self, file: &mut File) -> io::Result<()> {
        let cached = self.bytes.len();
        file.seek(SeekFrom::Start(cached as u64))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)?;
        let whole = tail.len() - tail.len() % INDEX_ENTRY_SIZE;
        self.bytes.extend_from_slice(&tail[..whole]);
        Ok(())
    }

    pub fn lookup(&self, target: u64) -> Option<(u64, u64)> {
        binary_search_index(&self.bytes, target)
    }

    pub fn last(&self) -> Option<(u64, u64)> {
        let entries = self.entries();
        if entries == 0 {
            return None;
        }
        Some((
            read_key(&self.bytes, entries - 1),
            read_value(&self.bytes, entries - 1),
        ))
    }

    pub fn entries(&self) -> usize {
        self.bytes.len() / INDEX_ENTRY_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn offset_index(keys: &[u64]) -> Vec<u8> {
        keys.iter()
            .flat_map(|key| {
                OffsetIndexEntry {
                    relative_offset: *key,
                    file_position: key * 100,
                }
                .encode()
            })
            .collect()
    }

    #[test]
    fn test_entry_layout_is_big_endian() {
        let entry = TimeIndexEntry {
            timestamp: 0x0102,
            relative_offset: 7,
        };
        let bytes = entry.encode();
        assert_eq!(&bytes[6..8], &[0x01, 0x02]);
        assert_eq!(bytes[15], 7);
        assert_eq!(TimeIndexEntry::decode(&bytes).unwrap(), entry);
        assert!(matches!(
            OffsetIndexEntry::decode(&bytes[..15]),
            Err(AppError::UnexpectedEof(_))
        ));
    }

    #[rstest]
    #[case(0, None)]
    #[case(4, None)]
    #[case(5, Some((5, 500)))]
    #[case(9, Some((5, 500)))]
    #[case(10, Some((10, 1000)))]
    #[case(29, Some((20, 2000)))]
    #[case(30, Some((30, 3000)))]
    #[case(u64::MAX, Some((30, 3000)))]
    fn test_binary_search_floor(#[case] target: u64, #[case] expected: Option<(u64, u64)>) {
        let index = offset_index(&[5, 10, 20, 30]);
        assert_eq!(binary_search_index(&index, target), expected);
    }

    #[test]
    fn test_empty_index() {
        assert_eq!(binary_search_index(&[], 10), None);
        assert_eq!(IndexCache::default().last(), None);
    }

    #[test]
    fn test_cache_ignores_partial_tail_entry() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&offset_index(&[0, 8])).unwrap();
        file.write_all(&[0u8; 5]).unwrap();

        let mut cache = IndexCache::default();
        cache.refresh(&mut file).unwrap();
        assert_eq!(cache.entries(), 2);
        assert_eq!(cache.last(), Some((8, 800)));

        file.seek(SeekFrom::Start(32)).unwrap();
        file.write_all(&offset_index(&[16])).unwrap();
        cache.refresh(&mut file).unwrap();
        assert_eq!(cache.entries(), 3);
        assert_eq!(cache.lookup(17), Some((16, 1600)));
    }
}
