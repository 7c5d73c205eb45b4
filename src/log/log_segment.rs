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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::log::{
    LogSegmentReader, LogSegmentWriter, INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX,
    TIME_INDEX_FILE_SUFFIX,
};
use crate::{AppResult, CommitLogConfig};

/// File triple of one segment plus the offset range it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    pub log_path: PathBuf,
    pub index_path: PathBuf,
    pub time_index_path: PathBuf,
    pub base_offset: u64,
    /// One past the last offset stored; equals `base_offset` while empty.
    pub next_offset: u64,
}

impl LogSegment {
    pub fn new(dir: impl AsRef<Path>, base_offset: u64) -> Self {
        let dir = dir.as_ref();
        let file_name = Self::file_name(base_offset);
        Self {
            log_path: dir.join(format!("{}.{}", file_name, LOG_FILE_SUFFIX)),
            index_path: dir.join(format!("{}.{}", file_name, INDEX_FILE_SUFFIX)),
            time_index_path: dir.join(format!("{}.{}", file_name, TIME_INDEX_FILE_SUFFIX)),
            base_offset,
            next_offset: base_offset,
        }
    }

    /// 20-digit zero-padded base offset, so names sort in offset order.
    pub fn file_name(base_offset: u64) -> String {
        format!("{:020}", base_offset)
    }

    /// Parses a segment base offset back out of a `.log` file path.
    pub fn parse_base_offset(path: &Path) -> Option<u64> {
        if path.extension()?.to_str()? != LOG_FILE_SUFFIX {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    pub fn relative_offset(&self, offset: u64) -> u64 {
        offset - self.base_offset
    }
}

/// Builds segments and binds writers/readers to the configured thresholds.
#[derive(Debug, Clone)]
pub struct LogSegmentFactory {
    config: Arc<CommitLogConfig>,
}

impl LogSegmentFactory {
    pub fn new(config: Arc<CommitLogConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommitLogConfig {
        &self.config
    }

    pub fn create_log_segment(&self, dir: impl AsRef<Path>, base_offset: u64) -> LogSegment {
        LogSegment::new(dir, base_offset)
    }

    pub fn create_writer(&self, segment: &LogSegment) -> AppResult<LogSegmentWriter> {
        LogSegmentWriter::open(segment.clone(), Arc::clone(&self.config))
    }

    pub fn create_reader(&self, segment: &LogSegment) -> AppResult<LogSegmentReader> {
        LogSegmentReader::open(segment.clone(), &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_paths() {
        let segment = LogSegment::new("/data/orders", 42);
        assert_eq!(
            segment.log_path,
            PathBuf::from("/data/orders/00000000000000000042.log")
        );
        assert_eq!(
            segment.index_path,
            PathBuf::from("/data/orders/00000000000000000042.index")
        );
        assert_eq!(
            segment.time_index_path,
            PathBuf::from("/data/orders/00000000000000000042.timeindex")
        );
        assert_eq!(segment.next_offset, 42);
        assert_eq!(segment.relative_offset(50), 8);
    }

    #[test]
    fn test_parse_base_offset() {
        let segment = LogSegment::new("/tmp", u64::MAX);
        assert_eq!(LogSegment::parse_base_offset(&segment.log_path), Some(u64::MAX));
        assert_eq!(LogSegment::parse_base_offset(&segment.index_path), None);
        assert_eq!(
            LogSegment::parse_base_offset(Path::new("/tmp/notanumber.log")),
            None
        );
    }
}
