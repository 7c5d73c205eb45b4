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

//! Segmented per-topic commit log.
//!
//! This module provides functionality for:
//! - Segment file layout and the sparse offset/time indexes
//! - Segment writing, rolling and recovery
//! - Batching appends and offset-addressed reads per topic

mod appender;
mod commit_log_factory;
mod commit_log_reader;
mod index_file;
mod log_segment;
mod segment_reader;
mod segment_writer;
mod topic_registry;

// Re-exports
pub use appender::CommitLogAppender;
pub use commit_log_factory::CommitLogFactory;
pub use commit_log_reader::CommitLogReader;
pub use index_file::{
    binary_search_index, OffsetIndexEntry, TimeIndexEntry, INDEX_ENTRY_SIZE,
};
pub use log_segment::{LogSegment, LogSegmentFactory};
pub use segment_reader::{LogSegmentReader, RecoveredTail};
pub use segment_writer::{truncate_segment, LogSegmentWriter};
pub use topic_registry::{TopicSegmentRegistry, TopicSegmentRegistryFactory};

// File name constants
pub const LOG_FILE_SUFFIX: &str = "log";
pub const INDEX_FILE_SUFFIX: &str = "index";
pub const TIME_INDEX_FILE_SUFFIX: &str = "timeindex";
