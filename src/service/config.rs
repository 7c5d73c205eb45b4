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

extern crate config as _;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::message::CompressionType;

/// Settings shared by every topic's commit log.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CommitLogConfig {
    /// Root directory; each topic lives in `{directory}/{topic}` unless overridden.
    pub directory: PathBuf,
    /// A segment rolls once its log file reaches this size.
    pub max_segment_bytes: u64,
    /// Log bytes written between two offset index entries.
    pub index_interval_bytes: u64,
    /// Minimum batch timestamp distance between two time index entries.
    pub time_index_interval_ms: u64,
    pub file_buffer_size: usize,
    pub reader_log_buffer_size: usize,
    pub reader_index_buffer_size: usize,
    /// Capacity of each appender's pending queue; a full queue makes producers wait.
    pub queue_capacity: usize,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            max_segment_bytes: 128 * 1024 * 1024,
            index_interval_bytes: 4096,
            time_index_interval_ms: 4096,
            file_buffer_size: 64 * 1024,
            reader_log_buffer_size: 64 * 1024,
            reader_index_buffer_size: 8 * 1024,
            queue_capacity: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default)]
    pub base_offset: u64,
    #[serde(default = "TopicConfig::default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Overrides `{commit_log.directory}/{name}`.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub compression: CompressionType,
}

impl TopicConfig {
    fn default_flush_interval_ms() -> u64 {
        100
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_offset: 0,
            flush_interval_ms: Self::default_flush_interval_ms(),
            directory: None,
            compression: CompressionType::None,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn resolve_directory(&self, commit_log: &CommitLogConfig) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| commit_log.directory.join(&self.name))
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub commit_log: CommitLogConfig,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.validate()?;

        Ok(broker_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let log = &self.commit_log;
        if log.max_segment_bytes == 0 {
            return Err(AppError::InvalidValue(
                "commit_log.max_segment_bytes must be positive".to_string(),
            ));
        }
        if log.queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "commit_log.queue_capacity must be positive".to_string(),
            ));
        }
        for topic in &self.topics {
            if topic.name.is_empty() {
                return Err(AppError::InvalidTopic("empty topic name".to_string()));
            }
            if topic.flush_interval_ms == 0 {
                return Err(AppError::InvalidValue(format!(
                    "topic {}: flush_interval_ms must be positive",
                    topic.name
                )));
            }
        }
        Ok(())
    }
}
