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

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, info};

use crate::log::{
    CommitLogAppender, CommitLogReader, LogSegmentFactory, TopicSegmentRegistry,
    TopicSegmentRegistryFactory,
};
use crate::{AppError, AppResult, BrokerConfig, CommitLogConfig, TopicConfig};

/// Entry point of the storage engine: one appender and one reader per
/// configured topic, created on first use.
///
/// Topic names are matched case-insensitively against the configuration.
#[derive(Debug)]
pub struct CommitLogFactory {
    config: Arc<CommitLogConfig>,
    topics: Vec<TopicConfig>,
    segment_factory: LogSegmentFactory,
    registries: TopicSegmentRegistryFactory,
    appenders: DashMap<String, Arc<CommitLogAppender>>,
    readers: DashMap<String, Arc<CommitLogReader>>,
}

impl CommitLogFactory {
    pub fn new(config: BrokerConfig) -> Self {
        let commit_log = Arc::new(config.commit_log);
        let segment_factory = LogSegmentFactory::new(Arc::clone(&commit_log));
        Self {
            config: commit_log,
            topics: config.topics,
            registries: TopicSegmentRegistryFactory::new(segment_factory.clone()),
            segment_factory,
            appenders: DashMap::new(),
            readers: DashMap::new(),
        }
    }

    fn topic_config(&self, topic: &str) -> AppResult<&TopicConfig> {
        self.topics
            .iter()
            .find(|config| config.name.eq_ignore_ascii_case(topic))
            .ok_or_else(|| AppError::InvalidTopic(format!("topic '{}' is not configured", topic)))
    }

    async fn registry(&self, topic: &TopicConfig) -> AppResult<Arc<TopicSegmentRegistry>> {
        self.registries
            .get_or_create(
                &topic.name,
                topic.resolve_directory(&self.config),
                topic.base_offset,
            )
            .await
    }

    /// The topic's appender; its offsets continue from the recovered high-water
    /// mark, not the configured base offset.
    pub async fn get_appender(&self, topic: &str) -> AppResult<Arc<CommitLogAppender>> {
        let topic_config = self.topic_config(topic)?;
        if let Some(appender) = self.appenders.get(&topic_config.name) {
            return Ok(Arc::clone(appender.value()));
        }

        let registry = self.registry(topic_config).await?;
        let appender = Arc::new(CommitLogAppender::new(
            registry,
            self.segment_factory.clone(),
            topic_config.flush_interval(),
            topic_config.compression,
        )?);
        let existing = match self.appenders.entry(topic_config.name.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                info!(topic = %topic_config.name, "created commit log appender");
                return Ok(Arc::clone(entry.insert(appender).value()));
            }
        };
        // lost the race, the spare appender never saw an append
        appender.dispose().await?;
        Ok(existing)
    }

    pub async fn get_reader(&self, topic: &str) -> AppResult<Arc<CommitLogReader>> {
        let topic_config = self.topic_config(topic)?;
        if let Some(reader) = self.readers.get(&topic_config.name) {
            return Ok(Arc::clone(reader.value()));
        }

        let registry = self.registry(topic_config).await?;
        let reader = Arc::new(CommitLogReader::new(registry, self.segment_factory.clone()));
        Ok(Arc::clone(
            self.readers
                .entry(topic_config.name.clone())
                .or_insert(reader)
                .value(),
        ))
    }

    /// Disposes every appender, flushing what they still hold, then every
    /// reader. Returns the first appender error after trying them all.
    pub async fn dispose(&self) -> AppResult<()> {
        let appenders: Vec<Arc<CommitLogAppender>> = self
            .appenders
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.appenders.clear();

        let mut first_error = None;
        for appender in appenders {
            if let Err(e) = appender.dispose().await {
                error!(topic = %appender.topic(), "failed to dispose appender: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let readers: Vec<Arc<CommitLogReader>> = self
            .readers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.readers.clear();
        for reader in readers {
            reader.dispose().await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
