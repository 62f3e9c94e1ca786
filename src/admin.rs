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

//! Group and topic inspection that bypasses the consume path.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::group::GroupCoordinator;
use crate::kafka::{KafkaClient, KafkaError};
use crate::{AppError, AppResult};

/// Progress of one group on one partition.
///
/// `offset` is -1 when the group never committed; its lag then covers the
/// whole retained range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionOffsetInfo {
    pub partition: i32,
    pub begin: i64,
    pub end: i64,
    pub count: i64,
    pub offset: i64,
    pub lag: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct Admin {
    kafka: Arc<dyn KafkaClient>,
    coordinator: GroupCoordinator,
}

impl Admin {
    pub fn new(kafka: Arc<dyn KafkaClient>, coordinator: GroupCoordinator) -> Self {
        Self { kafka, coordinator }
    }

    pub async fn list_topics(&self) -> AppResult<Vec<String>> {
        let mut topics = self.kafka.topics().await?;
        topics.sort();
        Ok(topics)
    }

    pub async fn topic_partitions(&self, topic: &str) -> AppResult<Vec<i32>> {
        match self.kafka.partitions(topic).await {
            Ok(partitions) if partitions.is_empty() => Err(AppError::UnknownTopic(topic.to_string())),
            Ok(mut partitions) => {
                partitions.sort_unstable();
                Ok(partitions)
            }
            Err(KafkaError::UnknownTopicOrPartition(_)) => {
                Err(AppError::UnknownTopic(topic.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_offsets(&self, group: &str, topic: &str) -> AppResult<Vec<PartitionOffsetInfo>> {
        let partitions = self.topic_partitions(topic).await?;
        let mut offsets = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let (begin, end) = self.kafka.offset_range(topic, partition).await?;
            let committed = self
                .kafka
                .fetch_committed_offset(group, topic, partition)
                .await?;
            let (offset, lag) = match committed {
                Some(offset) => (offset, (end - offset).max(0)),
                None => (-1, end - begin),
            };
            offsets.push(PartitionOffsetInfo {
                partition,
                begin,
                end,
                count: end - begin,
                offset,
                lag,
            });
        }
        Ok(offsets)
    }

    /// Commits the given offsets for `group` directly. Every partition must
    /// exist and every offset must be non-negative; nothing is committed
    /// otherwise.
    pub async fn set_offsets(
        &self,
        group: &str,
        topic: &str,
        offsets: &[PartitionOffset],
    ) -> AppResult<()> {
        let partitions = self.topic_partitions(topic).await?;
        for PartitionOffset { partition, offset } in offsets {
            if partitions.binary_search(partition).is_err() {
                return Err(AppError::InvalidRequest(format!(
                    "{} has no partition {}",
                    topic, partition
                )));
            }
            if *offset < 0 {
                return Err(AppError::InvalidRequest(format!(
                    "negative offset {} for {}-{}",
                    offset, topic, partition
                )));
            }
        }
        for PartitionOffset { partition, offset } in offsets {
            self.kafka
                .commit_offset(group, topic, *partition, *offset)
                .await?;
        }
        info!("{} offsets of {}/{} set by admin", offsets.len(), group, topic);
        Ok(())
    }

    /// Registered members of `group` and the topics each consumes.
    pub async fn get_group_members(&self, group: &str) -> AppResult<BTreeMap<String, Vec<String>>> {
        self.coordinator.members(group).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::coordination::{CoordinationClient, MemoryEnsemble};
    use crate::kafka::MemoryCluster;
    use crate::message::ProducerRecord;
    use crate::service::ProxyConfig;

    use super::*;

    fn setup() -> (MemoryCluster, Admin) {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 2);
        cluster.create_topic("a", 1);
        for _ in 0..5 {
            cluster
                .append("t", 0, ProducerRecord::new(None, Bytes::from_static(b"m")))
                .unwrap();
        }
        let kafka: Arc<dyn KafkaClient> = Arc::new(cluster.clone());
        let coordination: Arc<dyn CoordinationClient> =
            Arc::new(MemoryEnsemble::new().connect());
        let coordinator = GroupCoordinator::start(
            &ProxyConfig::with_client_id("admin_test"),
            kafka.clone(),
            coordination,
        );
        (cluster, Admin::new(kafka, coordinator))
    }

    #[tokio::test]
    async fn test_topics_and_partitions() {
        let (_, admin) = setup();
        assert_eq!(admin.list_topics().await.unwrap(), vec!["a", "t"]);
        assert_eq!(admin.topic_partitions("t").await.unwrap(), vec![0, 1]);
        assert!(matches!(
            admin.topic_partitions("missing").await,
            Err(AppError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_get_and_set_offsets() {
        let (cluster, admin) = setup();
        let offsets = admin.get_offsets("g", "t").await.unwrap();
        assert_eq!(
            offsets[0],
            PartitionOffsetInfo {
                partition: 0,
                begin: 0,
                end: 5,
                count: 5,
                offset: -1,
                lag: 5,
            }
        );
        assert_eq!(offsets[1].count, 0);

        admin
            .set_offsets("g", "t", &[PartitionOffset { partition: 0, offset: 3 }])
            .await
            .unwrap();
        assert_eq!(cluster.committed_offset("g", "t", 0), Some(3));
        let offsets = admin.get_offsets("g", "t").await.unwrap();
        assert_eq!((offsets[0].offset, offsets[0].lag), (3, 2));
    }

    #[tokio::test]
    async fn test_set_offsets_is_validated_up_front() {
        let (cluster, admin) = setup();
        let offsets = [
            PartitionOffset { partition: 0, offset: 1 },
            PartitionOffset { partition: 7, offset: 1 },
        ];
        assert!(matches!(
            admin.set_offsets("g", "t", &offsets).await,
            Err(AppError::InvalidRequest(_))
        ));
        assert_eq!(cluster.committed_offset("g", "t", 0), None);

        assert!(matches!(
            admin
                .set_offsets("g", "t", &[PartitionOffset { partition: 0, offset: -2 }])
                .await,
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_members_of_unknown_group_are_empty() {
        let (_, admin) = setup();
        assert!(admin.get_group_members("nobody").await.unwrap().is_empty());
    }
}
