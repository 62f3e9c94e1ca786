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

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::trace;

use crate::message::{ConsumedMessage, ProducerRecord};

use super::{KafkaClient, KafkaError, KafkaResult};

/// An in-process Kafka cluster.
///
/// Clones share state, so a test can keep one handle to inject faults and
/// inspect partitions while the proxy owns another.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

#[derive(Debug)]
struct ClusterInner {
    topics: DashMap<String, Vec<Arc<PartitionLog>>>,
    committed: DashMap<(String, String, i32), i64>,
    /// partitions given to unknown topics on first use; 0 disables
    auto_create_partitions: usize,
    faults: Mutex<Faults>,
    produce_paused: watch::Sender<bool>,
    commits_paused: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Faults {
    produce_errors: VecDeque<KafkaError>,
    fetch_errors: VecDeque<KafkaError>,
    commit_error: Option<KafkaError>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    state: Mutex<LogState>,
    appended: Notify,
}

#[derive(Debug, Default)]
struct LogState {
    oldest: i64,
    records: VecDeque<ConsumedMessage>,
}

impl LogState {
    fn newest(&self) -> i64 {
        self.oldest + self.records.len() as i64
    }

    fn read(&self, offset: i64, max_messages: usize) -> KafkaResult<Vec<ConsumedMessage>> {
        if offset < self.oldest || offset > self.newest() {
            return Err(KafkaError::OffsetOutOfRange(format!(
                "offset {} not in [{}, {}]",
                offset,
                self.oldest,
                self.newest()
            )));
        }
        let start = (offset - self.oldest) as usize;
        Ok(self
            .records
            .iter()
            .skip(start)
            .take(max_messages)
            .cloned()
            .collect())
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::build(0)
    }

    /// Unknown topics are created with `partitions` partitions on first use.
    pub fn with_auto_create(partitions: usize) -> Self {
        Self::build(partitions)
    }

    fn build(auto_create_partitions: usize) -> Self {
        let (produce_paused, _) = watch::channel(false);
        let (commits_paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClusterInner {
                topics: DashMap::new(),
                committed: DashMap::new(),
                auto_create_partitions,
                faults: Mutex::new(Faults::default()),
                produce_paused,
                commits_paused,
            }),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.inner.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions)
                .map(|_| Arc::new(PartitionLog::default()))
                .collect()
        });
    }

    fn log(&self, topic: &str, partition: i32) -> KafkaResult<Arc<PartitionLog>> {
        if self.inner.auto_create_partitions > 0 && !self.inner.topics.contains_key(topic) {
            self.create_topic(topic, self.inner.auto_create_partitions);
        }
        let logs = self
            .inner
            .topics
            .get(topic)
            .ok_or_else(|| KafkaError::UnknownTopicOrPartition(topic.to_string()))?;
        usize::try_from(partition)
            .ok()
            .and_then(|index| logs.get(index).cloned())
            .ok_or_else(|| KafkaError::UnknownTopicOrPartition(format!("{}-{}", topic, partition)))
    }

    /// Appends a record directly, bypassing pauses and injected faults.
    pub fn append(&self, topic: &str, partition: i32, record: ProducerRecord) -> KafkaResult<i64> {
        let log = self.log(topic, partition)?;
        let offset = {
            let mut state = log.state.lock();
            let offset = state.newest();
            state.records.push_back(ConsumedMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: record.key,
                value: record.value,
                timestamp: Utc::now().timestamp_millis(),
            });
            offset
        };
        log.appended.notify_waiters();
        Ok(offset)
    }

    pub fn messages(&self, topic: &str, partition: i32) -> Vec<ConsumedMessage> {
        self.log(topic, partition)
            .map(|log| log.state.lock().records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|offset| *offset)
    }

    /// Drops every record below `offset`, as retention would.
    pub fn truncate(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
        let log = self.log(topic, partition)?;
        let mut state = log.state.lock();
        while state.oldest < offset && !state.records.is_empty() {
            state.records.pop_front();
            state.oldest += 1;
        }
        Ok(())
    }

    pub fn fail_next_produces(&self, errors: impl IntoIterator<Item = KafkaError>) {
        self.inner.faults.lock().produce_errors.extend(errors);
    }

    pub fn fail_next_fetches(&self, errors: impl IntoIterator<Item = KafkaError>) {
        self.inner.faults.lock().fetch_errors.extend(errors);
    }

    pub fn set_commit_error(&self, error: Option<KafkaError>) {
        self.inner.faults.lock().commit_error = error;
    }

    /// While paused, produce calls hang without acknowledging.
    pub fn pause_produce(&self, paused: bool) {
        self.inner.produce_paused.send_replace(paused);
    }

    /// While paused, offset commits hang before they are applied.
    pub fn pause_commits(&self, paused: bool) {
        self.inner.commits_paused.send_replace(paused);
    }
}

#[async_trait]
impl KafkaClient for MemoryCluster {
    async fn topics(&self) -> KafkaResult<Vec<String>> {
        let mut topics: Vec<String> = self
            .inner
            .topics
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        Ok(topics)
    }

    async fn partitions(&self, topic: &str) -> KafkaResult<Vec<i32>> {
        self.log(topic, 0)?;
        let count = self
            .inner
            .topics
            .get(topic)
            .map(|logs| logs.len())
            .unwrap_or_default();
        Ok((0..count as i32).collect())
    }

    async fn offset_range(&self, topic: &str, partition: i32) -> KafkaResult<(i64, i64)> {
        let log = self.log(topic, partition)?;
        let state = log.state.lock();
        Ok((state.oldest, state.newest()))
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_messages: usize,
        max_wait: Duration,
    ) -> KafkaResult<Vec<ConsumedMessage>> {
        if let Some(err) = self.inner.faults.lock().fetch_errors.pop_front() {
            return Err(err);
        }
        let log = self.log(topic, partition)?;
        let mut waited = false;
        loop {
            let notified = log.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = log.state.lock().read(offset, max_messages)?;
            if !batch.is_empty() || waited {
                return Ok(batch);
            }
            let _ = tokio::time::timeout(max_wait, notified).await;
            waited = true;
        }
    }

    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        records: Vec<ProducerRecord>,
    ) -> KafkaResult<Vec<i64>> {
        let mut paused = self.inner.produce_paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;

        if let Some(err) = self.inner.faults.lock().produce_errors.pop_front() {
            return Err(err);
        }
        let offsets = records
            .into_iter()
            .map(|record| self.append(topic, partition, record))
            .collect::<KafkaResult<Vec<i64>>>()?;
        trace!("produced {} records to {}-{}", offsets.len(), topic, partition);
        Ok(offsets)
    }

    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> KafkaResult<()> {
        let mut paused = self.inner.commits_paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;
        if let Some(err) = self.inner.faults.lock().commit_error.clone() {
            return Err(err);
        }
        self.log(topic, partition)?;
        self.inner
            .committed
            .insert((group.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    async fn fetch_committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> KafkaResult<Option<i64>> {
        self.log(topic, partition)?;
        Ok(self.committed_offset(group, topic, partition))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn record(value: &'static str) -> ProducerRecord {
        ProducerRecord::new(None, Bytes::from_static(value.as_bytes()))
    }

    #[tokio::test]
    async fn test_produce_and_fetch() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 2);
        let offsets = cluster
            .produce("t", 1, vec![record("a"), record("b")])
            .await
            .unwrap();
        assert_eq!(offsets, vec![0, 1]);

        let batch = cluster
            .fetch("t", 1, 1, 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, Bytes::from_static(b"b"));
        assert_eq!(cluster.offset_range("t", 1).await.unwrap(), (0, 2));
        assert_eq!(cluster.offset_range("t", 0).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_fetch_waits_for_append() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 1);
        let writer = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("t", 0, record("late")).unwrap();
        });
        let batch = cluster
            .fetch("t", 0, 0, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_returns_empty_after_max_wait() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 1);
        let start = tokio::time::Instant::now();
        let batch = cluster
            .fetch("t", 0, 0, 10, Duration::from_millis(250))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(start.elapsed() < Duration::from_millis(260));
    }

    #[tokio::test]
    async fn test_out_of_range_and_unknown_topic() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 1);
        cluster.append("t", 0, record("a")).unwrap();
        cluster.append("t", 0, record("b")).unwrap();
        cluster.truncate("t", 0, 1).unwrap();

        let err = cluster
            .fetch("t", 0, 0, 10, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, KafkaError::OffsetOutOfRange(_)));
        assert!(matches!(
            cluster.partitions("missing").await,
            Err(KafkaError::UnknownTopicOrPartition(_))
        ));
        assert!(matches!(
            cluster.offset_range("t", 7).await,
            Err(KafkaError::UnknownTopicOrPartition(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 1);
        cluster.fail_next_produces([KafkaError::LeaderNotAvailable("t-0".into())]);
        assert!(cluster.produce("t", 0, vec![record("a")]).await.is_err());
        assert_eq!(cluster.produce("t", 0, vec![record("a")]).await.unwrap(), vec![0]);

        cluster.set_commit_error(Some(KafkaError::RequestTimedOut("commit".into())));
        assert!(cluster.commit_offset("g", "t", 0, 1).await.is_err());
        cluster.set_commit_error(None);
        cluster.commit_offset("g", "t", 0, 1).await.unwrap();
        assert_eq!(cluster.fetch_committed_offset("g", "t", 0).await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_commit_lands_on_resume() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 1);
        cluster.pause_commits(true);
        let committer = cluster.clone();
        let commit = tokio::spawn(async move { committer.commit_offset("g", "t", 0, 3).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cluster.committed_offset("g", "t", 0), None);

        cluster.pause_commits(false);
        commit.await.unwrap().unwrap();
        assert_eq!(cluster.committed_offset("g", "t", 0), Some(3));
    }

    #[tokio::test]
    async fn test_auto_create() {
        let cluster = MemoryCluster::with_auto_create(3);
        assert_eq!(cluster.partitions("fresh").await.unwrap(), vec![0, 1, 2]);
        assert_eq!(cluster.topics().await.unwrap(), vec!["fresh".to_string()]);
    }
}
