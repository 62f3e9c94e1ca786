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

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::admin::{Admin, PartitionOffset, PartitionOffsetInfo};
use crate::consumer::{ConsumeOptions, Consumer};
use crate::coordination::CoordinationClient;
use crate::group::GroupCoordinator;
use crate::kafka::KafkaClient;
use crate::message::{Delivery, ProduceResult};
use crate::offset::{OffsetManager, OffsetSnapshot};
use crate::producer::Producer;
use crate::service::{ProxyConfig, Shutdown};
use crate::AppResult;

/// One proxy: a producer, a consumer and the group membership behind it,
/// all bound to a single Kafka cluster and coordination session.
#[derive(Debug)]
pub struct Proxy {
    config: ProxyConfig,
    coordination: Arc<dyn CoordinationClient>,
    coordinator: GroupCoordinator,
    offsets: Arc<OffsetManager>,
    consumer: Consumer,
    producer: Producer,
    admin: Admin,
    notify_shutdown: broadcast::Sender<()>,
    commit_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Proxy {
    /// Starts every component. Must be called from within the tokio runtime.
    pub fn start(
        config: ProxyConfig,
        kafka: Arc<dyn KafkaClient>,
        coordination: Arc<dyn CoordinationClient>,
    ) -> AppResult<Proxy> {
        config.validate()?;
        let (notify_shutdown, _) = broadcast::channel(1);

        let coordinator = GroupCoordinator::start(&config, kafka.clone(), coordination.clone());
        let offsets = Arc::new(OffsetManager::new(&config.consumer, kafka.clone()));
        let commit_loop = offsets.spawn_commit_loop(Shutdown::subscribe(&notify_shutdown));
        let consumer = Consumer::start(
            config.consumer.clone(),
            kafka.clone(),
            offsets.clone(),
            coordinator.clone(),
        );
        let producer = Producer::new(config.producer.clone(), kafka.clone());
        let admin = Admin::new(kafka, coordinator.clone());

        info!("proxy {} started", config.client_id);
        Ok(Proxy {
            config,
            coordination,
            coordinator,
            offsets,
            consumer,
            producer,
            admin,
            notify_shutdown,
            commit_loop: Mutex::new(Some(commit_loop)),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub async fn produce(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> AppResult<ProduceResult> {
        self.producer.produce(topic, key, value).await
    }

    pub async fn produce_async(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> AppResult<i32> {
        self.producer.produce_async(topic, key, value).await
    }

    pub async fn consume(
        &self,
        group: &str,
        topic: &str,
        options: ConsumeOptions,
    ) -> AppResult<Option<Delivery>> {
        self.consumer.consume(group, topic, options).await
    }

    pub fn ack(&self, group: &str, topic: &str, partition: i32, offset: i64) -> AppResult<()> {
        self.consumer.ack(group, topic, partition, offset)
    }

    pub fn owned_partitions(&self, group: &str, topic: &str) -> Vec<i32> {
        self.consumer.owned_partitions(group, topic)
    }

    /// Offset state of the partitions this proxy owns for `(group, topic)`.
    pub fn offset_snapshot(&self, group: &str, topic: &str) -> Vec<OffsetSnapshot> {
        self.offsets.snapshot(group, topic)
    }

    pub async fn list_topics(&self) -> AppResult<Vec<String>> {
        self.admin.list_topics().await
    }

    pub async fn topic_partitions(&self, topic: &str) -> AppResult<Vec<i32>> {
        self.admin.topic_partitions(topic).await
    }

    pub async fn get_offsets(&self, group: &str, topic: &str) -> AppResult<Vec<PartitionOffsetInfo>> {
        self.admin.get_offsets(group, topic).await
    }

    pub async fn set_offsets(
        &self,
        group: &str,
        topic: &str,
        offsets: &[PartitionOffset],
    ) -> AppResult<()> {
        self.admin.set_offsets(group, topic, offsets).await
    }

    pub async fn get_group_members(&self, group: &str) -> AppResult<BTreeMap<String, Vec<String>>> {
        self.admin.get_group_members(group).await
    }

    /// Stops the proxy. Buffered messages get the producer shutdown timeout
    /// to reach Kafka; acknowledged offsets are committed before partitions
    /// are released and the group registrations go away.
    pub async fn shutdown(&self) {
        info!("proxy {} shutting down", self.config.client_id);
        self.producer
            .shutdown(self.config.producer.shutdown_timeout())
            .await;
        // releasing partitions discards their offset state
        self.offsets.flush().await;
        self.consumer.shutdown().await;
        self.coordinator.shutdown().await;

        let _ = self.notify_shutdown.send(());
        let commit_loop = self.commit_loop.lock().take();
        if let Some(commit_loop) = commit_loop {
            let _ = commit_loop.await;
        }
        self.coordination.close().await;
        debug!("proxy {} stopped", self.config.client_id);
    }
}
