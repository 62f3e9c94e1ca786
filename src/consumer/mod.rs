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

//! The consume request multiplexer.
//!
//! Clients pull one message at a time with long polling. The first pull for a
//! `(group, topic)` subscribes this proxy to the group; later pulls renew the
//! subscription, and a reaper unsubscribes the ones nobody polled within the
//! registration timeout.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::group::GroupCoordinator;
use crate::kafka::{KafkaClient, KafkaError};
use crate::message::{Delivery, GroupTopic};
use crate::offset::OffsetManager;
use crate::service::ConsumerConfig;
use crate::{AppError, AppResult};

use topic_consumer::TopicConsumer;

mod topic_consumer;

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// overrides `consumer.long_polling_timeout_ms`
    pub long_polling_timeout: Option<Duration>,
    /// acknowledge the message as it is handed out
    pub auto_ack: bool,
    /// `(partition, offset)` to acknowledge before consuming
    pub ack: Option<(i32, i64)>,
}

struct Subscription {
    id: u64,
    registered_at: Instant,
    expires_at: Instant,
    topic_consumer: Arc<TopicConsumer>,
}

#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    config: ConsumerConfig,
    kafka: Arc<dyn KafkaClient>,
    offsets: Arc<OffsetManager>,
    coordinator: GroupCoordinator,
    subscriptions: DashMap<GroupTopic, Subscription>,
    /// held while a `(group, topic)` subscription is created or torn down
    transitions: DashMap<GroupTopic, Arc<tokio::sync::Mutex<()>>>,
    closed: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Consumer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("subscriptions", &self.inner.subscriptions.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl Consumer {
    pub fn start(
        config: ConsumerConfig,
        kafka: Arc<dyn KafkaClient>,
        offsets: Arc<OffsetManager>,
        coordinator: GroupCoordinator,
    ) -> Consumer {
        let consumer = Consumer {
            inner: Arc::new(ConsumerInner {
                config,
                kafka,
                offsets,
                coordinator,
                subscriptions: DashMap::new(),
                transitions: DashMap::new(),
                closed: CancellationToken::new(),
                reaper: Mutex::new(None),
            }),
        };
        let reaper = tokio::spawn(consumer.clone().reap_expired());
        *consumer.inner.reaper.lock() = Some(reaper);
        consumer
    }

    /// Hands out the next message of `topic` for `group`, waiting up to the
    /// long polling timeout. `Ok(None)` means the wait timed out.
    pub async fn consume(
        &self,
        group: &str,
        topic: &str,
        options: ConsumeOptions,
    ) -> AppResult<Option<Delivery>> {
        if self.inner.closed.is_cancelled() {
            return Err(AppError::ShuttingDown);
        }
        if let Some((partition, offset)) = options.ack {
            self.ack(group, topic, partition, offset)?;
        }

        let topic_consumer = self.subscription(group, topic).await?;
        let timeout = options
            .long_polling_timeout
            .unwrap_or_else(|| self.inner.config.long_polling_timeout());
        let Some(message) = topic_consumer
            .next_message(timeout, &self.inner.closed)
            .await?
        else {
            return Ok(None);
        };

        let delivery = Delivery::new(group, message);
        if options.auto_ack {
            self.ack(group, topic, delivery.ack.partition, delivery.ack.offset)?;
        }
        Ok(Some(delivery))
    }

    pub fn ack(&self, group: &str, topic: &str, partition: i32, offset: i64) -> AppResult<()> {
        let key = GroupTopic::new(group, topic);
        let topic_consumer = self
            .inner
            .subscriptions
            .get(&key)
            .map(|subscription| subscription.topic_consumer.clone())
            .ok_or_else(|| AppError::NotSubscribed {
                group: group.to_string(),
                topic: topic.to_string(),
            })?;
        self.inner
            .offsets
            .record_ack(group, topic, partition, offset)?;
        topic_consumer.forget(partition, offset);
        Ok(())
    }

    /// Partitions of `topic` this proxy currently consumes for `group`.
    pub fn owned_partitions(&self, group: &str, topic: &str) -> Vec<i32> {
        self.inner
            .subscriptions
            .get(&GroupTopic::new(group, topic))
            .map(|subscription| subscription.topic_consumer.owned_partitions())
            .unwrap_or_default()
    }

    /// Renews the subscription to `(group, topic)`, creating it on first use.
    /// Creation waits for a teardown of the same key still in progress.
    async fn subscription(&self, group: &str, topic: &str) -> AppResult<Arc<TopicConsumer>> {
        let key = GroupTopic::new(group, topic);
        if let Some(topic_consumer) = self.renew(&key) {
            return Ok(topic_consumer);
        }

        let transition = self.transition(&key);
        let guard = transition.lock().await;
        let subscribed = self.subscribe(&key).await;
        drop(guard);
        drop(transition);
        if subscribed.is_err() {
            self.forget_transition(&key);
        }
        subscribed
    }

    /// Must hold the transition lock of `key`.
    async fn subscribe(&self, key: &GroupTopic) -> AppResult<Arc<TopicConsumer>> {
        if self.inner.closed.is_cancelled() {
            return Err(AppError::ShuttingDown);
        }
        if let Some(topic_consumer) = self.renew(key) {
            return Ok(topic_consumer);
        }

        let GroupTopic { group, topic } = key;
        match self.inner.kafka.partitions(topic).await {
            Err(KafkaError::UnknownTopicOrPartition(_)) => {
                return Err(AppError::UnknownTopic(topic.to_string()))
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        let subscription = self.inner.coordinator.subscribe(group, topic).await?;
        let topic_consumer = TopicConsumer::start(
            key.clone(),
            self.inner.config.clone(),
            self.inner.kafka.clone(),
            self.inner.offsets.clone(),
            subscription.assignment,
        );
        let now = Instant::now();
        self.inner.subscriptions.insert(
            key.clone(),
            Subscription {
                id: subscription.id,
                registered_at: now,
                expires_at: now + self.inner.config.registration_timeout(),
                topic_consumer: topic_consumer.clone(),
            },
        );
        info!("subscribed to {}", key);
        Ok(topic_consumer)
    }

    fn transition(&self, key: &GroupTopic) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .transitions
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drops the transition lock of `key` once nobody else holds it.
    fn forget_transition(&self, key: &GroupTopic) {
        self.inner
            .transitions
            .remove_if(key, |_, transition| Arc::strong_count(transition) == 1);
    }

    fn renew(&self, key: &GroupTopic) -> Option<Arc<TopicConsumer>> {
        let mut subscription = self.inner.subscriptions.get_mut(key)?;
        subscription.expires_at = Instant::now() + self.inner.config.registration_timeout();
        Some(subscription.topic_consumer.clone())
    }

    async fn reap_expired(self) {
        let period = self.inner.config.registration_timeout() / 4;
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reap(Instant::now()).await,
                _ = self.inner.closed.cancelled() => break,
            }
        }
    }

    async fn reap(&self, now: Instant) {
        let expired: Vec<GroupTopic> = self
            .inner
            .subscriptions
            .iter()
            .filter(|subscription| subscription.expires_at <= now)
            .map(|subscription| subscription.key().clone())
            .collect();

        for key in expired {
            // a new subscription to the same key waits until this one is gone
            let transition = self.transition(&key);
            let guard = transition.lock().await;
            // renewed since the scan
            if let Some((key, subscription)) = self
                .inner
                .subscriptions
                .remove_if(&key, |_, subscription| subscription.expires_at <= now)
            {
                info!(
                    "subscription to {} expired after {:?}",
                    key,
                    now - subscription.registered_at
                );
                subscription.topic_consumer.stop().await;
                self.inner
                    .coordinator
                    .unsubscribe(&key.group, &key.topic, subscription.id)
                    .await;
            }
            drop(guard);
            drop(transition);
            self.forget_transition(&key);
        }
    }

    /// Stops the reaper and every topic consumer and fails pending waits.
    pub async fn shutdown(&self) {
        self.inner.closed.cancel();
        let reaper = self.inner.reaper.lock().take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        let keys: Vec<GroupTopic> = self
            .inner
            .subscriptions
            .iter()
            .map(|subscription| subscription.key().clone())
            .collect();
        for key in keys {
            let transition = self.transition(&key);
            let _transition = transition.lock().await;
            if let Some((_, subscription)) = self.inner.subscriptions.remove(&key) {
                subscription.topic_consumer.stop().await;
            }
        }
        debug!("consumer stopped");
    }
}
