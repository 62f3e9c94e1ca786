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
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::group::PartitionSet;
use crate::kafka::{KafkaClient, KafkaError};
use crate::message::{ConsumedMessage, GroupTopic};
use crate::offset::OffsetManager;
use crate::service::ConsumerConfig;
use crate::{AppError, AppResult};

/// Everything this proxy holds for one owned partition.
struct PartitionSlot {
    /// offset state generation this ownership runs under
    generation: u64,
    buffer: mpsc::Receiver<ConsumedMessage>,
    /// handed out, not yet acknowledged
    pending: BTreeMap<i64, ConsumedMessage>,
    /// ack deadline passed or not yet recorded; served before `buffer`
    redeliver: BTreeMap<i64, ConsumedMessage>,
    cancel: CancellationToken,
    fetcher: JoinHandle<()>,
}

#[derive(Default)]
struct TopicState {
    partitions: BTreeMap<i32, PartitionSlot>,
    /// round-robin position among owned partitions
    cursor: usize,
}

/// Consumes the partitions of one `(group, topic)` this proxy owns and hands
/// their messages out to long-polling callers.
///
/// A task follows the published assignment. Lost partitions are torn down
/// completely (fetcher cancelled and joined, offset state dropped) before
/// gained ones start, so one partition is never consumed by two ownership
/// generations at once.
pub(crate) struct TopicConsumer {
    key: GroupTopic,
    config: ConsumerConfig,
    kafka: Arc<dyn KafkaClient>,
    offsets: Arc<OffsetManager>,
    state: Mutex<TopicState>,
    available: Arc<Notify>,
    stopped: CancellationToken,
    applier: Mutex<Option<JoinHandle<()>>>,
}

impl TopicConsumer {
    pub fn start(
        key: GroupTopic,
        config: ConsumerConfig,
        kafka: Arc<dyn KafkaClient>,
        offsets: Arc<OffsetManager>,
        assignment: watch::Receiver<PartitionSet>,
    ) -> Arc<TopicConsumer> {
        let consumer = Arc::new(TopicConsumer {
            key,
            config,
            kafka,
            offsets,
            state: Mutex::new(TopicState::default()),
            available: Arc::new(Notify::new()),
            stopped: CancellationToken::new(),
            applier: Mutex::new(None),
        });
        let applier = tokio::spawn(Arc::clone(&consumer).follow_assignment(assignment));
        *consumer.applier.lock() = Some(applier);
        consumer
    }

    pub fn owned_partitions(&self) -> Vec<i32> {
        self.state.lock().partitions.keys().copied().collect()
    }

    /// Waits up to `timeout` for a message. Redeliverable messages come
    /// before fresh ones within a partition; partitions take turns.
    pub async fn next_message(
        &self,
        timeout: Duration,
        closed: &CancellationToken,
    ) -> AppResult<Option<ConsumedMessage>> {
        let poll_deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            if let Some(message) = self.take_message(now) {
                return Ok(Some(message));
            }
            if now >= poll_deadline {
                return Ok(None);
            }
            let wake_at = self
                .next_ack_deadline()
                .map_or(poll_deadline, |deadline| deadline.min(poll_deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = closed.cancelled() => return Err(AppError::ShuttingDown),
            }
        }
    }

    fn take_message(&self, now: Instant) -> Option<ConsumedMessage> {
        let GroupTopic { group, topic } = &self.key;
        let mut state = self.state.lock();
        let state = &mut *state;
        let owned: Vec<i32> = state.partitions.keys().copied().collect();
        if owned.is_empty() {
            return None;
        }

        for (partition, slot) in state.partitions.iter_mut() {
            for offset in self.offsets.expire_deliveries(group, topic, *partition, now) {
                if let Some(message) = slot.pending.remove(&offset) {
                    slot.redeliver.insert(offset, message);
                }
            }
        }

        for step in 0..owned.len() {
            let index = (state.cursor + step) % owned.len();
            let partition = owned[index];
            let Some(slot) = state.partitions.get_mut(&partition) else {
                continue;
            };
            let Some(message) = slot
                .redeliver
                .pop_first()
                .map(|(_, message)| message)
                .or_else(|| slot.buffer.try_recv().ok())
            else {
                continue;
            };
            if !self.offsets.record_delivery(
                group,
                topic,
                partition,
                slot.generation,
                message.offset,
            ) {
                // kept for when the offset state is back
                warn!(
                    "{}-{} has no offset state for generation {}, holding offset {}",
                    self.key, partition, slot.generation, message.offset
                );
                slot.redeliver.insert(message.offset, message);
                continue;
            }
            slot.pending.insert(message.offset, message.clone());
            state.cursor = index + 1;
            return Some(message);
        }
        None
    }

    fn next_ack_deadline(&self) -> Option<Instant> {
        let GroupTopic { group, topic } = &self.key;
        self.owned_partitions()
            .into_iter()
            .filter_map(|partition| self.offsets.next_deadline(group, topic, partition))
            .min()
    }

    /// Drops the copy kept for redelivery once `offset` is acknowledged.
    pub fn forget(&self, partition: i32, offset: i64) {
        let mut state = self.state.lock();
        if let Some(slot) = state.partitions.get_mut(&partition) {
            slot.pending.remove(&offset);
            slot.redeliver.remove(&offset);
        }
    }

    /// Stops following the assignment and releases every partition.
    pub async fn stop(&self) {
        self.stopped.cancel();
        let applier = self.applier.lock().take();
        if let Some(applier) = applier {
            let _ = applier.await;
        }
        let owned = self.owned_partitions();
        for partition in owned {
            self.release(partition).await;
        }
        self.available.notify_waiters();
        debug!("stopped consuming {}", self.key);
    }

    async fn follow_assignment(self: Arc<Self>, mut assignment: watch::Receiver<PartitionSet>) {
        loop {
            let owned = assignment.borrow_and_update().clone();
            self.apply(owned).await;
            tokio::select! {
                changed = assignment.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.stopped.cancelled() => break,
            }
        }
    }

    async fn apply(&self, owned: PartitionSet) {
        let current: PartitionSet = self.owned_partitions().into_iter().collect();
        if current == owned {
            return;
        }
        for partition in current.difference(&owned) {
            self.release(*partition).await;
        }
        if self.stopped.is_cancelled() {
            return;
        }
        for partition in owned.difference(&current) {
            self.acquire(*partition);
        }
        info!("{} consuming partitions {:?}", self.key, owned);
        self.available.notify_waiters();
    }

    fn acquire(&self, partition: i32) {
        let (tx, buffer) = mpsc::channel(self.config.channel_buffer_size);
        let cancel = self.stopped.child_token();
        let generation = self.offsets.next_generation();
        let fetcher = tokio::spawn(fetch_partition(PartitionFetcher {
            key: self.key.clone(),
            partition,
            generation,
            kafka: self.kafka.clone(),
            offsets: self.offsets.clone(),
            tx,
            available: self.available.clone(),
            cancel: cancel.clone(),
            max_messages: self.config.channel_buffer_size,
            max_wait: self.config.fetch_max_wait(),
            backoff: self.config.backoff_timeout(),
        }));
        self.state.lock().partitions.insert(
            partition,
            PartitionSlot {
                generation,
                buffer,
                pending: BTreeMap::new(),
                redeliver: BTreeMap::new(),
                cancel,
                fetcher,
            },
        );
    }

    async fn release(&self, partition: i32) {
        let slot = self.state.lock().partitions.remove(&partition);
        let Some(slot) = slot else {
            return;
        };
        slot.cancel.cancel();
        let _ = slot.fetcher.await;
        self.offsets
            .release(&self.key.group, &self.key.topic, partition, slot.generation)
            .await;
        debug!(
            "{} released partition {} ({} unacknowledged)",
            self.key,
            partition,
            slot.pending.len() + slot.redeliver.len()
        );
    }
}

struct PartitionFetcher {
    key: GroupTopic,
    partition: i32,
    generation: u64,
    kafka: Arc<dyn KafkaClient>,
    offsets: Arc<OffsetManager>,
    tx: mpsc::Sender<ConsumedMessage>,
    available: Arc<Notify>,
    cancel: CancellationToken,
    max_messages: usize,
    max_wait: Duration,
    backoff: Duration,
}

impl PartitionFetcher {
    /// Sleeps for the backoff; false when cancelled meanwhile.
    async fn back_off(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

/// Fills one partition's buffer from Kafka until cancelled. The bounded
/// buffer holds the fetcher back when callers stop consuming.
async fn fetch_partition(fetcher: PartitionFetcher) {
    let GroupTopic { group, topic } = &fetcher.key;
    let partition = fetcher.partition;

    let mut offset = loop {
        let resolved = tokio::select! {
            resolved = fetcher.offsets.get_offset_to_start(
                group,
                topic,
                partition,
                fetcher.generation,
            ) => resolved,
            _ = fetcher.cancel.cancelled() => return,
        };
        match resolved {
            Ok(offset) => break offset,
            Err(e) => {
                warn!("{}-{} start offset unavailable: {}", fetcher.key, partition, e);
                if !fetcher.back_off().await {
                    return;
                }
            }
        }
    };

    loop {
        let fetched = tokio::select! {
            fetched = fetcher.kafka.fetch(
                topic,
                partition,
                offset,
                fetcher.max_messages,
                fetcher.max_wait,
            ) => fetched,
            _ = fetcher.cancel.cancelled() => return,
        };
        match fetched {
            Ok(messages) => {
                for message in messages {
                    offset = message.offset + 1;
                    tokio::select! {
                        sent = fetcher.tx.send(message) => {
                            if sent.is_err() {
                                return;
                            }
                            fetcher.available.notify_waiters();
                        }
                        _ = fetcher.cancel.cancelled() => return,
                    }
                }
            }
            Err(KafkaError::OffsetOutOfRange(reason)) => {
                match fetcher.kafka.offset_range(topic, partition).await {
                    Ok((oldest, newest)) => {
                        let resumed = offset.clamp(oldest, newest);
                        warn!(
                            "{}-{} offset {} out of range ({}), resuming at {}",
                            fetcher.key, partition, offset, reason, resumed
                        );
                        offset = resumed;
                    }
                    Err(e) => {
                        warn!("{}-{} offset range unavailable: {}", fetcher.key, partition, e);
                        if !fetcher.back_off().await {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("{}-{} fetch at {} failed: {}", fetcher.key, partition, offset, e);
                if !fetcher.back_off().await {
                    return;
                }
            }
        }
    }
}
