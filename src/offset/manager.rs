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

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::kafka::KafkaClient;
use crate::service::{ConsumerConfig, InitialOffset};
use crate::{AppError, AppResult, Shutdown};

use super::OffsetEntry;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OffsetKey {
    pub group: String,
    pub topic: String,
    pub partition: i32,
}

impl OffsetKey {
    pub fn new(group: &str, topic: &str, partition: i32) -> Self {
        Self {
            group: group.to_string(),
            topic: topic.to_string(),
            partition,
        }
    }
}

impl Display for OffsetKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}-{}", self.group, self.topic, self.partition)
    }
}

/// Read-only view of one partition's offset state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffsetSnapshot {
    pub partition: i32,
    pub committed_offset: Option<i64>,
    pub committable_offset: i64,
    pub last_delivered_offset: Option<i64>,
    pub outstanding: usize,
}

/// One ownership generation of a partition.
#[derive(Debug)]
struct Owned {
    generation: u64,
    /// held while a commit of this partition is in flight
    committing: Arc<Mutex<()>>,
    entry: OffsetEntry,
}

/// Offset state of every partition this proxy owns, and the commit loop that
/// persists acknowledged progress to Kafka.
///
/// Each acquisition of a partition is a new generation. Deliveries and
/// releases name their generation, so a stale owner can neither record into
/// nor discard the state of the one that replaced it.
#[derive(Debug)]
pub struct OffsetManager {
    kafka: Arc<dyn KafkaClient>,
    entries: DashMap<OffsetKey, Owned>,
    generations: AtomicU64,
    ack_timeout: Duration,
    commit_interval: Duration,
    initial_offset: InitialOffset,
}

impl OffsetManager {
    pub fn new(config: &ConsumerConfig, kafka: Arc<dyn KafkaClient>) -> Self {
        Self {
            kafka,
            entries: DashMap::new(),
            generations: AtomicU64::new(0),
            ack_timeout: config.ack_timeout(),
            commit_interval: config.offsets_commit_interval(),
            initial_offset: config.initial_offset,
        }
    }

    /// A generation no partition was acquired under yet.
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Resolves where consumption of a newly owned partition begins and seeds
    /// its offset state under `generation`. The committed offset wins; without
    /// one the configured initial offset applies. Offsets outside the retained
    /// range are clamped into it.
    pub async fn get_offset_to_start(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        generation: u64,
    ) -> AppResult<i64> {
        let key = OffsetKey::new(group, topic, partition);
        let committed = self
            .kafka
            .fetch_committed_offset(group, topic, partition)
            .await?;
        let (oldest, newest) = self.kafka.offset_range(topic, partition).await?;

        let start = match committed {
            Some(offset) if offset < oldest => {
                warn!(
                    "committed offset {} of {} fell out of retention, starting at {}",
                    offset, key, oldest
                );
                oldest
            }
            Some(offset) if offset > newest => {
                warn!(
                    "committed offset {} of {} is past the end, starting at {}",
                    offset, key, newest
                );
                newest
            }
            Some(offset) => offset,
            None => match self.initial_offset {
                InitialOffset::Oldest => oldest,
                InitialOffset::Newest => newest,
            },
        };
        debug!(
            "{} generation {} starts at offset {} (committed {:?})",
            key, generation, start, committed
        );
        let owned = Owned {
            generation,
            committing: Arc::new(Mutex::new(())),
            entry: OffsetEntry::new(start, committed),
        };
        match self.entries.entry(key) {
            Entry::Occupied(current) if current.get().generation > generation => {
                debug!(
                    "{} already owned by generation {}",
                    current.key(),
                    current.get().generation
                );
            }
            Entry::Occupied(mut current) => {
                current.insert(owned);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(owned);
            }
        }
        Ok(start)
    }

    /// Marks `offset` as handed out. Returns false when `generation` does not
    /// own the partition, in which case the message must not be handed out.
    pub fn record_delivery(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        generation: u64,
        offset: i64,
    ) -> bool {
        let key = OffsetKey::new(group, topic, partition);
        match self.entries.get_mut(&key) {
            Some(mut owned) if owned.generation == generation => {
                owned
                    .entry
                    .record_delivery(offset, Instant::now() + self.ack_timeout);
                trace!("{} delivered offset {}", key, offset);
                true
            }
            _ => false,
        }
    }

    pub fn record_ack(&self, group: &str, topic: &str, partition: i32, offset: i64) -> AppResult<()> {
        let key = OffsetKey::new(group, topic, partition);
        let acked = self
            .entries
            .get_mut(&key)
            .is_some_and(|mut owned| owned.entry.record_ack(offset));
        if !acked {
            return Err(AppError::UnknownOffset {
                group: key.group,
                topic: key.topic,
                partition,
                offset,
            });
        }
        trace!("{} acknowledged offset {}", key, offset);
        Ok(())
    }

    /// Offsets whose ack deadline passed; they may be handed out again.
    pub fn expire_deliveries(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        now: Instant,
    ) -> Vec<i64> {
        let key = OffsetKey::new(group, topic, partition);
        let expired = self
            .entries
            .get_mut(&key)
            .map(|mut owned| owned.entry.expire(now))
            .unwrap_or_default();
        if !expired.is_empty() {
            debug!("{} ack timeout for offsets {:?}", key, expired);
        }
        expired
    }

    pub fn next_deadline(&self, group: &str, topic: &str, partition: i32) -> Option<Instant> {
        self.entries
            .get(&OffsetKey::new(group, topic, partition))
            .and_then(|owned| owned.entry.next_deadline())
    }

    /// Forgets a partition without committing; used when ownership is lost.
    /// Waits out a commit of the partition already in flight; none starts
    /// once this returns. Does nothing unless `generation` owns the partition.
    pub async fn release(&self, group: &str, topic: &str, partition: i32, generation: u64) {
        let key = OffsetKey::new(group, topic, partition);
        let committing = match self.entries.get(&key) {
            Some(owned) if owned.generation == generation => owned.committing.clone(),
            _ => return,
        };
        let _committing = committing.lock().await;
        if let Some((_, owned)) = self
            .entries
            .remove_if(&key, |_, owned| owned.generation == generation)
        {
            debug!(
                "released {} generation {} with {} unacknowledged offsets",
                key,
                generation,
                owned.entry.outstanding()
            );
        }
    }

    /// Commits every partition whose committable offset moved. Returns the
    /// number of successful commits; failures are retried on the next tick.
    pub async fn tick(&self) -> usize {
        let mut pending: Vec<(OffsetKey, u64, Arc<Mutex<()>>)> = self
            .entries
            .iter()
            .filter(|owned| owned.entry.pending_commit().is_some())
            .map(|owned| (owned.key().clone(), owned.generation, owned.committing.clone()))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut committed = 0;
        for (key, generation, committing) in pending {
            let _committing = committing.lock().await;
            // released or acquired again since the scan
            let Some(offset) = self
                .entries
                .get(&key)
                .filter(|owned| owned.generation == generation)
                .and_then(|owned| owned.entry.pending_commit())
            else {
                continue;
            };
            match self
                .kafka
                .commit_offset(&key.group, &key.topic, key.partition, offset)
                .await
            {
                Ok(()) => {
                    if let Some(mut owned) = self.entries.get_mut(&key) {
                        if owned.generation == generation {
                            owned.entry.mark_committed(offset);
                        }
                    }
                    trace!("committed {} at {}", key, offset);
                    committed += 1;
                }
                Err(e) => warn!("committing {} at {} failed: {}", key, offset, e),
            }
        }
        committed
    }

    /// Last commit before the proxy stops.
    pub async fn flush(&self) {
        let committed = self.tick().await;
        debug!("flushed {} offsets", committed);
    }

    pub fn snapshot(&self, group: &str, topic: &str) -> Vec<OffsetSnapshot> {
        let mut snapshot: Vec<OffsetSnapshot> = self
            .entries
            .iter()
            .filter(|owned| owned.key().group == group && owned.key().topic == topic)
            .map(|owned| OffsetSnapshot {
                partition: owned.key().partition,
                committed_offset: owned.entry.committed_offset(),
                committable_offset: owned.entry.committable_offset(),
                last_delivered_offset: owned.entry.last_delivered_offset(),
                outstanding: owned.entry.outstanding(),
            })
            .collect();
        snapshot.sort_by_key(|s| s.partition);
        snapshot
    }

    pub fn spawn_commit_loop(self: &Arc<Self>, mut shutdown: Shutdown) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.commit_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.tick().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("offset commit loop stopped");
        })
    }
}
