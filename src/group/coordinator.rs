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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, trace, warn};

use crate::coordination::{
    paths, CoordinationClient, CoordinationError, CoordinationResult, SessionEvent,
};
use crate::kafka::KafkaClient;
use crate::service::ProxyConfig;
use crate::{AppError, AppResult};

use super::{MemberRegistration, PartitionAssigner, PartitionSet};

const COMMAND_CHANNEL_SIZE: usize = 128;
const MEMBERSHIP_CHANNEL_SIZE: usize = 256;
/// attempts made to write a member node before giving up on a subscribe
const REGISTRATION_ATTEMPTS: u32 = 4;

/// A live claim on `(group, topic)`. The receiver always holds the set of
/// partitions this proxy currently owns; it is emptied when ownership ends.
#[derive(Debug)]
pub struct TopicSubscription {
    pub id: u64,
    pub assignment: watch::Receiver<PartitionSet>,
}

enum Command {
    Subscribe {
        group: String,
        topic: String,
        reply: oneshot::Sender<AppResult<TopicSubscription>>,
    },
    Unsubscribe {
        group: String,
        topic: String,
        subscription_id: u64,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the group membership loop.
///
/// All registration state lives in one task; the handle only sends it
/// commands, so subscribe and unsubscribe calls from many consumers are
/// applied strictly one after another.
#[derive(Debug, Clone)]
pub struct GroupCoordinator {
    commands: mpsc::Sender<Command>,
    coordination: Arc<dyn CoordinationClient>,
    chroot: String,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl GroupCoordinator {
    pub fn start(
        config: &ProxyConfig,
        kafka: Arc<dyn KafkaClient>,
        coordination: Arc<dyn CoordinationClient>,
    ) -> GroupCoordinator {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (changes_tx, changes_rx) = mpsc::channel(MEMBERSHIP_CHANNEL_SIZE);
        let session_events = coordination.session_events();

        let coordinator_loop = CoordinatorLoop {
            member_id: config.client_id.clone(),
            chroot: config.zoo_keeper.chroot.clone(),
            rebalance_delay: config.consumer.rebalance_delay(),
            backoff_timeout: config.consumer.backoff_timeout(),
            coordination: coordination.clone(),
            kafka,
            groups: HashMap::new(),
            next_subscription_id: 1,
            rebalances: DelayQueue::new(),
            scheduled: HashMap::new(),
            changes_tx,
        };
        let task = tokio::spawn(coordinator_loop.run(commands_rx, changes_rx, session_events));

        GroupCoordinator {
            commands: commands_tx,
            coordination,
            chroot: config.zoo_keeper.chroot.clone(),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub async fn subscribe(&self, group: &str, topic: &str) -> AppResult<TopicSubscription> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                group: group.to_string(),
                topic: topic.to_string(),
                reply,
            })
            .await
            .map_err(|_| AppError::ShuttingDown)?;
        response.await.map_err(|_| AppError::ShuttingDown)?
    }

    /// Drops the claim made by subscription `subscription_id`. A newer
    /// subscription to the same topic is left untouched.
    pub async fn unsubscribe(&self, group: &str, topic: &str, subscription_id: u64) {
        let (reply, response) = oneshot::channel();
        let command = Command::Unsubscribe {
            group: group.to_string(),
            topic: topic.to_string(),
            subscription_id,
            reply,
        };
        if self.commands.send(command).await.is_ok() {
            let _ = response.await;
        }
    }

    /// Deletes every member node and stops the loop.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = response.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Members currently registered in `group` and the topics they consume.
    pub async fn members(&self, group: &str) -> AppResult<BTreeMap<String, Vec<String>>> {
        let path = paths::group_ids(&self.chroot, group);
        let members = read_members(self.coordination.as_ref(), &path).await?;
        Ok(members
            .into_iter()
            .map(|(member, registration)| (member, registration.topics().cloned().collect()))
            .collect())
    }
}

async fn read_members(
    coordination: &dyn CoordinationClient,
    path: &str,
) -> CoordinationResult<BTreeMap<String, MemberRegistration>> {
    let mut members = BTreeMap::new();
    for member in coordination.children(path).await? {
        // the node may vanish between listing and reading
        let Some(data) = coordination.get_data(&format!("{}/{}", path, member)).await? else {
            continue;
        };
        match MemberRegistration::from_bytes(&data) {
            Ok(registration) => {
                members.insert(member, registration);
            }
            Err(e) => warn!("skipping member {} under {}: {}", member, path, e),
        }
    }
    Ok(members)
}

/// Writes the member node, creating it when the session lost it.
async fn write_member_node(
    coordination: &dyn CoordinationClient,
    path: &str,
    data: Bytes,
) -> CoordinationResult<()> {
    match coordination.set_data(path, data.clone()).await {
        Err(CoordinationError::NoNode(_)) => {
            match coordination.create_ephemeral(path, data.clone()).await {
                Err(CoordinationError::NodeExists(_)) => coordination.set_data(path, data).await,
                other => other,
            }
        }
        other => other,
    }
}

struct TopicOwnership {
    subscription_id: u64,
    assignment: watch::Sender<PartitionSet>,
}

struct GroupRegistration {
    created_at: DateTime<Utc>,
    /// false until the member node is written, and again after the session
    /// that held it expired
    registered: bool,
    topics: BTreeMap<String, TopicOwnership>,
    watcher: Option<JoinHandle<()>>,
}

impl GroupRegistration {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            registered: false,
            topics: BTreeMap::new(),
            watcher: None,
        }
    }

    fn release_all(&self) {
        for ownership in self.topics.values() {
            ownership.assignment.send_replace(PartitionSet::new());
        }
    }
}

struct CoordinatorLoop {
    member_id: String,
    chroot: String,
    rebalance_delay: Duration,
    backoff_timeout: Duration,
    coordination: Arc<dyn CoordinationClient>,
    kafka: Arc<dyn KafkaClient>,
    groups: HashMap<String, GroupRegistration>,
    next_subscription_id: u64,
    rebalances: DelayQueue<String>,
    /// groups with a rebalance in `rebalances`
    scheduled: HashMap<String, delay_queue::Key>,
    changes_tx: mpsc::Sender<String>,
}

impl CoordinatorLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut changes: mpsc::Receiver<String>,
        mut session_events: broadcast::Receiver<SessionEvent>,
    ) {
        let mut session_events_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Subscribe { group, topic, reply }) => {
                        let result = self.subscribe(group, topic).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Unsubscribe { group, topic, subscription_id, reply }) => {
                        self.unsubscribe(&group, &topic, subscription_id).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(group) = changes.recv() => {
                    trace!("membership of group {} changed", group);
                    self.schedule_rebalance(group, self.rebalance_delay);
                }
                Some(expired) = self.rebalances.next() => {
                    let group = expired.into_inner();
                    self.scheduled.remove(&group);
                    self.rebalance(&group).await;
                }
                event = session_events.recv(), if session_events_open => match event {
                    Ok(SessionEvent::Expired) => self.on_session_expired(),
                    Ok(SessionEvent::Connected) => self.on_session_connected().await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("missed {} session events, re-registering", skipped);
                        self.on_session_connected().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => session_events_open = false,
                },
            }
        }
        debug!("group coordinator of {} stopped", self.member_id);
    }

    async fn subscribe(&mut self, group: String, topic: String) -> AppResult<TopicSubscription> {
        let subscription_id = self.next_subscription_id;
        self.next_subscription_id += 1;

        let registration = self
            .groups
            .entry(group.clone())
            .or_insert_with(GroupRegistration::new);
        if let Some(ownership) = registration.topics.get_mut(&topic) {
            ownership.subscription_id = subscription_id;
            return Ok(TopicSubscription {
                id: subscription_id,
                assignment: ownership.assignment.subscribe(),
            });
        }

        let (assignment, receiver) = watch::channel(PartitionSet::new());
        registration.topics.insert(
            topic.clone(),
            TopicOwnership {
                subscription_id,
                assignment,
            },
        );

        if let Err(e) = self.register(&group).await {
            if let Some(registration) = self.groups.get_mut(&group) {
                registration.topics.remove(&topic);
                if registration.topics.is_empty() {
                    self.deregister(&group).await;
                }
            }
            return Err(e);
        }

        debug!(
            "subscribed group {} topic {} as {}",
            group, topic, subscription_id
        );
        self.ensure_watching(&group);
        self.schedule_rebalance(group, self.rebalance_delay);
        Ok(TopicSubscription {
            id: subscription_id,
            assignment: receiver,
        })
    }

    async fn unsubscribe(&mut self, group: &str, topic: &str, subscription_id: u64) {
        let Some(registration) = self.groups.get_mut(group) else {
            return;
        };
        match registration.topics.get(topic) {
            Some(ownership) if ownership.subscription_id == subscription_id => {}
            _ => {
                debug!(
                    "ignoring stale unsubscribe {} of group {} topic {}",
                    subscription_id, group, topic
                );
                return;
            }
        }
        if let Some(ownership) = registration.topics.remove(topic) {
            ownership.assignment.send_replace(PartitionSet::new());
        }
        info!("unsubscribed group {} topic {}", group, topic);

        if registration.topics.is_empty() {
            self.deregister(group).await;
        } else {
            if let Err(e) = self.register_once(group).await {
                warn!("failed to update subscription of group {}: {}", group, e);
            }
            self.schedule_rebalance(group.to_string(), self.rebalance_delay);
        }
    }

    async fn shutdown(&mut self) {
        let groups: Vec<String> = self.groups.keys().cloned().collect();
        for group in groups {
            self.deregister(&group).await;
        }
    }

    /// Leaves `group`: stops its watch, publishes empty assignments and
    /// deletes the member node.
    async fn deregister(&mut self, group: &str) {
        let Some(registration) = self.groups.remove(group) else {
            return;
        };
        if let Some(key) = self.scheduled.remove(group) {
            self.rebalances.remove(&key);
        }
        if let Some(watcher) = &registration.watcher {
            watcher.abort();
        }
        registration.release_all();

        if registration.registered {
            let path = paths::member(&self.chroot, group, &self.member_id);
            if let Err(e) = self.coordination.delete(&path).await {
                warn!("failed to delete member node {}: {}", path, e);
            }
        }
        info!(
            "left group {} after {}s",
            group,
            (Utc::now() - registration.created_at).num_seconds()
        );
    }

    /// Writes the member node, retrying transient failures with exponential
    /// backoff.
    async fn register(&mut self, group: &str) -> AppResult<()> {
        let mut backoff = self.backoff_timeout;
        let mut attempt = 1;
        loop {
            match self.register_once(group).await {
                Ok(()) => return Ok(()),
                Err(AppError::Coordination(e))
                    if e.is_retriable() && attempt < REGISTRATION_ATTEMPTS =>
                {
                    warn!(
                        "registering in group {} failed (attempt {}), retrying in {:?}: {}",
                        group, attempt, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(AppError::Coordination(e)) => {
                    error!("giving up registering in group {}: {}", group, e);
                    return Err(AppError::CoordinationUnavailable(format!(
                        "group {}: {}",
                        group, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn register_once(&mut self, group: &str) -> AppResult<()> {
        let Some(registration) = self.groups.get(group) else {
            return Ok(());
        };
        let data = MemberRegistration::new(registration.topics.keys()).to_bytes()?;
        let path = paths::member(&self.chroot, group, &self.member_id);
        write_member_node(self.coordination.as_ref(), &path, data).await?;

        if let Some(registration) = self.groups.get_mut(group) {
            if !registration.registered {
                info!("registered {} in group {}", self.member_id, group);
            }
            registration.registered = true;
        }
        Ok(())
    }

    fn ensure_watching(&mut self, group: &str) {
        let running = self
            .groups
            .get(group)
            .and_then(|registration| registration.watcher.as_ref())
            .is_some_and(|watcher| !watcher.is_finished());
        if !running {
            self.restart_watch(group);
        }
    }

    /// Forwards every change under the group's `ids` path into the loop.
    fn restart_watch(&mut self, group: &str) {
        let Some(registration) = self.groups.get_mut(group) else {
            return;
        };
        if let Some(watcher) = registration.watcher.take() {
            watcher.abort();
        }
        let coordination = self.coordination.clone();
        let path = paths::group_ids(&self.chroot, group);
        let changes = self.changes_tx.clone();
        let group = group.to_string();
        registration.watcher = Some(tokio::spawn(async move {
            let mut stream = match coordination.watch(&path).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to watch {}: {}", path, e);
                    return;
                }
            };
            while stream.recv().await.is_some() {
                if changes.send(group.clone()).await.is_err() {
                    break;
                }
            }
            trace!("watch on {} ended", path);
        }));
    }

    /// Coalesces into an already scheduled rebalance so that a burst of
    /// changes costs one recomputation.
    fn schedule_rebalance(&mut self, group: String, delay: Duration) {
        if self.scheduled.contains_key(&group) || !self.groups.contains_key(&group) {
            return;
        }
        trace!("rebalance of group {} in {:?}", group, delay);
        let key = self.rebalances.insert(group.clone(), delay);
        self.scheduled.insert(group, key);
    }

    fn on_session_expired(&mut self) {
        warn!(
            "coordination session expired, {} group registrations void",
            self.groups.len()
        );
        for registration in self.groups.values_mut() {
            registration.registered = false;
        }
    }

    async fn on_session_connected(&mut self) {
        let groups: Vec<String> = self.groups.keys().cloned().collect();
        for group in groups {
            if let Err(e) = self.register(&group).await {
                // the rebalance retries the registration
                error!("re-registering in group {} failed: {}", group, e);
            }
            self.restart_watch(&group);
            self.schedule_rebalance(group, self.rebalance_delay);
        }
    }

    async fn rebalance(&mut self, group: &str) {
        if let Err(e) = self.try_rebalance(group).await {
            warn!(
                "rebalance of group {} failed, retrying in {:?}: {}",
                group, self.backoff_timeout, e
            );
            self.schedule_rebalance(group.to_string(), self.backoff_timeout);
        }
    }

    async fn try_rebalance(&mut self, group: &str) -> AppResult<()> {
        let registered = match self.groups.get(group) {
            Some(registration) => registration.registered,
            None => return Ok(()),
        };
        if !registered {
            self.register_once(group).await?;
        }
        self.ensure_watching(group);

        let path = paths::group_ids(&self.chroot, group);
        let members = read_members(self.coordination.as_ref(), &path).await?;
        if !members.contains_key(&self.member_id) {
            // keep what we own until the node is back
            if let Some(registration) = self.groups.get_mut(group) {
                registration.registered = false;
            }
            return Err(AppError::IllegalStateError(format!(
                "member node {} missing from group {}",
                self.member_id, group
            )));
        }

        let topics: Vec<String> = self
            .groups
            .get(group)
            .map(|registration| registration.topics.keys().cloned().collect())
            .unwrap_or_default();
        for topic in topics {
            let subscribers: Vec<&str> = members
                .iter()
                .filter(|(_, registration)| registration.subscription.contains_key(&topic))
                .map(|(member, _)| member.as_str())
                .collect();
            let partitions = self.kafka.partitions(&topic).await?;
            let owned = PartitionAssigner::assign(&self.member_id, &subscribers, &partitions);

            let Some(ownership) = self
                .groups
                .get(group)
                .and_then(|registration| registration.topics.get(&topic))
            else {
                continue;
            };
            let changed = ownership.assignment.send_if_modified(|current| {
                if *current == owned {
                    return false;
                }
                *current = owned.clone();
                true
            });
            if changed {
                info!(
                    "group {} topic {}: {} of {} members, owning {:?}",
                    group,
                    topic,
                    self.member_id,
                    subscribers.len(),
                    owned
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::coordination::{MemoryEnsemble, MemorySession};
    use crate::kafka::MemoryCluster;

    use super::*;

    fn start(id: &str, cluster: &MemoryCluster, session: &MemorySession) -> GroupCoordinator {
        let config = ProxyConfig::with_client_id(id);
        GroupCoordinator::start(
            &config,
            Arc::new(cluster.clone()),
            Arc::new(session.clone()),
        )
    }

    async fn owned_eventually(
        subscription: &mut TopicSubscription,
        expected: PartitionSet,
    ) -> PartitionSet {
        let owned = tokio::time::timeout(
            Duration::from_secs(10),
            subscription.assignment.wait_for(|owned| *owned == expected),
        )
        .await
        .expect("assignment never converged")
        .unwrap()
        .clone();
        owned
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_member_owns_every_partition() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 4);
        let ensemble = MemoryEnsemble::new();
        let coordinator = start("a", &cluster, &ensemble.connect());

        let mut subscription = coordinator.subscribe("g", "t").await.unwrap();
        owned_eventually(&mut subscription, PartitionSet::from([0, 1, 2, 3])).await;
        assert_eq!(ensemble.children("/consumers/g/ids"), vec!["a"]);

        let members = coordinator.members("g").await.unwrap();
        assert_eq!(members["a"], vec!["t".to_string()]);
        coordinator.shutdown().await;
        assert!(ensemble.children("/consumers/g/ids").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_member_splits_partitions() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 4);
        let ensemble = MemoryEnsemble::new();
        let a = start("a", &cluster, &ensemble.connect());
        let b = start("b", &cluster, &ensemble.connect());

        let mut sub_a = a.subscribe("g", "t").await.unwrap();
        owned_eventually(&mut sub_a, PartitionSet::from([0, 1, 2, 3])).await;

        let mut sub_b = b.subscribe("g", "t").await.unwrap();
        owned_eventually(&mut sub_b, PartitionSet::from([2, 3])).await;
        owned_eventually(&mut sub_a, PartitionSet::from([0, 1])).await;

        // a leaves, b takes everything back
        a.unsubscribe("g", "t", sub_a.id).await;
        assert!(sub_a.assignment.borrow().is_empty());
        owned_eventually(&mut sub_b, PartitionSet::from([0, 1, 2, 3])).await;

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_delay_coalesces_membership_flapping() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 4);
        let ensemble = MemoryEnsemble::new();
        let a = start("a", &cluster, &ensemble.connect());
        let b = start("b", &cluster, &ensemble.connect());

        let mut sub_a = a.subscribe("g", "t").await.unwrap();
        owned_eventually(&mut sub_a, PartitionSet::from([0, 1, 2, 3])).await;

        let mut assignment = sub_a.assignment.clone();
        let burst = tokio::time::Instant::now();
        let changes = tokio::spawn(async move {
            let mut changes = Vec::new();
            while let Ok(Ok(())) =
                tokio::time::timeout(Duration::from_secs(2), assignment.changed()).await
            {
                changes.push((burst.elapsed(), assignment.borrow_and_update().clone()));
            }
            changes
        });

        // b joins, leaves and joins again before the delay runs out
        let flapped = b.subscribe("g", "t").await.unwrap();
        b.unsubscribe("g", "t", flapped.id).await;
        let mut sub_b = b.subscribe("g", "t").await.unwrap();

        let changes = changes.await.unwrap();
        assert_eq!(changes.len(), 1, "a rebalanced more than once: {:?}", changes);
        let (at, owned) = &changes[0];
        assert_eq!(*owned, PartitionSet::from([0, 1]));
        assert!(
            *at >= Duration::from_millis(250) && *at < Duration::from_millis(300),
            "rebalanced after {:?}",
            at
        );
        owned_eventually(&mut sub_b, PartitionSet::from([2, 3])).await;

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_unsubscribe_is_ignored() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 2);
        let ensemble = MemoryEnsemble::new();
        let coordinator = start("a", &cluster, &ensemble.connect());

        let first = coordinator.subscribe("g", "t").await.unwrap();
        let mut second = coordinator.subscribe("g", "t").await.unwrap();
        assert_ne!(first.id, second.id);
        owned_eventually(&mut second, PartitionSet::from([0, 1])).await;

        coordinator.unsubscribe("g", "t", first.id).await;
        assert_eq!(ensemble.children("/consumers/g/ids"), vec!["a"]);
        assert_eq!(*second.assignment.borrow(), PartitionSet::from([0, 1]));

        coordinator.unsubscribe("g", "t", second.id).await;
        assert!(ensemble.children("/consumers/g/ids").is_empty());
        assert!(second.assignment.borrow().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_coordination_rejects_subscribe() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 2);
        let ensemble = MemoryEnsemble::new();
        let coordinator = start("a", &cluster, &ensemble.connect());

        ensemble.set_available(false);
        let err = coordinator.subscribe("g", "t").await.unwrap_err();
        assert!(matches!(err, AppError::CoordinationUnavailable(_)));

        ensemble.set_available(true);
        let mut subscription = coordinator.subscribe("g", "t").await.unwrap();
        owned_eventually(&mut subscription, PartitionSet::from([0, 1])).await;
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_re_registers() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 3);
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        let coordinator = start("a", &cluster, &session);

        let mut subscription = coordinator.subscribe("g", "t").await.unwrap();
        owned_eventually(&mut subscription, PartitionSet::from([0, 1, 2])).await;

        session.expire();
        for _ in 0..100 {
            if ensemble.children("/consumers/g/ids") == vec!["a"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(ensemble.children("/consumers/g/ids"), vec!["a"]);
        // ownership was kept across the expiry
        assert_eq!(*subscription.assignment.borrow(), PartitionSet::from([0, 1, 2]));
        coordinator.shutdown().await;
    }
}
