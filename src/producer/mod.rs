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

//! Buffered production.
//!
//! Every topic-partition gets a bounded queue and one delivery task that
//! drains it in batches. A full queue suspends the producing caller instead
//! of dropping its message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::kafka::{KafkaClient, KafkaError, KafkaResult};
use crate::message::{ProduceResult, ProducerRecord, TopicPartition};
use crate::service::ProducerConfig;
use crate::{AppError, AppResult};

pub use partitioner::Partitioner;

mod partitioner;

#[derive(Debug)]
struct ProduceRequest {
    record: ProducerRecord,
    /// None for fire-and-forget produces
    reply: Option<oneshot::Sender<AppResult<i64>>>,
}

impl ProduceRequest {
    fn complete(self, tp: &TopicPartition, result: AppResult<i64>) {
        match self.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("async produce to {} failed: {}", tp, e);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Queues {
    senders: HashMap<TopicPartition, async_channel::Sender<ProduceRequest>>,
    workers: Vec<JoinHandle<()>>,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

#[derive(Debug)]
struct ProducerInner {
    config: ProducerConfig,
    kafka: Arc<dyn KafkaClient>,
    partitioner: Partitioner,
    partitions: DashMap<String, Arc<Vec<i32>>>,
    queues: Mutex<Queues>,
    /// fails whatever is left once the drain deadline passed
    cancel: CancellationToken,
}

impl Producer {
    pub fn new(config: ProducerConfig, kafka: Arc<dyn KafkaClient>) -> Producer {
        Producer {
            inner: Arc::new(ProducerInner {
                config,
                kafka,
                partitioner: Partitioner::default(),
                partitions: DashMap::new(),
                queues: Mutex::new(Queues::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Produces one message and waits until Kafka acknowledged it.
    pub async fn produce(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> AppResult<ProduceResult> {
        let (reply, response) = oneshot::channel();
        let partition = self.enqueue(topic, key, value, Some(reply)).await?;
        let offset = response
            .await
            .map_err(|e| AppError::ChannelRecvError(e.to_string()))??;
        Ok(ProduceResult { partition, offset })
    }

    /// Enqueues one message and returns its partition without waiting for
    /// Kafka; delivery failures are only logged.
    pub async fn produce_async(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> AppResult<i32> {
        self.enqueue(topic, key, value, None).await
    }

    async fn enqueue(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
        reply: Option<oneshot::Sender<AppResult<i64>>>,
    ) -> AppResult<i32> {
        if self.inner.queues.lock().closed {
            return Err(AppError::ShuttingDown);
        }
        let partitions = self.partitions(topic).await?;
        let partition = self
            .inner
            .partitioner
            .partition(topic, key.as_deref(), &partitions);
        let tp = TopicPartition::new(topic, partition);

        let queue = self.queue(&tp)?;
        queue
            .send(ProduceRequest {
                record: ProducerRecord::new(key, value),
                reply,
            })
            .await
            .map_err(|_| AppError::ShuttingDown)?;
        trace!("enqueued message for {}", tp);
        Ok(partition)
    }

    async fn partitions(&self, topic: &str) -> AppResult<Arc<Vec<i32>>> {
        if let Some(partitions) = self.inner.partitions.get(topic) {
            return Ok(partitions.clone());
        }
        let mut partitions = match self.inner.kafka.partitions(topic).await {
            Ok(partitions) => partitions,
            Err(KafkaError::UnknownTopicOrPartition(_)) => {
                return Err(AppError::UnknownTopic(topic.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if partitions.is_empty() {
            return Err(AppError::UnknownTopic(topic.to_string()));
        }
        partitions.sort_unstable();
        let partitions = Arc::new(partitions);
        self.inner
            .partitions
            .insert(topic.to_string(), partitions.clone());
        Ok(partitions)
    }

    fn queue(&self, tp: &TopicPartition) -> AppResult<async_channel::Sender<ProduceRequest>> {
        let mut queues = self.inner.queues.lock();
        if queues.closed {
            return Err(AppError::ShuttingDown);
        }
        if let Some(sender) = queues.senders.get(tp) {
            return Ok(sender.clone());
        }

        let (sender, receiver) = async_channel::bounded(self.inner.config.channel_buffer_size);
        let worker = DeliveryWorker {
            tp: tp.clone(),
            kafka: self.inner.kafka.clone(),
            requests: receiver,
            max_batch_size: self.inner.config.max_batch_size.max(1),
            max_retries: self.inner.config.max_retries,
            retry_backoff: self.inner.config.retry_backoff(),
            cancel: self.inner.cancel.clone(),
            producer: self.clone(),
        };
        queues.workers.push(tokio::spawn(worker.run()));
        queues.senders.insert(tp.clone(), sender.clone());
        debug!("started delivery worker for {}", tp);
        Ok(sender)
    }

    /// Stops accepting messages and gives buffered ones until `timeout` to
    /// reach Kafka. Messages still undelivered by then fail with
    /// `ShutdownTimeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let workers = {
            let mut queues = self.inner.queues.lock();
            queues.closed = true;
            for sender in queues.senders.values() {
                sender.close();
            }
            queues.senders.clear();
            std::mem::take(&mut queues.workers)
        };

        let deadline = Instant::now() + timeout;
        let mut workers = workers.into_iter();
        let mut remaining = Vec::new();
        for mut worker in workers.by_ref() {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                remaining.push(worker);
                break;
            }
        }
        remaining.extend(workers);

        if remaining.is_empty() {
            info!("producer drained");
            return;
        }
        warn!(
            "producer drain timed out after {:?}, failing {} queues",
            timeout,
            remaining.len()
        );
        self.inner.cancel.cancel();
        for worker in remaining {
            let _ = worker.await;
        }
    }

    fn forget_partitions(&self, topic: &str) {
        self.inner.partitions.remove(topic);
    }
}

struct DeliveryWorker {
    tp: TopicPartition,
    kafka: Arc<dyn KafkaClient>,
    requests: async_channel::Receiver<ProduceRequest>,
    max_batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    cancel: CancellationToken,
    producer: Producer,
}

impl DeliveryWorker {
    async fn run(self) {
        loop {
            let first = tokio::select! {
                received = self.requests.recv() => match received {
                    Ok(request) => request,
                    // closed and drained
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let mut batch = vec![first];
            while batch.len() < self.max_batch_size {
                match self.requests.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }

            let sent = tokio::select! {
                sent = self.send(&batch) => Some(sent),
                _ = self.cancel.cancelled() => None,
            };
            match sent {
                Some(sent) => self.respond(batch, sent),
                None => {
                    self.fail(batch);
                    break;
                }
            }
        }

        self.requests.close();
        let mut dropped = Vec::new();
        while let Ok(request) = self.requests.try_recv() {
            dropped.push(request);
        }
        if !dropped.is_empty() {
            self.fail(dropped);
        }
        trace!("delivery worker for {} stopped", self.tp);
    }

    /// Sends one batch, retrying transient errors.
    async fn send(&self, batch: &[ProduceRequest]) -> KafkaResult<Vec<i64>> {
        let records: Vec<ProducerRecord> = batch.iter().map(|r| r.record.clone()).collect();
        let mut retries = 0;
        loop {
            match self
                .kafka
                .produce(&self.tp.topic, self.tp.partition, records.clone())
                .await
            {
                Ok(offsets) => return Ok(offsets),
                Err(e) if e.is_retriable() && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        "producing {} messages to {} failed, retry {}/{} in {:?}: {}",
                        records.len(),
                        self.tp,
                        retries,
                        self.max_retries,
                        self.retry_backoff,
                        e
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn respond(&self, batch: Vec<ProduceRequest>, sent: KafkaResult<Vec<i64>>) {
        match sent {
            Ok(offsets) if offsets.len() == batch.len() => {
                for (request, offset) in batch.into_iter().zip(offsets) {
                    request.complete(&self.tp, Ok(offset));
                }
            }
            Ok(offsets) => {
                let reason = format!(
                    "{} acknowledged {} offsets for {} messages",
                    self.tp,
                    offsets.len(),
                    batch.len()
                );
                for request in batch {
                    request.complete(&self.tp, Err(AppError::IllegalStateError(reason.clone())));
                }
            }
            Err(e) => {
                if matches!(e, KafkaError::UnknownTopicOrPartition(_)) {
                    self.producer.forget_partitions(&self.tp.topic);
                }
                for request in batch {
                    request.complete(&self.tp, Err(AppError::Kafka(e.clone())));
                }
            }
        }
    }

    fn fail(&self, requests: Vec<ProduceRequest>) {
        warn!(
            "dropping {} undelivered messages for {}",
            requests.len(),
            self.tp
        );
        for request in requests {
            request.complete(
                &self.tp,
                Err(AppError::ShutdownTimeout(format!(
                    "message for {} not delivered before shutdown",
                    self.tp
                ))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MemoryCluster;

    fn setup(config: ProducerConfig) -> (MemoryCluster, Producer) {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 3);
        let producer = Producer::new(config, Arc::new(cluster.clone()));
        (cluster, producer)
    }

    fn value(v: &'static str) -> Bytes {
        Bytes::from_static(v.as_bytes())
    }

    #[tokio::test]
    async fn test_produce_keyed_and_keyless() {
        let (cluster, producer) = setup(ProducerConfig::default());
        let first = producer
            .produce("t", Some(value("k")), value("a"))
            .await
            .unwrap();
        let second = producer
            .produce("t", Some(value("k")), value("b"))
            .await
            .unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
        assert_eq!(cluster.messages("t", first.partition).len(), 2);

        let mut partitions = Vec::new();
        for _ in 0..3 {
            partitions.push(producer.produce("t", None, value("x")).await.unwrap().partition);
        }
        partitions.sort();
        assert_eq!(partitions, vec![0, 1, 2]);

        assert!(matches!(
            producer.produce("missing", None, value("x")).await,
            Err(AppError::UnknownTopic(_))
        ));
        producer.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let (cluster, producer) = setup(ProducerConfig::default());
        cluster.fail_next_produces([
            KafkaError::LeaderNotAvailable("t".into()),
            KafkaError::NotLeaderForPartition("t".into()),
        ]);
        let result = producer.produce("t", None, value("a")).await.unwrap();
        assert_eq!(result.offset, 0);
        producer.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_and_exhausted_errors_surface() {
        let config = ProducerConfig {
            max_retries: 2,
            ..ProducerConfig::default()
        };
        let (cluster, producer) = setup(config);
        cluster.fail_next_produces([KafkaError::MessageTooLarge("big".into())]);
        assert!(matches!(
            producer.produce("t", None, value("a")).await,
            Err(AppError::Kafka(KafkaError::MessageTooLarge(_)))
        ));

        cluster.fail_next_produces(vec![KafkaError::RequestTimedOut("slow".into()); 3]);
        assert!(matches!(
            producer.produce("t", None, value("a")).await,
            Err(AppError::Kafka(KafkaError::RequestTimedOut(_)))
        ));
        producer.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_blocks_the_caller() {
        let config = ProducerConfig {
            channel_buffer_size: 2,
            max_batch_size: 1,
            ..ProducerConfig::default()
        };
        let (cluster, producer) = setup(config);
        cluster.pause_produce(true);
        let key = Some(value("same"));

        // one in flight, two buffered
        for _ in 0..3 {
            tokio::time::timeout(
                Duration::from_secs(1),
                producer.produce_async("t", key.clone(), value("m")),
            )
            .await
            .expect("enqueue should not block")
            .unwrap();
        }
        let blocked = tokio::time::timeout(
            Duration::from_secs(1),
            producer.produce_async("t", key.clone(), value("m")),
        )
        .await;
        assert!(blocked.is_err());

        cluster.pause_produce(false);
        producer
            .produce_async("t", key.clone(), value("m"))
            .await
            .unwrap();
        producer.shutdown(Duration::from_secs(30)).await;
        let partition = producer.inner.partitioner.partition("t", Some(b"same"), &[0, 1, 2]);
        assert_eq!(cluster.messages("t", partition).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_within_timeout() {
        let (cluster, producer) = setup(ProducerConfig::default());
        cluster.pause_produce(true);

        let mut pending = Vec::new();
        for _ in 0..5 {
            let producer = producer.clone();
            pending.push(tokio::spawn(async move {
                producer.produce("t", None, value("m")).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let unpause = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            unpause.pause_produce(false);
        });
        producer.shutdown(Duration::from_secs(30)).await;

        for result in pending {
            assert!(result.await.unwrap().is_ok());
        }
        assert!(matches!(
            producer.produce("t", None, value("late")).await,
            Err(AppError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_undelivered_after_timeout() {
        let (cluster, producer) = setup(ProducerConfig::default());
        cluster.pause_produce(true);

        let mut pending = Vec::new();
        for _ in 0..5 {
            let producer = producer.clone();
            pending.push(tokio::spawn(async move {
                producer.produce("t", None, value("m")).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        producer.shutdown(Duration::from_secs(30)).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_millis(30_020));

        for result in pending {
            assert!(matches!(
                result.await.unwrap(),
                Err(AppError::ShutdownTimeout(_))
            ));
        }
    }
}
