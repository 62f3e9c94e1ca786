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

//! The Kafka boundary.
//!
//! The proxy core never speaks the wire protocol itself; it talks to a
//! [`KafkaClient`]. [`MemoryCluster`] is an in-process cluster used by the
//! tests and by standalone mode.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::message::{ConsumedMessage, ProducerRecord};

pub use error::{KafkaError, KafkaResult};
pub use memory::MemoryCluster;

mod error;
mod memory;

#[async_trait]
pub trait KafkaClient: Send + Sync + Debug {
    async fn topics(&self) -> KafkaResult<Vec<String>>;

    /// Partition ids of `topic`, sorted.
    async fn partitions(&self, topic: &str) -> KafkaResult<Vec<i32>>;

    /// `(oldest, newest)` where `newest` is the offset the next produced
    /// message will get.
    async fn offset_range(&self, topic: &str, partition: i32) -> KafkaResult<(i64, i64)>;

    /// Reads at most `max_messages` starting at `offset`, waiting up to
    /// `max_wait` for data when the partition has nothing new.
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_messages: usize,
        max_wait: Duration,
    ) -> KafkaResult<Vec<ConsumedMessage>>;

    /// Appends a batch and returns the offset assigned to every record.
    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        records: Vec<ProducerRecord>,
    ) -> KafkaResult<Vec<i64>>;

    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> KafkaResult<()>;

    async fn fetch_committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> KafkaResult<Option<i64>>;
}
