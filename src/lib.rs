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

mod admin;
mod consumer;
pub mod coordination;
mod group;
pub mod kafka;
mod message;
mod offset;
mod producer;
pub mod service;

pub use admin::{PartitionOffset, PartitionOffsetInfo};
pub use consumer::ConsumeOptions;
pub use coordination::{CoordinationClient, MemoryEnsemble, MemorySession};
pub use group::{MemberRegistration, PartitionAssigner, PartitionSet};
pub use kafka::{KafkaClient, KafkaError, MemoryCluster};
pub use message::{
    AckHandle, ConsumedMessage, Delivery, GroupTopic, ProduceResult, ProducerRecord,
    TopicPartition,
};
pub use offset::OffsetSnapshot;
pub use service::{
    setup_local_tracing, setup_tracing, App, AppConfig, AppError, AppResult, Proxy, ProxyConfig,
    Shutdown,
};
