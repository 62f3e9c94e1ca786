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

use bytes::Bytes;
use serde::Serialize;

/// A message read from a partition and buffered until it is handed out to a
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// milliseconds since the epoch
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ProducerRecord {
    pub fn new(key: Option<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProduceResult {
    pub partition: i32,
    pub offset: i64,
}

/// Identifies a handed-out message; pass it back to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AckHandle {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub message: ConsumedMessage,
    pub ack: AckHandle,
}

impl Delivery {
    pub fn new(group: &str, message: ConsumedMessage) -> Self {
        let ack = AckHandle {
            group: group.to_string(),
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
        };
        Self { message, ack }
    }
}
