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

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn id(&self) -> String {
        self.to_string()
    }

    pub fn from_string(str_name: &str) -> AppResult<Self> {
        let (topic, partition) = str_name.rsplit_once('-').ok_or_else(|| {
            AppError::InvalidValue(format!("topic partition name: {}", str_name))
        })?;

        let partition = partition
            .parse()
            .map_err(|_| AppError::InvalidValue(format!("topic partition id: {}", partition)))?;

        Ok(Self::new(topic, partition))
    }
}

/// A consumer group's interest in one topic; the key of subscriptions and
/// partition assignments.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GroupTopic {
    pub group: String,
    pub topic: String,
}

impl GroupTopic {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
        }
    }
}

impl Display for GroupTopic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_name() {
        let tp = TopicPartition::new("orders-eu", 3);
        assert_eq!(tp.id(), "orders-eu-3");
        assert_eq!(TopicPartition::from_string("orders-eu-3").unwrap(), tp);
        assert!(TopicPartition::from_string("orders").is_err());
        assert!(TopicPartition::from_string("orders-x").is_err());
    }

    #[test]
    fn test_ordering_is_topic_then_partition() {
        let mut tps = vec![
            TopicPartition::new("b", 0),
            TopicPartition::new("a", 2),
            TopicPartition::new("a", 1),
        ];
        tps.sort();
        assert_eq!(
            tps,
            vec![
                TopicPartition::new("a", 1),
                TopicPartition::new("a", 2),
                TopicPartition::new("b", 0),
            ]
        );
    }
}
