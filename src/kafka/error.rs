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

use thiserror::Error;

pub type KafkaResult<T> = Result<T, KafkaError>;

/// Errors reported across the Kafka boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KafkaError {
    #[error("The server experienced an unexpected error: {0}")]
    Unknown(String),

    #[error("The requested offset is not within range: {0}")]
    OffsetOutOfRange(String),

    #[error("Unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("Leader not available: {0}")]
    LeaderNotAvailable(String),

    #[error("Not leader for partition: {0}")]
    NotLeaderForPartition(String),

    #[error("Request timed out: {0}")]
    RequestTimedOut(String),

    #[error("Broker not available: {0}")]
    BrokerNotAvailable(String),

    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    #[error("Network exception: {0}")]
    NetworkException(String),

    #[error("Group coordinator not available: {0}")]
    CoordinatorNotAvailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl KafkaError {
    /// Transient failures that a retry against the same cluster may cure.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            KafkaError::LeaderNotAvailable(_)
                | KafkaError::NotLeaderForPartition(_)
                | KafkaError::RequestTimedOut(_)
                | KafkaError::BrokerNotAvailable(_)
                | KafkaError::NetworkException(_)
                | KafkaError::CoordinatorNotAvailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(KafkaError::LeaderNotAvailable("t-0".into()), true)]
    #[case(KafkaError::RequestTimedOut("produce".into()), true)]
    #[case(KafkaError::NetworkException("reset".into()), true)]
    #[case(KafkaError::UnknownTopicOrPartition("t".into()), false)]
    #[case(KafkaError::MessageTooLarge("1MB".into()), false)]
    #[case(KafkaError::OffsetOutOfRange("42".into()), false)]
    fn test_retriable_classification(#[case] err: KafkaError, #[case] retriable: bool) {
        assert_eq!(err.is_retriable(), retriable);
    }
}
