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

use crate::coordination::CoordinationError;
use crate::kafka::KafkaError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    /// remote service errors
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    /// client protocol errors
    #[error("not subscribed: group={group}, topic={topic}")]
    NotSubscribed { group: String, topic: String },

    #[error("unknown offset: group={group}, topic={topic}, partition={partition}, offset={offset}")]
    UnknownOffset {
        group: String,
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// lifecycle errors
    #[error("proxy is shutting down")]
    ShuttingDown,

    #[error("shutdown timeout: {0}")]
    ShutdownTimeout(String),
}
