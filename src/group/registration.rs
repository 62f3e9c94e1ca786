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

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Data stored in a member node, in the layout kazoo-based consumers write:
/// `{"version":1,"subscription":{"<topic>":1},"pattern":"static","timestamp":"<ms>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRegistration {
    pub version: i32,
    pub subscription: BTreeMap<String, i32>,
    pub pattern: String,
    pub timestamp: String,
}

impl MemberRegistration {
    pub fn new<'a>(topics: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            version: 1,
            subscription: topics.into_iter().map(|topic| (topic.clone(), 1)).collect(),
            pattern: "static".to_string(),
            timestamp: Utc::now().timestamp_millis().to_string(),
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &String> {
        self.subscription.keys()
    }

    pub fn to_bytes(&self) -> AppResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| AppError::InvalidValue(format!("member registration: {}", e)))
    }

    pub fn from_bytes(data: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| AppError::InvalidValue(format!("member registration: {}", e)))
    }
}
