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

//! The coordination-service boundary.
//!
//! Group membership lives in a ZooKeeper-like ensemble: every proxy taking
//! part in a group holds one ephemeral node under the group's `ids` path, and
//! sessions that die take their nodes with them. The core only depends on the
//! [`CoordinationClient`] trait; [`MemoryEnsemble`] implements it in process.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub use memory::{MemoryEnsemble, MemorySession};

mod memory;
pub mod paths;

pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("connection loss: {0}")]
    ConnectionLoss(String),

    #[error("session expired")]
    SessionExpired,

    #[error("node exists: {0}")]
    NodeExists(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("session closed")]
    Closed,
}

impl CoordinationError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoordinationError::ConnectionLoss(_) | CoordinationError::SessionExpired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Expired,
}

/// A change under a watched path. Carries the path of the node that changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ChildCreated(String),
    ChildDeleted(String),
    DataChanged(String),
}

/// Notifications for one watch. The stream ends when the session closes or
/// expires; watches do not survive a session.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

#[async_trait]
pub trait CoordinationClient: Send + Sync + Debug {
    /// Creates a node owned by this session, creating missing parents as
    /// persistent nodes.
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> CoordinationResult<()>;

    async fn set_data(&self, path: &str, data: Bytes) -> CoordinationResult<()>;

    async fn get_data(&self, path: &str) -> CoordinationResult<Option<Bytes>>;

    /// Names of the direct children of `path`, sorted. Empty when `path`
    /// does not exist.
    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    /// Deleting a missing node succeeds.
    async fn delete(&self, path: &str) -> CoordinationResult<()>;

    /// Watches the children of `path` and their data.
    async fn watch(&self, path: &str) -> CoordinationResult<WatchStream>;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Ends the session, removing its ephemeral nodes.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable() {
        assert!(CoordinationError::ConnectionLoss("reset".into()).is_retriable());
        assert!(CoordinationError::SessionExpired.is_retriable());
        assert!(!CoordinationError::NodeExists("/a".into()).is_retriable());
        assert!(!CoordinationError::Closed.is_retriable());
    }
}
