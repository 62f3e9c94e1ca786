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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::paths::split;
use super::{
    CoordinationClient, CoordinationError, CoordinationResult, SessionEvent, WatchEvent,
    WatchStream,
};

const WATCH_CHANNEL_SIZE: usize = 64;

/// An in-process coordination ensemble. Every [`MemorySession`] connected to
/// the same ensemble sees the same tree.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

#[derive(Debug)]
struct EnsembleInner {
    state: Mutex<EnsembleState>,
    available: AtomicBool,
}

#[derive(Debug, Default)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    watchers: Vec<Watcher>,
}

#[derive(Debug)]
struct Node {
    data: Bytes,
    /// session owning an ephemeral node
    owner: Option<Uuid>,
}

#[derive(Debug)]
struct Watcher {
    path: String,
    session: Uuid,
    tx: mpsc::Sender<WatchEvent>,
}

impl EnsembleState {
    fn ensure_parents(&mut self, path: &str) {
        let (mut parent, _) = split(path);
        while !parent.is_empty() {
            self.nodes.entry(parent.to_string()).or_insert(Node {
                data: Bytes::new(),
                owner: None,
            });
            parent = split(parent).0;
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        let path = match &event {
            WatchEvent::ChildCreated(path)
            | WatchEvent::ChildDeleted(path)
            | WatchEvent::DataChanged(path) => path.clone(),
        };
        let (parent, _) = split(&path);
        self.watchers.retain(|watcher| !watcher.tx.is_closed());
        for watcher in self.watchers.iter().filter(|w| w.path == parent) {
            // a full channel already holds a pending wakeup
            let _ = watcher.tx.try_send(event.clone());
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn drop_session(&mut self, session: Uuid) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.notify(WatchEvent::ChildDeleted(path));
        }
        self.watchers.retain(|watcher| watcher.session != session);
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EnsembleInner {
                state: Mutex::new(EnsembleState::default()),
                available: AtomicBool::new(true),
            }),
        }
    }

    pub fn connect(&self) -> MemorySession {
        let (events, _) = broadcast::channel(16);
        MemorySession {
            ensemble: self.clone(),
            shared: Arc::new(SessionShared {
                id: Mutex::new(Uuid::new_v4()),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// While unavailable every call fails with `ConnectionLoss`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.state.lock().children(path)
    }

    pub fn data(&self, path: &str) -> Option<Bytes> {
        self.inner
            .state
            .lock()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }
}

/// One client session against a [`MemoryEnsemble`]. Clones share the session.
#[derive(Debug, Clone)]
pub struct MemorySession {
    ensemble: MemoryEnsemble,
    shared: Arc<SessionShared>,
}

#[derive(Debug)]
struct SessionShared {
    id: Mutex<Uuid>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> Uuid {
        *self.shared.id.lock()
    }

    /// Expires the session as the ensemble would after a long partition:
    /// ephemeral nodes and watches vanish, then the client reconnects under a
    /// fresh session id.
    pub fn expire(&self) {
        let old = {
            let mut id = self.shared.id.lock();
            std::mem::replace(&mut *id, Uuid::new_v4())
        };
        self.ensemble.inner.state.lock().drop_session(old);
        debug!("session {} expired", old);
        let _ = self.shared.events.send(SessionEvent::Expired);
        let _ = self.shared.events.send(SessionEvent::Connected);
    }

    fn check(&self) -> CoordinationResult<Uuid> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        if !self.ensemble.inner.available.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss(
                "ensemble unavailable".to_string(),
            ));
        }
        Ok(self.id())
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        let session = self.check()?;
        let mut state = self.ensemble.inner.state.lock();
        if state.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        state.ensure_parents(path);
        state.nodes.insert(
            path.to_string(),
            Node {
                data,
                owner: Some(session),
            },
        );
        state.notify(WatchEvent::ChildCreated(path.to_string()));
        Ok(())
    }

    async fn set_data(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        self.check()?;
        let mut state = self.ensemble.inner.state.lock();
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        node.data = data;
        state.notify(WatchEvent::DataChanged(path.to_string()));
        Ok(())
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<Option<Bytes>> {
        self.check()?;
        Ok(self.ensemble.data(path))
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.check()?;
        Ok(self.ensemble.children(path))
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.check()?;
        let mut state = self.ensemble.inner.state.lock();
        if state.nodes.remove(path).is_some() {
            state.notify(WatchEvent::ChildDeleted(path.to_string()));
        }
        Ok(())
    }

    async fn watch(&self, path: &str) -> CoordinationResult<WatchStream> {
        let session = self.check()?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        self.ensemble.inner.state.lock().watchers.push(Watcher {
            path: path.to_string(),
            session,
            tx,
        });
        Ok(rx)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.id();
        self.ensemble.inner.state.lock().drop_session(id);
        debug!("session {} closed", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_nodes_and_children() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let b = ensemble.connect();

        a.create_ephemeral("/consumers/g/ids/a", Bytes::from_static(b"1"))
            .await
            .unwrap();
        b.create_ephemeral("/consumers/g/ids/b", Bytes::from_static(b"2"))
            .await
            .unwrap();
        assert_eq!(
            a.create_ephemeral("/consumers/g/ids/b", Bytes::new()).await,
            Err(CoordinationError::NodeExists("/consumers/g/ids/b".into()))
        );
        assert_eq!(a.children("/consumers/g/ids").await.unwrap(), vec!["a", "b"]);
        assert_eq!(a.children("/consumers/g").await.unwrap(), vec!["ids"]);
        assert!(a.children("/missing").await.unwrap().is_empty());

        b.close().await;
        assert_eq!(a.children("/consumers/g/ids").await.unwrap(), vec!["a"]);
        assert_eq!(b.children("/").await, Err(CoordinationError::Closed));
    }

    #[tokio::test]
    async fn test_watch_sees_siblings() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let b = ensemble.connect();
        let mut watch = a.watch("/consumers/g/ids").await.unwrap();

        b.create_ephemeral("/consumers/g/ids/b", Bytes::new())
            .await
            .unwrap();
        b.set_data("/consumers/g/ids/b", Bytes::from_static(b"x"))
            .await
            .unwrap();
        b.delete("/consumers/g/ids/b").await.unwrap();
        b.delete("/consumers/g/ids/b").await.unwrap();

        assert_eq!(
            watch.recv().await,
            Some(WatchEvent::ChildCreated("/consumers/g/ids/b".into()))
        );
        assert_eq!(
            watch.recv().await,
            Some(WatchEvent::DataChanged("/consumers/g/ids/b".into()))
        );
        assert_eq!(
            watch.recv().await,
            Some(WatchEvent::ChildDeleted("/consumers/g/ids/b".into()))
        );
        assert!(watch.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expire_drops_ephemerals_and_watches() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let mut events = a.session_events();
        let mut watch = a.watch("/consumers/g/ids").await.unwrap();
        a.create_ephemeral("/consumers/g/ids/a", Bytes::new())
            .await
            .unwrap();
        let before = a.id();

        a.expire();
        assert_ne!(a.id(), before);
        assert!(ensemble.children("/consumers/g/ids").is_empty());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);

        assert_eq!(
            watch.recv().await,
            Some(WatchEvent::ChildCreated("/consumers/g/ids/a".into()))
        );
        assert_eq!(
            watch.recv().await,
            Some(WatchEvent::ChildDeleted("/consumers/g/ids/a".into()))
        );
        assert_eq!(watch.recv().await, None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        ensemble.set_available(false);
        let err = a.children("/").await.unwrap_err();
        assert!(err.is_retriable());
        ensemble.set_available(true);
        assert!(a.children("/").await.is_ok());
    }
}
