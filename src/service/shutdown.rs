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

use tokio::sync::broadcast;

/// Listens for the process-wide shutdown signal.
///
/// Every background loop owns one of these and selects on [`Shutdown::recv`];
/// the signal is a single `()` broadcast by the proxy when it stops.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn subscribe(notify_shutdown: &broadcast::Sender<()>) -> Shutdown {
        Shutdown::new(notify_shutdown.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Resolves once the signal was sent or every sender is gone.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_after_signal() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);
        assert!(!shutdown.is_shutdown());
        notify_shutdown.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // a second recv returns immediately
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn test_recv_when_sender_dropped() {
        let (notify_shutdown, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);
        drop(notify_shutdown);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
