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

/// Listens for a one-shot stop signal on a broadcast channel.
///
/// Used for the server-wide shutdown as well as the per-connection close
/// notification. Once a signal (or the drop of every sender) has been seen,
/// `recv` returns immediately on every later call.
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

    pub fn subscribe(sender: &broadcast::Sender<()>) -> Shutdown {
        Shutdown::new(sender.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Marks the signal as already seen.
    pub(crate) fn fire(&mut self) {
        self.is_shutdown = true;
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // a lagged receiver still means a signal was sent
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_is_sticky() {
        let (tx, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::subscribe(&tx);
        assert!(!shutdown.is_shutdown());

        tx.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());

        // second call must not block
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn test_sender_drop_counts_as_signal() {
        let (tx, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::subscribe(&tx);
        drop(tx);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
