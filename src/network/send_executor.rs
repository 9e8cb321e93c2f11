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

//! Outbound write path.
//!
//! Handlers never touch a socket. They enqueue a [`SendTask`] on the
//! connection's own outbound queue and return; a writer task spawned for that
//! connection performs the writes in queue order. A peer that stops reading
//! only stalls its own writer, never another connection's.

use std::any::type_name;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace, warn};

use crate::network::connection::{Connection, Outbound};
use crate::network::frame::Data;
use crate::{AppError, AppResult, Shutdown};

/// Hooks around every binary frame written to a peer.
pub trait TransferListener: Send + Sync + 'static {
    fn before_transfer(&self, _index: u32, _data: &Data) {}

    fn after_transfer(&self, _index: u32, _data: &Data, _result: &io::Result<usize>) {}
}

/// The listener used when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransferListener;

impl TransferListener for NoopTransferListener {}

#[derive(Debug)]
pub enum SendTask {
    Message(Outbound),
    /// Shut the connection down once everything queued before it is written.
    Close,
}

pub type OutboundSender = async_channel::Sender<SendTask>;
pub type OutboundReceiver = async_channel::Receiver<SendTask>;

/// A fresh outbound queue for one connection.
pub fn outbound_queue() -> (OutboundSender, OutboundReceiver) {
    async_channel::unbounded()
}

/// Spawns and tracks one writer task per connection.
///
/// Shutdown follows the same broadcast / mpsc pattern as the transport
/// server: every writer holds a clone of `shutdown_complete_tx`, and
/// `shutdown` returns once the receiver sees all of them dropped.
#[derive(Debug)]
pub struct SendExecutor {
    queued: Arc<AtomicUsize>,
    writers: Arc<AtomicUsize>,
    closed: AtomicBool,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl SendExecutor {
    pub fn new() -> SendExecutor {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        SendExecutor {
            queued: Arc::new(AtomicUsize::new(0)),
            writers: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            notify_shutdown,
            shutdown_complete_tx: parking_lot::Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: tokio::sync::Mutex::new(Some(shutdown_complete_rx)),
        }
    }

    /// Starts the writer draining `receiver` into `connection`.
    ///
    /// Must run inside a tokio runtime. After `shutdown` nothing is spawned and
    /// the queue is dropped, so later sends on the connection fail.
    pub fn attach(&self, connection: Arc<Connection>, receiver: OutboundReceiver) {
        let Some(shutdown_complete_tx) = self.shutdown_complete_tx.lock().clone() else {
            debug!(
                "send executor is shut down, connection {} gets no writer",
                connection.index()
            );
            return;
        };
        self.writers.fetch_add(1, Ordering::AcqRel);
        let writer = Writer {
            connection,
            receiver,
            queued: self.queued.clone(),
            writers: self.writers.clone(),
            shutdown: Shutdown::subscribe(&self.notify_shutdown),
            _shutdown_complete_tx: shutdown_complete_tx,
        };
        writer.spawn();
    }

    pub fn submit(&self, connection: &Connection, task: SendTask) -> AppResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::ChannelSendError(
                "send executor is shut down".into(),
            ));
        }
        // counted first so the writer never sees the task before the count
        self.queued.fetch_add(1, Ordering::AcqRel);
        connection.outbound().try_send(task).map_err(|e| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            AppError::ChannelSendError(format!("connection {}: {e}", connection.index()))
        })
    }

    pub fn send(&self, connection: &Connection, message: Outbound) -> AppResult<()> {
        self.submit(connection, SendTask::Message(message))
    }

    /// Queues `message` followed by a close of the connection.
    pub fn send_close(&self, connection: &Connection, message: Outbound) -> AppResult<()> {
        self.send(connection, message)?;
        self.close(connection)
    }

    pub fn close(&self, connection: &Connection) -> AppResult<()> {
        self.submit(connection, SendTask::Close)
    }

    /// Tasks queued on any connection and not yet taken by its writer.
    pub fn queue_size(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn active_writers(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }

    /// Refuses new tasks, lets every writer finish what is already queued,
    /// then waits for all of them to exit.
    ///
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        let mut shutdown_complete_rx = self.shutdown_complete_rx.lock().await;
        let Some(mut rx) = shutdown_complete_rx.take() else {
            return;
        };
        self.closed.store(true, Ordering::Release);
        let _ = self.notify_shutdown.send(());
        drop(self.shutdown_complete_tx.lock().take());

        // every writer holds a sender; None means all are gone
        let _ = rx.recv().await;
        debug!("send executor drained");
    }
}

impl Default for SendExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains one connection's queue.
struct Writer {
    connection: Arc<Connection>,
    receiver: OutboundReceiver,
    queued: Arc<AtomicUsize>,
    writers: Arc<AtomicUsize>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl Writer {
    fn spawn(self) {
        let connection = self.connection.clone();
        let writers = self.writers.clone();
        let index = connection.index();
        let handle = tokio::spawn(self.run());
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                writers.fetch_sub(1, Ordering::AcqRel);
                if err.is_panic() {
                    log_writer_panic(index, err);
                } else {
                    error!("writer of connection {index} was cancelled");
                }
                // the connection task waits for this
                connection.close().await;
            }
        });
    }

    async fn run(mut self) {
        let index = self.connection.index();
        trace!("writer of connection {index} started");
        loop {
            let task = tokio::select! {
                biased;
                task = self.receiver.recv() => match task {
                    Ok(task) => task,
                    // closed and empty
                    Err(_) => break,
                },
                _ = self.shutdown.recv() => {
                    // keep draining what is already queued
                    self.receiver.close();
                    continue;
                }
            };
            self.queued.fetch_sub(1, Ordering::AcqRel);

            match task {
                SendTask::Message(message) => {
                    if let Err(e) = self.connection.write(&message).await {
                        // fire and forget: the peer is unusable, drop the connection
                        warn!("send failed, closing connection: {e}");
                        self.connection.close().await;
                        break;
                    }
                }
                SendTask::Close => {
                    debug!("closing connection {index}");
                    self.connection.close().await;
                    break;
                }
            }
        }

        // whatever is left can never be written
        self.receiver.close();
        let dropped = self.receiver.len();
        if dropped > 0 {
            self.queued.fetch_sub(dropped, Ordering::AcqRel);
            debug!("connection {index} dropped {dropped} queued messages");
        }
        self.writers.fetch_sub(1, Ordering::AcqRel);
        trace!("writer of connection {index} exited");
    }
}

fn log_writer_panic(index: u32, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("writer of connection {index} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("writer of connection {index} panicked with message: {message}");
    } else {
        error!(
            "writer of connection {index} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
