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

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::network::connection::{Connection, FrameReader, Inbound, WireMode};
use crate::network::registry::ConnectionRegistry;
use crate::network::send_executor::{
    outbound_queue, NoopTransferListener, SendExecutor, TransferListener,
};
use crate::network::sender::{ConnectionSender, MessageSender, Sendable};
use crate::network::Data;
use crate::request::{
    CommandProcessor, DataRequest, DefaultRequest, PayloadKind, ProcessorProvider, Request,
    RequestKind, TextRequest,
};
use crate::router::{Response, BAD_REQUEST};
use crate::{AppError, AppResult, Shutdown};

pub const DEFAULT_MAX_CONNECTIONS: usize = 200;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// State every connection task of one server needs.
struct Shared {
    provider: Arc<dyn ProcessorProvider>,
    payload_kind: PayloadKind,
    registry: Arc<ConnectionRegistry>,
    executor: Arc<SendExecutor>,
    socket_timeout: Option<Duration>,
    write_timeout: Duration,
    transfer_listener: Arc<dyn TransferListener>,
    max_frame_size: usize,
}

impl Shared {
    fn wire(&self) -> WireMode {
        self.payload_kind.wire()
    }
}

pub struct TransportServerBuilder {
    listener: Option<TcpListener>,
    provider: Option<Arc<dyn ProcessorProvider>>,
    socket_timeout: Option<Duration>,
    write_timeout: Duration,
    send_executor: Option<Arc<SendExecutor>>,
    registry: Option<Arc<ConnectionRegistry>>,
    transfer_listener: Option<Arc<dyn TransferListener>>,
    max_connections: usize,
    max_frame_size: usize,
}

impl TransportServerBuilder {
    fn new() -> Self {
        TransportServerBuilder {
            listener: None,
            provider: None,
            socket_timeout: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            send_executor: None,
            registry: None,
            transfer_listener: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Required. An already bound listener.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Required. Decides the payload kind and handles requests.
    pub fn provider(mut self, provider: Arc<dyn ProcessorProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Idle read timeout. Expiry is logged and the read continues.
    pub fn socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Shares an executor. Without one the server builds its own and shuts
    /// it down in `close`.
    pub fn send_executor(mut self, executor: Arc<SendExecutor>) -> Self {
        self.send_executor = Some(executor);
        self
    }

    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transfer_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.transfer_listener = Some(listener);
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Must run inside a tokio runtime when no executor was supplied.
    pub fn build(self) -> AppResult<TransportServer> {
        let listener = self
            .listener
            .ok_or_else(|| AppError::InvalidValue("transport server needs a listener".into()))?;
        let provider = self
            .provider
            .ok_or_else(|| AppError::InvalidValue("transport server needs a provider".into()))?;
        if self.max_connections == 0 {
            return Err(AppError::InvalidValue(
                "max_connections must be greater than 0".into(),
            ));
        }
        let local_addr = listener.local_addr()?;

        let owns_executor = self.send_executor.is_none();
        let executor = match self.send_executor {
            Some(executor) => executor,
            None => Arc::new(SendExecutor::new()),
        };
        let shared = Arc::new(Shared {
            payload_kind: provider.payload_kind(),
            provider,
            registry: self.registry.unwrap_or_default(),
            executor,
            socket_timeout: self.socket_timeout,
            write_timeout: self.write_timeout,
            transfer_listener: self
                .transfer_listener
                .unwrap_or_else(|| Arc::new(NoopTransferListener)),
            max_frame_size: self.max_frame_size,
        });

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        Ok(TransportServer {
            shared,
            local_addr,
            max_connections: self.max_connections,
            owns_executor,
            notify_shutdown,
            listener: parking_lot::Mutex::new(Some(listener)),
            accept_task: parking_lot::Mutex::new(None),
            shutdown_complete_tx: parking_lot::Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: tokio::sync::Mutex::new(Some(shutdown_complete_rx)),
        })
    }
}

/// Accept loop plus one task per connection, for either payload kind.
///
/// Shutdown follows the broadcast / mpsc pattern: `close` broadcasts, every
/// connection task holds a clone of `shutdown_complete_tx`, and `close`
/// returns once the receiver sees all of them dropped.
pub struct TransportServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    max_connections: usize,
    owns_executor: bool,
    notify_shutdown: broadcast::Sender<()>,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_complete_tx: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl TransportServer {
    pub fn builder() -> TransportServerBuilder {
        TransportServerBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    pub fn send_executor(&self) -> &Arc<SendExecutor> {
        &self.shared.executor
    }

    pub fn message_sender(&self) -> MessageSender {
        MessageSender::new(self.shared.registry.clone(), self.shared.executor.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Spawns the accept loop and returns.
    pub fn start(&self) -> AppResult<()> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            AppError::IllegalStateError("transport server already started or closed".into())
        })?;
        let shutdown_complete_tx = self.shutdown_complete_tx.lock().clone().ok_or_else(|| {
            AppError::IllegalStateError("transport server already closed".into())
        })?;

        let acceptor = Acceptor {
            listener,
            shared: self.shared.clone(),
            limit_connections: Arc::new(Semaphore::new(self.max_connections)),
            notify_shutdown: self.notify_shutdown.clone(),
            shutdown_complete_tx,
        };
        info!(
            "transport server listening on {} ({:?})",
            self.local_addr, self.shared.payload_kind
        );
        *self.accept_task.lock() = Some(tokio::spawn(acceptor.run()));
        Ok(())
    }

    /// Stops accepting, closes every connection and waits until each one has
    /// gone offline. Valid before `start` and safe to repeat.
    pub async fn close(&self) {
        let mut shutdown_complete_rx = self.shutdown_complete_rx.lock().await;
        let Some(mut rx) = shutdown_complete_rx.take() else {
            return;
        };

        let _ = self.notify_shutdown.send(());
        // never started: dropping the listener closes the socket
        drop(self.listener.lock().take());

        let accept_task = self.accept_task.lock().take();
        if let Some(accept_task) = accept_task {
            if let Err(e) = accept_task.await {
                error!("accept loop ended abnormally: {e}");
            }
        }

        drop(self.shutdown_complete_tx.lock().take());
        trace!("waiting for connection tasks to finish");
        let _ = rx.recv().await;

        if self.owns_executor {
            self.shared.executor.shutdown().await;
        }
        info!("transport server on {} closed", self.local_addr);
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("local_addr", &self.local_addr)
            .field("payload_kind", &self.shared.payload_kind)
            .field("connections", &self.shared.registry.len())
            .finish()
    }
}

struct Acceptor {
    listener: TcpListener,
    shared: Arc<Shared>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    #[tracing::instrument(skip(self), fields(addr = ?self.listener.local_addr().ok()))]
    async fn run(self) {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        loop {
            // subscribed before accepting so a close racing the accept is not missed
            let connection_shutdown = Shutdown::subscribe(&self.notify_shutdown);

            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let (socket, peer) = tokio::select! {
                res = self.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(cause = %e, "failed to accept");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            };
            debug!("accept new connection from {peer}");

            let handler = ConnectionHandler::new(
                socket,
                peer,
                self.shared.clone(),
                connection_shutdown,
                self.shutdown_complete_tx.clone(),
            );
            tokio::spawn(async move {
                handler.run().await;
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
            });
        }
        debug!("accept loop exited");
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {err}"
                        )));
                    }
                    warn!("accept failed, retrying in {backoff}s: {err}");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

// handler for each connection
struct ConnectionHandler {
    shared: Arc<Shared>,
    connection: Arc<Connection>,
    sender: Arc<ConnectionSender>,
    reader: FrameReader,
    processor: Arc<dyn CommandProcessor>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl ConnectionHandler {
    fn new(
        socket: TcpStream,
        peer: SocketAddr,
        shared: Arc<Shared>,
        shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        let (reader, writer) = socket.into_split();
        let wire = shared.wire();
        let (outbound, queue) = outbound_queue();
        let connection = shared.registry.register(|index| {
            Connection::new(
                index,
                peer.ip().to_string(),
                wire,
                writer,
                outbound,
                shared.write_timeout,
                shared.transfer_listener.clone(),
            )
        });
        shared.executor.attach(connection.clone(), queue);
        let sender = Arc::new(ConnectionSender::new(
            connection.clone(),
            shared.executor.clone(),
        ));
        ConnectionHandler {
            reader: FrameReader::new(reader, wire, shared.max_frame_size),
            processor: shared.provider.create_processor(),
            shared,
            connection,
            sender,
            shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    async fn run(mut self) {
        let index = self.connection.index();
        let mut closed = self.connection.close_notified();

        if let Err(err) = self.handle_connection(&mut closed).await {
            debug!("connection {index} error: {err}");
        }

        // unregister, flush and shut the socket, then report offline
        self.shared.registry.unregister(index);
        self.connection.mark_closed();
        if let Err(e) = self.shared.executor.close(&self.connection) {
            debug!("send executor unavailable for connection {index}: {e}");
            self.connection.close().await;
        }
        closed.recv().await;

        let ConnectionHandler {
            shared, reader, ..
        } = self;
        drop(reader);
        shared.provider.offline(index);
        shared.registry.release(index);
        debug!("connection {index} offline");
    }

    async fn handle_connection(&mut self, closed: &mut Shutdown) -> AppResult<()> {
        loop {
            let read = self.reader.read_unit();
            let unit = tokio::select! {
                res = read_with_timeout(read, self.shared.socket_timeout) => res,
                _ = self.shutdown.recv() => {
                    debug!("connection handler exit read loop after recv shutdown signal");
                    return Ok(());
                }
                _ = closed.recv() => return Ok(()),
            };

            let unit = match unit {
                Some(unit) => unit?,
                None => {
                    trace!("connection {} read timed out", self.connection.index());
                    continue;
                }
            };
            match unit {
                Some(unit) => self.dispatch(unit).await,
                // client close the connection gracefully
                None => return Ok(()),
            }
        }
    }

    async fn dispatch(&self, unit: Inbound) {
        let index = self.connection.index();
        let ip = self.connection.ip().to_string();
        let request = match (unit, self.shared.payload_kind) {
            (Inbound::Frame(frame), _) => {
                let sender: Arc<dyn Sendable<Data>> = self.sender.clone();
                match DataRequest::parse(Request::new(index, ip, frame, sender)) {
                    Ok(request) => RequestKind::Binary(request),
                    Err(e) => {
                        // only this frame is lost
                        warn!("connection {index} dropped a frame: {e}");
                        return;
                    }
                }
            }
            (Inbound::Line(line), kind) => {
                let sender: Arc<dyn Sendable<String>> = self.sender.clone();
                let raw = Bytes::from(line);
                let request = Request::new(index, ip, raw.clone(), sender.clone());
                if kind == PayloadKind::Json {
                    match DefaultRequest::parse(request) {
                        Ok(request) => RequestKind::Json(request),
                        Err(e) => {
                            Response::new(sender).send_error_close(
                                &String::from_utf8_lossy(&raw),
                                BAD_REQUEST,
                                Some(&e.to_string()),
                            );
                            return;
                        }
                    }
                } else {
                    RequestKind::Text(TextRequest::parse(request))
                }
            }
        };

        let processor = self.processor.clone();
        // a panicking processor only loses this request
        if let Err(e) = tokio::spawn(async move { processor.handle(request).await }).await {
            error!("connection {index} processor failed: {e}");
        }
    }
}

/// `None` when the timeout expired first.
async fn read_with_timeout<F>(read: F, timeout: Option<Duration>) -> Option<F::Output>
where
    F: std::future::Future,
{
    match timeout {
        Some(timeout) => time::timeout(timeout, read).await.ok(),
        None => Some(read.await),
    }
}
