use std::sync::Arc;

use tracing::debug;

use crate::network::connection::{Connection, Outbound};
use crate::network::frame::Data;
use crate::network::registry::ConnectionRegistry;
use crate::network::send_executor::SendExecutor;
use crate::{AppError, AppResult};

/// What a handler may do with the connection a request arrived on.
///
/// Both calls only enqueue; the write happens on the send executor. They stay
/// usable after the handler returns.
pub trait Sendable<T>: Send + Sync {
    fn send(&self, message: T) -> AppResult<()>;

    /// Sends `message`, then closes the connection.
    fn send_close(&self, message: T) -> AppResult<()>;

    fn index(&self) -> u32;
}

/// [`Sendable`] bound to one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    connection: Arc<Connection>,
    executor: Arc<SendExecutor>,
}

impl ConnectionSender {
    pub fn new(connection: Arc<Connection>, executor: Arc<SendExecutor>) -> Self {
        ConnectionSender {
            connection,
            executor,
        }
    }

    fn enqueue(&self, message: Outbound, close: bool) -> AppResult<()> {
        if close {
            // later sends are refused from here on
            if !self.connection.mark_closed() {
                return Err(closed_error(self.connection.index()));
            }
            return self.executor.send_close(&self.connection, message);
        }
        if self.connection.is_closed() {
            return Err(closed_error(self.connection.index()));
        }
        self.executor.send(&self.connection, message)
    }
}

fn closed_error(index: u32) -> AppError {
    AppError::IllegalStateError(format!("connection {index} is closed"))
}

impl Sendable<String> for ConnectionSender {
    fn send(&self, message: String) -> AppResult<()> {
        self.enqueue(Outbound::Text(message), false)
    }

    fn send_close(&self, message: String) -> AppResult<()> {
        self.enqueue(Outbound::Text(message), true)
    }

    fn index(&self) -> u32 {
        self.connection.index()
    }
}

impl Sendable<Data> for ConnectionSender {
    fn send(&self, message: Data) -> AppResult<()> {
        self.enqueue(Outbound::Data(message), false)
    }

    fn send_close(&self, message: Data) -> AppResult<()> {
        self.enqueue(Outbound::Data(message), true)
    }

    fn index(&self) -> u32 {
        self.connection.index()
    }
}

/// Application side sending by connection index, for pushes that do not
/// answer a request.
#[derive(Debug, Clone)]
pub struct MessageSender {
    registry: Arc<ConnectionRegistry>,
    executor: Arc<SendExecutor>,
}

impl MessageSender {
    pub fn new(registry: Arc<ConnectionRegistry>, executor: Arc<SendExecutor>) -> Self {
        MessageSender { registry, executor }
    }

    fn sender(&self, index: u32) -> AppResult<ConnectionSender> {
        self.registry
            .get(index)
            .map(|connection| ConnectionSender::new(connection, self.executor.clone()))
            .ok_or_else(|| AppError::IllegalStateError(format!("no open connection {index}")))
    }

    pub fn send(&self, index: u32, message: impl Into<Outbound>) -> AppResult<()> {
        self.sender(index)?.enqueue(message.into(), false)
    }

    pub fn send_close(&self, index: u32, message: impl Into<Outbound>) -> AppResult<()> {
        self.sender(index)?.enqueue(message.into(), true)
    }

    /// Queues `message` on every open connection and returns how many took it.
    pub fn broadcast(&self, message: impl Into<Outbound>) -> usize {
        let message = message.into();
        let mut delivered = 0;
        for connection in self.registry.connections() {
            let sender = ConnectionSender::new(connection, self.executor.clone());
            match sender.enqueue(message.clone(), false) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("broadcast skipped: {e}"),
            }
        }
        delivered
    }

    pub fn connections(&self) -> usize {
        self.registry.len()
    }

    /// Messages queued on the send executor and not yet written.
    pub fn queue_size(&self) -> usize {
        self.executor.queue_size()
    }
}
