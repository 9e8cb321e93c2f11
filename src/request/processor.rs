use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::network::WireMode;
use crate::request::RequestKind;

pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Handles every refined request of one connection.
pub trait CommandProcessor: Send + Sync {
    fn handle(&self, request: RequestKind) -> BoxFuture<'_>;
}

/// Which refinement the transport applies before calling the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// package framing, [`RequestKind::Binary`]
    Binary,
    /// line framing, [`RequestKind::Text`]
    Text,
    /// line framing, [`RequestKind::Json`]
    Json,
}

impl PayloadKind {
    pub fn wire(self) -> WireMode {
        match self {
            PayloadKind::Binary => WireMode::Package,
            PayloadKind::Text | PayloadKind::Json => WireMode::Line,
        }
    }
}

/// Supplied to a transport server by the application.
pub trait ProcessorProvider: Send + Sync + 'static {
    fn payload_kind(&self) -> PayloadKind;

    /// Called once per accepted connection.
    fn create_processor(&self) -> Arc<dyn CommandProcessor>;

    /// Called exactly once per connection, after it is unregistered and its
    /// socket is closed.
    fn offline(&self, _index: u32) {}
}
