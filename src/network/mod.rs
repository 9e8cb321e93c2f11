//! Network Module Implementation
//!
//! Everything between the TCP socket and a refined request: framing, the
//! per-connection read task, the connection registry and the asynchronous
//! send path.
//!
//! # Components
//!
//! - `TransportServer`: accept loop and one task per connection
//! - `Connection` / `FrameReader`: the two halves of an accepted socket
//! - `ConnectionRegistry`: open connections by index
//! - `SendExecutor`: one writer task per connection performing every outbound write
//! - `PackageCodec` / `LineCodec`: stream framing of the binary and text variants
//! - `Data` / `DataType`: the typed binary frame

pub use codec::{LineCodec, PackageCodec, END_PACKAGE, HEADER_LENGTH, MTU, PACKAGE};
pub use connection::{Connection, FrameReader, Inbound, Outbound, WireMode};
pub use frame::{Data, DataType, TYPE_LENGTH};
pub use registry::ConnectionRegistry;
pub use send_executor::{NoopTransferListener, SendExecutor, SendTask, TransferListener};
pub use sender::{ConnectionSender, MessageSender, Sendable};
pub use server::{
    TransportServer, TransportServerBuilder, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_WRITE_TIMEOUT,
};

mod codec;
mod connection;
mod frame;
mod registry;
mod send_executor;
mod sender;
mod server;
