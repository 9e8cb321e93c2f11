pub mod network;
pub mod request;
pub mod router;
pub mod service;

pub use network::{Data, DataType, MessageSender, TransportServer};
pub use request::{CommandProcessor, DefaultRequest, PayloadKind, ProcessorProvider, RequestKind};
pub use router::{Common, CommandRouter, CommandsVerification, Response, Service, ServiceLoader};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ServerApplication, ServerConfig,
    Shutdown,
};
