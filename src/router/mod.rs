//! Authorization, service lookup and the JSON command pipeline.

pub use command_router::{CommandRouter, Service, ServiceFuture};
pub use common::{Common, InFlight};
pub use response::{
    error_body, Response, BAD_REQUEST, INTERNAL_ERROR, NOT_FOUND, UNAUTHORIZED,
};
pub use service_loader::ServiceLoader;
pub use verification::{
    AccessToken, CommandAuthorization, CommandsDefinition, CommandsVerification,
    AUTHORIZATION_F5, AUTHORIZATION_MONITOR, HEARTBEAT, MONITOR,
};

mod command_router;
mod common;
mod response;
mod service_loader;
mod verification;
