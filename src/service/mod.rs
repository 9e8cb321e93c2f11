pub use app_error::{AppError, AppResult};
pub use application::ServerApplication;
pub use config::{CommandsConfig, GeneralConfig, NetworkConfig, ServerConfig, ServiceMode};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod application;
mod config;
mod shutdown;
mod tracing_config;
