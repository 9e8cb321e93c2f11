use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::{runtime, signal};
use tracing::{error, info};

use crate::network::{
    ConnectionRegistry, MessageSender, SendExecutor, TransportServer, DEFAULT_MAX_FRAME_SIZE,
};
use crate::request::{PayloadKind, ProcessorProvider};
use crate::router::{Common, CommandRouter, CommandsVerification, Service, ServiceLoader};
use crate::service::{ServerConfig, ServiceMode};
use crate::{AppError, AppResult};

type InfoSupplier = Box<dyn Fn() -> Value + Send + Sync>;

/// Wires configuration, authorization, services and the transport server
/// together.
///
/// Services are registered with explicit `register` calls before `start`.
/// In `json` mode requests go through a [`CommandRouter`]; the `text` and
/// `data` modes need a provider set with [`ServerApplication::with_provider`].
pub struct ServerApplication {
    config: ServerConfig,
    services: ServiceLoader<dyn Service>,
    verification: Arc<CommandsVerification>,
    provider: Option<Arc<dyn ProcessorProvider>>,
    additional_info: Option<InfoSupplier>,
}

impl ServerApplication {
    pub fn new(config: ServerConfig) -> Self {
        ServerApplication {
            config,
            services: ServiceLoader::new(),
            verification: Arc::new(CommandsVerification::new()),
            provider: None,
            additional_info: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn verification(&self) -> &Arc<CommandsVerification> {
        &self.verification
    }

    pub fn register<F>(&self, command: impl Into<String>, cache: bool, factory: F) -> AppResult<()>
    where
        F: Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    {
        self.services.register(command, cache, factory)
    }

    /// Replaces the command router, required for the `text` and `data` modes.
    pub fn with_provider(mut self, provider: Arc<dyn ProcessorProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Value reported under `additionalInfo` by the monitor command.
    pub fn with_monitor_info<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.additional_info = Some(Box::new(supplier));
        self
    }

    /// Loads the authorization file, binds the listener and starts serving.
    pub async fn start(self) -> AppResult<TransportServer> {
        let ServerApplication {
            config,
            services,
            verification,
            provider,
            additional_info,
        } = self;

        if let Some(path) = &config.commands.path {
            verification.load_commands(path)?;
        }

        let network_conf = &config.network;
        let listen_address = network_conf.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg =
                format!("Failed to bind server to address: {listen_address} - Error: {err}");
            error!("{error_msg}");
            AppError::IllegalStateError(error_msg)
        })?;
        info!("tcp server binding to {} for listening", &listen_address);

        let executor = Arc::new(SendExecutor::new());
        let registry = Arc::new(ConnectionRegistry::new());

        let provider: Arc<dyn ProcessorProvider> = match (network_conf.mode, provider) {
            (mode, Some(provider)) => {
                let expected = match mode {
                    ServiceMode::Json => PayloadKind::Json,
                    ServiceMode::Text => PayloadKind::Text,
                    ServiceMode::Data => PayloadKind::Binary,
                };
                if provider.payload_kind() != expected {
                    return Err(AppError::InvalidValue(format!(
                        "mode {mode:?} does not match provider payload {:?}",
                        provider.payload_kind()
                    )));
                }
                provider
            }
            (ServiceMode::Json, None) => {
                let sender = MessageSender::new(registry.clone(), executor.clone());
                let mut common = Common::new(&config.general, network_conf, sender);
                if let Some(supplier) = additional_info {
                    common = common.with_additional_info(supplier);
                }
                info!("{} services registered: {:?}", services.len(), services.commands());
                Arc::new(CommandRouter::new(
                    verification,
                    Arc::new(services),
                    Arc::new(common),
                ))
            }
            (mode, None) => {
                return Err(AppError::InvalidValue(format!(
                    "mode {mode:?} needs a processor provider"
                )))
            }
        };

        let max_frame_size = match network_conf.mode {
            ServiceMode::Data => DEFAULT_MAX_FRAME_SIZE,
            _ => network_conf.max_line_length,
        };

        let server = TransportServer::builder()
            .listener(listener)
            .provider(provider)
            .socket_timeout(network_conf.socket_timeout())
            .write_timeout(network_conf.write_timeout())
            .send_executor(executor.clone())
            .registry(registry)
            .max_connections(network_conf.max_connection)
            .max_frame_size(max_frame_size)
            .build()?;
        server.start()?;
        Ok(server)
    }

    /// Serves until Ctrl-C, then closes every connection.
    pub async fn run(self) -> AppResult<()> {
        let server = self.start().await?;

        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {err}");
        }
        info!("get shutdown signal");

        let executor = server.send_executor().clone();
        server.close().await;
        executor.shutdown().await;
        info!("server shutdown complete");
        Ok(())
    }

    /// Builds a multi-thread runtime and blocks on [`ServerApplication::run`].
    pub fn block_on_run(self) -> AppResult<()> {
        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
        rt.block_on(self.run())
    }
}

impl std::fmt::Debug for ServerApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerApplication")
            .field("config", &self.config)
            .field("services", &self.services)
            .finish()
    }
}
