use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use commandnet::request::BoxFuture;
use commandnet::router::ServiceFuture;
use commandnet::service::{setup_local_tracing, setup_tracing, ServiceMode};
use commandnet::{
    AppResult, CommandProcessor, Common, DefaultRequest, PayloadKind, ProcessorProvider,
    RequestKind, Response, ServerApplication, ServerConfig, Service,
};
use dotenv::dotenv;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// write a daily rolling log file into this directory as well
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Answers with the request text unchanged.
struct EchoService;

impl Service for EchoService {
    fn do_job<'a>(
        &'a self,
        request: &'a DefaultRequest,
        response: &'a Response,
        _common: &'a Common,
    ) -> ServiceFuture<'a> {
        Box::pin(async move {
            response.send(request.text());
            Ok(())
        })
    }
}

/// Echo for the `text` and `data` modes.
struct EchoProcessor;

impl CommandProcessor for EchoProcessor {
    fn handle(&self, request: RequestKind) -> BoxFuture<'_> {
        Box::pin(async move {
            let result = match &request {
                RequestKind::Binary(request) => request.request().send(request.data().clone()),
                RequestKind::Text(request) => request.request().send(request.text().to_string()),
                RequestKind::Json(request) => request.request().send(request.text().to_string()),
            };
            if let Err(e) = result {
                warn!("echo to connection {} failed: {e}", request.index());
            }
        })
    }
}

struct EchoProvider(PayloadKind);

impl ProcessorProvider for EchoProvider {
    fn payload_kind(&self) -> PayloadKind {
        self.0
    }

    fn create_processor(&self) -> Arc<dyn CommandProcessor> {
        Arc::new(EchoProcessor)
    }

    fn offline(&self, index: u32) {
        info!("connection {index} offline");
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let _log_guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir, "commandnet.log")?),
        None => {
            setup_local_tracing()?;
            None
        }
    };

    //setup config
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let server_config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{}", serde_json::to_string_pretty(&server_config)?);
        return Ok(());
    }

    let mode = server_config.network.mode;
    let mut application = ServerApplication::new(server_config);
    application.register("/v1/server/echo", true, || Arc::new(EchoService) as Arc<dyn Service>)?;
    application = match mode {
        ServiceMode::Json => application,
        ServiceMode::Text => application.with_provider(Arc::new(EchoProvider(PayloadKind::Text))),
        ServiceMode::Data => {
            application.with_provider(Arc::new(EchoProvider(PayloadKind::Binary)))
        }
    };

    application.block_on_run()
}
