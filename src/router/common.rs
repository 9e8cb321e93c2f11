use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::network::MessageSender;
use crate::request::DefaultRequest;
use crate::router::Response;
use crate::service::{GeneralConfig, NetworkConfig};

type InfoSupplier = Arc<dyn Fn() -> Value + Send + Sync>;

/// Shared context handed to every service.
pub struct Common {
    name: String,
    alias: String,
    version: String,
    ip: String,
    port: u16,
    heartbeat: String,
    server_info: String,
    in_flight: Arc<AtomicUsize>,
    sender: MessageSender,
    additional_info: Option<InfoSupplier>,
}

impl Common {
    pub fn new(general: &GeneralConfig, network: &NetworkConfig, sender: MessageSender) -> Self {
        let server_info = json!({
            "data": "pong",
            "serverInfo": {
                "name": general.name,
                "alias": general.alias,
                "version": general.version,
            }
        })
        .to_string();

        Common {
            name: general.name.clone(),
            alias: general.alias.clone(),
            version: general.version.clone(),
            ip: network.ip.clone(),
            port: network.port,
            heartbeat: general.heartbeat.clone(),
            server_info,
            in_flight: Arc::new(AtomicUsize::new(0)),
            sender,
            additional_info: None,
        }
    }

    /// Extra value reported under `additionalInfo` by the monitor command.
    pub fn with_additional_info<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.additional_info = Some(Arc::new(supplier));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Requests currently being handled by services.
    pub fn request_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Counts one request in flight until the guard is dropped.
    pub fn begin_request(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            counter: self.in_flight.clone(),
        }
    }

    /// Answers a heartbeat and closes the connection.
    ///
    /// A truthy `serverInfo` in the request asks for name, alias and version.
    pub fn send_pong(&self, request: &DefaultRequest, response: &Response) {
        let with_info = match request.json().get("serverInfo") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
            _ => false,
        };
        if with_info {
            response.send_close(self.server_info.as_str());
        } else {
            response.send_close(self.heartbeat.as_str());
        }
    }

    /// Reports server status and closes the connection.
    pub fn send_monitor(&self, response: &Response) {
        response.send_close(self.monitor_info().to_string());
    }

    pub fn monitor_info(&self) -> Value {
        let mut server = Map::new();
        server.insert("name".into(), Value::from(self.name.as_str()));
        server.insert("alias".into(), Value::from(self.alias.as_str()));
        server.insert("ip".into(), Value::from(self.ip.as_str()));
        server.insert("port".into(), Value::from(self.port));
        server.insert("queueSize".into(), Value::from(self.sender.queue_size()));
        server.insert("connections".into(), Value::from(self.sender.connections()));
        if let Some(supplier) = &self.additional_info {
            server.insert("additionalInfo".into(), supplier());
        }
        json!({ "server": server })
    }
}

impl fmt::Debug for Common {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Common")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("version", &self.version)
            .field("port", &self.port)
            .field("in_flight", &self.request_count())
            .finish()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
