use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde_json::{Map, Value};

use crate::network::{Data, Sendable};
use crate::{AppError, AppResult};

/// Snapshot of one decoded unit, taken on the connection's read task.
///
/// `sender` is a capability to answer on the originating connection, not
/// ownership of the socket. Cloning is cheap.
pub struct Request<T> {
    index: u32,
    ip: String,
    raw: Bytes,
    sender: Arc<dyn Sendable<T>>,
}

impl<T> Request<T> {
    pub fn new(index: u32, ip: impl Into<String>, raw: Bytes, sender: Arc<dyn Sendable<T>>) -> Self {
        Request {
            index,
            ip: ip.into(),
            raw,
            sender,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn sender(&self) -> &Arc<dyn Sendable<T>> {
        &self.sender
    }

    pub fn send(&self, message: T) -> AppResult<()> {
        self.sender.send(message)
    }

    pub fn send_close(&self, message: T) -> AppResult<()> {
        self.sender.send_close(message)
    }
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Request {
            index: self.index,
            ip: self.ip.clone(),
            raw: self.raw.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("index", &self.index)
            .field("ip", &self.ip)
            .field("raw", &self.raw.len())
            .finish()
    }
}

/// A binary request with its type tag decoded.
#[derive(Debug, Clone)]
pub struct DataRequest {
    request: Request<Data>,
    data: Data,
}

impl DataRequest {
    /// Fails with `FrameDecode` when the type tag is unknown.
    pub fn parse(request: Request<Data>) -> AppResult<DataRequest> {
        let data = Data::decode(request.raw())?;
        Ok(DataRequest { request, data })
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn request(&self) -> &Request<Data> {
        &self.request
    }

    pub fn index(&self) -> u32 {
        self.request.index()
    }
}

/// A text request decoded as UTF-8; invalid sequences become U+FFFD.
#[derive(Debug, Clone)]
pub struct TextRequest {
    request: Request<String>,
    text: String,
}

impl TextRequest {
    pub fn parse(request: Request<String>) -> TextRequest {
        let text = String::from_utf8_lossy(request.raw()).into_owned();
        TextRequest { request, text }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn request(&self) -> &Request<String> {
        &self.request
    }

    pub fn index(&self) -> u32 {
        self.request.index()
    }
}

/// A JSON command request.
///
/// `command` and `authorization` are `None` when the key is missing or not a
/// string.
#[derive(Debug, Clone)]
pub struct DefaultRequest {
    request: Request<String>,
    text: String,
    json: Map<String, Value>,
    command: Option<String>,
    authorization: Option<String>,
    received_at: DateTime<Local>,
}

pub const COMMAND: &str = "command";
pub const AUTHORIZATION: &str = "authorization";

impl DefaultRequest {
    /// Fails with `MalformedRequest` unless the text is a JSON object.
    pub fn parse(request: Request<String>) -> AppResult<DefaultRequest> {
        let text = String::from_utf8_lossy(request.raw()).into_owned();
        let json = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(json)) => json,
            Ok(other) => {
                return Err(AppError::MalformedRequest(format!(
                    "expected a JSON object, got {other}"
                )))
            }
            Err(e) => return Err(AppError::MalformedRequest(e.to_string())),
        };
        // scalars are read as their JSON text, so `12` is the command "12"
        let string_field = |key: &str| match json.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(value)) => Some(value.clone()),
            Some(other) => Some(other.to_string()),
        };
        let command = string_field(COMMAND);
        let authorization = string_field(AUTHORIZATION);

        Ok(DefaultRequest {
            request,
            text,
            json,
            command,
            authorization,
            received_at: Local::now(),
        })
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    pub fn json(&self) -> &Map<String, Value> {
        &self.json
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn request(&self) -> &Request<String> {
        &self.request
    }

    pub fn index(&self) -> u32 {
        self.request.index()
    }

    pub fn ip(&self) -> &str {
        self.request.ip()
    }
}

/// A refined request, one variant per payload kind.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Binary(DataRequest),
    Text(TextRequest),
    Json(DefaultRequest),
}

impl RequestKind {
    pub fn index(&self) -> u32 {
        match self {
            RequestKind::Binary(request) => request.index(),
            RequestKind::Text(request) => request.index(),
            RequestKind::Json(request) => request.index(),
        }
    }
}
