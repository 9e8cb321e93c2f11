use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::network::Sendable;
use crate::AppResult;

pub const BAD_REQUEST: i32 = 400;
pub const UNAUTHORIZED: i32 = 401;
pub const NOT_FOUND: i32 = 404;
pub const INTERNAL_ERROR: i32 = 500;

/// Answers one request on the connection it came from.
///
/// Every call only queues the message; a failure to queue (the connection is
/// already closing) is logged and dropped.
#[derive(Clone)]
pub struct Response {
    index: u32,
    sender: Arc<dyn Sendable<String>>,
}

impl Response {
    pub fn new(sender: Arc<dyn Sendable<String>>) -> Self {
        Response {
            index: sender.index(),
            sender,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn send(&self, message: impl Into<String>) {
        self.dispatch(message.into(), false);
    }

    pub fn send_close(&self, message: impl Into<String>) {
        self.dispatch(message.into(), true);
    }

    /// Serializes `value` and sends it.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) {
        if let Some(text) = self.serialize(value) {
            self.dispatch(text, false);
        }
    }

    pub fn send_close_json<T: Serialize + ?Sized>(&self, value: &T) {
        if let Some(text) = self.serialize(value) {
            self.dispatch(text, true);
        }
    }

    /// Sends `{"code":..,"message":..}`. `context` (usually the request
    /// text) only goes to the log.
    pub fn send_error(&self, context: &str, code: i32, message: Option<&str>) {
        let body = error_body(code, message);
        warn!("connection {} request[{context}] response[{body}]", self.index);
        self.dispatch(body, false);
    }

    pub fn send_error_close(&self, context: &str, code: i32, message: Option<&str>) {
        let body = error_body(code, message);
        warn!("connection {} request[{context}] response[{body}]", self.index);
        self.dispatch(body, true);
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("connection {} response not serializable: {e}", self.index);
                None
            }
        }
    }

    fn dispatch(&self, message: String, close: bool) {
        debug!("connection {} response[{message}] close={close}", self.index);
        let result: AppResult<()> = if close {
            self.sender.send_close(message)
        } else {
            self.sender.send(message)
        };
        if let Err(e) = result {
            warn!("connection {} response dropped: {e}", self.index);
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").field("index", &self.index).finish()
    }
}

/// `{"code":..,"message":..}`, with a null message when there is none.
pub fn error_body(code: i32, message: Option<&str>) -> String {
    json!({ "code": code, "message": message }).to_string()
}
