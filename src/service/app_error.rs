// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// protocol errors
    #[error("no match type={0}")]
    FrameDecode(i32),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// routing errors
    #[error("\"{0}\" not found")]
    CommandNotFound(String),

    #[error("command \"{0}\" already registered")]
    DuplicateCommand(String),
}

impl AppError {
    /// Not-found error for a command that may be absent from the request.
    pub fn command_not_found(command: Option<&str>) -> Self {
        AppError::CommandNotFound(command.unwrap_or("null").to_string())
    }
}
