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

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{AppError, AppResult};

pub const AUTHORIZATION_F5: &str = "F5";
pub const AUTHORIZATION_MONITOR: &str = "Monitor";

/// Heartbeat, answered with a pong. Only `AUTHORIZATION_F5` passes.
pub const HEARTBEAT: &str = "/v1/server/ping";
/// Server status. Only `AUTHORIZATION_MONITOR` passes.
pub const MONITOR: &str = "/v1/server/monitor";

/// On-disk authorization document.
///
/// ```json
/// {
///   "accessTokens": [{"accessToken": "aabbcc", "department": "ops"}],
///   "commandsAuthorization": [{"command": "/v1/server/echo", "department": ["ops"]}]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsDefinition {
    #[serde(default)]
    pub access_tokens: Vec<AccessToken>,
    #[serde(default)]
    pub commands_authorization: Vec<CommandAuthorization>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub access_token: String,
    pub department: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandAuthorization {
    pub command: String,
    pub department: Vec<String>,
}

#[derive(Debug, Default)]
struct AuthTables {
    /// token -> department
    tokens: HashMap<String, String>,
    /// command -> departments allowed to call it
    commands: HashMap<String, HashSet<String>>,
}

/// Command and access token tables.
///
/// Lookups clone the current snapshot and never block on a reload;
/// `load_commands` and `clear` swap the whole snapshot at once.
#[derive(Debug, Default)]
pub struct CommandsVerification {
    tables: RwLock<Arc<AuthTables>>,
}

impl CommandsVerification {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<AuthTables> {
        self.tables.read().clone()
    }

    /// Replaces both tables with the content of the JSON document at `path`.
    pub fn load_commands(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::DetailedIoError(format!("read commands file {}: {e}", path.display()))
        })?;
        let definition: CommandsDefinition = serde_json::from_str(&text)?;
        self.load_definition(definition);
        info!(
            "loaded {} commands and {} access tokens from {}",
            self.count_commands(),
            self.count_tokens(),
            path.display()
        );
        Ok(())
    }

    pub fn load_definition(&self, definition: CommandsDefinition) {
        let tokens = definition
            .access_tokens
            .into_iter()
            .map(|t| (t.access_token, t.department))
            .collect();
        let commands = definition
            .commands_authorization
            .into_iter()
            .map(|c| (c.command, c.department.into_iter().collect()))
            .collect();
        *self.tables.write() = Arc::new(AuthTables { tokens, commands });
    }

    pub fn clear(&self) {
        *self.tables.write() = Arc::new(AuthTables::default());
        debug!("authorization tables cleared");
    }

    pub fn count_commands(&self) -> usize {
        self.snapshot().commands.len()
    }

    pub fn count_tokens(&self) -> usize {
        self.snapshot().tokens.len()
    }

    /// command -> allowed departments
    pub fn commands(&self) -> HashMap<String, Vec<String>> {
        self.snapshot()
            .commands
            .iter()
            .map(|(command, departments)| {
                let mut departments: Vec<String> = departments.iter().cloned().collect();
                departments.sort();
                (command.clone(), departments)
            })
            .collect()
    }

    /// token -> department
    pub fn access_tokens(&self) -> HashMap<String, String> {
        self.snapshot().tokens.clone()
    }

    /// Whether `token` may call `command`.
    ///
    /// An absent or unknown command is `CommandNotFound`, whatever the token.
    /// A known command with an absent or foreign token is `Ok(false)`.
    pub fn is_valid_auth(&self, command: Option<&str>, token: Option<&str>) -> AppResult<bool> {
        let Some(command) = command else {
            return Err(AppError::command_not_found(None));
        };
        let tables = self.snapshot();
        let reserved_token = match command {
            HEARTBEAT => Some(AUTHORIZATION_F5),
            MONITOR => Some(AUTHORIZATION_MONITOR),
            _ => None,
        };
        let departments = tables.commands.get(command);
        if reserved_token.is_none() && departments.is_none() {
            return Err(AppError::command_not_found(Some(command)));
        }

        let Some(token) = token else {
            return Ok(false);
        };
        if reserved_token == Some(token) {
            return Ok(true);
        }
        Ok(match (departments, tables.tokens.get(token)) {
            (Some(departments), Some(department)) => departments.contains(department),
            _ => false,
        })
    }
}
