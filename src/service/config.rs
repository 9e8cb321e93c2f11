use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Which transport variant the server runs and how text lines are refined.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// line transport, every line parsed as a JSON command
    #[default]
    Json,
    /// line transport, raw UTF-8 lines
    Text,
    /// binary package transport
    Data,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub name: String,
    pub alias: String,
    pub version: String,
    /// text answered to a heartbeat without `serverInfo`
    pub heartbeat: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            name: env!("CARGO_PKG_NAME").to_string(),
            alias: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat: r#"{"data":"pong"}"#.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub mode: ServiceMode,
    /// idle read timeout, 0 disables it
    pub socket_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_line_length: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 20000,
            max_connection: 200,
            mode: ServiceMode::Json,
            socket_timeout_ms: 20_000,
            write_timeout_ms: 10_000,
            max_line_length: 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout_ms > 0).then(|| Duration::from_millis(self.socket_timeout_ms))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// authorization definition document, see `CommandsVerification::load_commands`
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub commands: CommandsConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let file = write_config(
            r#"
            [network]
            port = 3456
            mode = "data"
            "#,
        );
        let config = ServerConfig::set_up_config(file.path()).unwrap();

        assert_eq!(config.network.port, 3456);
        assert_eq!(config.network.mode, ServiceMode::Data);
        assert_eq!(config.network.max_connection, 200);
        assert_eq!(
            config.network.socket_timeout(),
            Some(Duration::from_secs(20))
        );
        assert!(config.commands.path.is_none());
    }

    #[test]
    fn test_zero_socket_timeout_disables_it() {
        let file = write_config(
            r#"
            [network]
            socket_timeout_ms = 0
            "#,
        );
        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.socket_timeout(), None);
    }

    #[test]
    fn test_zero_connection_limit_is_rejected() {
        let file = write_config(
            r#"
            [network]
            max_connection = 0
            "#,
        );
        let err = ServerConfig::set_up_config(file.path()).unwrap_err();
        assert!(matches!(err, AppError::InvalidValue(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ServerConfig::set_up_config("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, AppError::ConfigFileError(_)));
    }
}
