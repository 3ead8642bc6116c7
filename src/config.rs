use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::DispatchMode;
use crate::nanonis::ConnectionConfig;
use crate::nanonis::protocol::MAX_RESPONSE_SIZE;
use crate::registry::CommandSources;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub nanonis: NanonisConfig,
    pub connection: TimeoutConfig,
    pub commands: CommandsConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NanonisConfig {
    pub host: String,
    pub port: u16,
}

/// Socket timeouts in milliseconds
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommandsConfig {
    pub builtin: PathBuf,
    pub special: PathBuf,
    /// Directory of external interface definitions; empty disables them
    pub external_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub max_response_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    /// JSONL file receiving script events
    pub event_log: Option<PathBuf>,
}

impl Default for NanonisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6501,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            read_timeout_ms: defaults.read_timeout.as_millis() as u64,
            write_timeout_ms: defaults.write_timeout.as_millis() as u64,
        }
    }
}

impl From<&TimeoutConfig> for ConnectionConfig {
    fn from(timeouts: &TimeoutConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(timeouts.connect_timeout_ms),
            read_timeout: Duration::from_millis(timeouts.read_timeout_ms),
            write_timeout: Duration::from_millis(timeouts.write_timeout_ms),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        let sources = CommandSources::default();
        Self {
            builtin: sources.builtin,
            special: sources.special,
            external_dir: sources.external_dir,
        }
    }
}

impl From<&CommandsConfig> for CommandSources {
    fn from(commands: &CommandsConfig) -> Self {
        Self {
            builtin: commands.builtin.clone(),
            special: commands.special.clone(),
            external_dir: commands
                .external_dir
                .clone()
                .filter(|dir| !dir.as_os_str().is_empty()),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Lenient,
            max_response_bytes: MAX_RESPONSE_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            event_log: None,
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else if Path::new("aunis.toml").exists() {
        builder = builder.add_source(File::with_name("aunis.toml"));
    }

    // Environment overrides, e.g. AUNIS__NANONIS__PORT=6502
    builder = builder.add_source(
        Environment::with_prefix("AUNIS")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("aunis-config-{}-{name}.toml", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.nanonis.port, 6501);
        assert_eq!(config.dispatch.mode, DispatchMode::Lenient);
        assert_eq!(config.connection.read_timeout_ms, 10_000);
        assert_eq!(
            ConnectionConfig::from(&config.connection).connect_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = write_temp(
            "override",
            r#"
[nanonis]
host = "192.168.1.20"

[dispatch]
mode = "strict"

[logging]
event_log = "logs/session.jsonl"
"#,
        );

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.nanonis.host, "192.168.1.20");
        assert_eq!(config.nanonis.port, 6501);
        assert_eq!(config.dispatch.mode, DispatchMode::Strict);
        assert_eq!(config.dispatch.max_response_bytes, MAX_RESPONSE_SIZE);
        assert_eq!(
            config.logging.event_log,
            Some(PathBuf::from("logs/session.jsonl"))
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_error_and_falls_back() {
        let path = Path::new("/nonexistent/aunis.toml");
        assert!(load_config(Some(path)).is_err());
        assert_eq!(load_config_or_default(Some(path)).nanonis.host, "127.0.0.1");
    }

    #[test]
    fn test_empty_external_dir_disables_externals() {
        let commands = CommandsConfig {
            external_dir: Some(PathBuf::new()),
            ..CommandsConfig::default()
        };
        assert!(CommandSources::from(&commands).external_dir.is_none());
    }
}
