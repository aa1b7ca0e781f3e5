use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::client::DEFAULT_KEEP_ALIVE;
use crate::connection_string::ConnectionString;
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(
    name = "tempdevice",
    about = "Simulated temperature sensor that publishes telemetry and honours remote pause commands"
)]
pub struct Cli {
    /// Path to the JSON settings file. Missing file is not an error.
    #[arg(long, default_value = "appsettings.json", env = "DEVICE_SETTINGS")]
    pub settings: PathBuf,

    /// Device connection string; overrides the settings file.
    #[arg(long, env = "IOTHUB_DEVICE_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: Option<String>,

    /// MQTT keep-alive in seconds.
    #[arg(long)]
    pub keep_alive: Option<u16>,
}

// ---- JSON settings ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Settings {
    pub azure_iot_hub_connection_string: Option<String>,
    pub keep_alive_secs: Option<u16>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => {
                return Err(ConfigError::File {
                    context: "read",
                    detail: format!("'{}': {e}", path.display()),
                })
            }
        };
        Self::parse(&content).map_err(|e| match e {
            ConfigError::File { context, detail } => ConfigError::File {
                context,
                detail: format!("'{}': {detail}", path.display()),
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::File {
            context: "parse",
            detail: e.to_string(),
        })
    }
}

/// Everything the device needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub connection: ConnectionString,
    pub keep_alive: u16,
}

impl DeviceConfig {
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let settings = Settings::load(&cli.settings)?;
        Self::from_parts(cli.connection_string.as_deref(), cli.keep_alive, settings)
    }

    /// Command line values win over the settings file.
    pub fn from_parts(
        connection_string: Option<&str>,
        keep_alive: Option<u16>,
        settings: Settings,
    ) -> Result<Self, ConfigError> {
        let connection = connection_string
            .map(str::to_string)
            .or(settings.azure_iot_hub_connection_string)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingConnectionString)?
            .parse()?;

        Ok(DeviceConfig {
            connection,
            keep_alive: keep_alive
                .or(settings.keep_alive_secs)
                .unwrap_or(DEFAULT_KEEP_ALIVE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_use_pascal_case_keys() {
        let settings = Settings::parse(
            r#"{"AzureIotHubConnectionString":"HostName=h;DeviceId=d","KeepAliveSecs":30,"Logging":{}}"#,
        )
        .unwrap();
        assert_eq!(
            settings.azure_iot_hub_connection_string.as_deref(),
            Some("HostName=h;DeviceId=d")
        );
        assert_eq!(settings.keep_alive_secs, Some(30));
    }

    #[test]
    fn test_cli_overrides_settings() {
        let settings = Settings {
            azure_iot_hub_connection_string: Some("HostName=file;DeviceId=d".to_string()),
            keep_alive_secs: Some(30),
        };
        let config =
            DeviceConfig::from_parts(Some("HostName=cli;DeviceId=d"), Some(90), settings).unwrap();
        assert_eq!(config.connection.host_name, "cli");
        assert_eq!(config.keep_alive, 90);
    }

    #[test]
    fn test_settings_fill_in_missing_cli_values() {
        let settings = Settings {
            azure_iot_hub_connection_string: Some("HostName=file;DeviceId=d".to_string()),
            keep_alive_secs: None,
        };
        let config = DeviceConfig::from_parts(None, None, settings).unwrap();
        assert_eq!(config.connection.host_name, "file");
        assert_eq!(config.keep_alive, DEFAULT_KEEP_ALIVE);
    }

    #[test]
    fn test_missing_connection_string() {
        assert!(matches!(
            DeviceConfig::from_parts(None, None, Settings::default()),
            Err(ConfigError::MissingConnectionString)
        ));
        assert!(matches!(
            DeviceConfig::from_parts(Some("  "), None, Settings::default()),
            Err(ConfigError::MissingConnectionString)
        ));
    }

    #[test]
    fn test_missing_settings_file_is_default() {
        let settings = Settings::load(Path::new("/nonexistent/appsettings.json")).unwrap();
        assert!(settings.azure_iot_hub_connection_string.is_none());
    }

    #[test]
    fn test_bad_settings_file_is_an_error() {
        assert!(matches!(
            Settings::parse("{not json"),
            Err(ConfigError::File {
                context: "parse",
                ..
            })
        ));
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "tempdevice",
            "--settings",
            "dev.json",
            "--connection-string",
            "HostName=h;DeviceId=d",
            "--keep-alive",
            "15",
        ])
        .unwrap();
        assert_eq!(cli.settings, PathBuf::from("dev.json"));
        assert_eq!(cli.connection_string.as_deref(), Some("HostName=h;DeviceId=d"));
        assert_eq!(cli.keep_alive, Some(15));
    }
}
