use std::str::FromStr;

use tracing::event;
use tracing::Level;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 1883;

/// `HostName=broker.local;DeviceId=sensor-1;Port=1883;Username=..;Password=..`
///
/// Keys are matched case-insensitively, unknown keys are ignored and values
/// may themselves contain `=`. A `SharedAccessKey` is kept but never turned
/// into a signature; pass a precomputed `SharedAccessSignature` instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub port: u16,
    pub device_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub shared_access_key: Option<String>,
}

impl ConnectionString {
    /// A hub key was given but nothing the broker can authenticate with.
    pub fn lacks_signature(&self) -> bool {
        self.shared_access_key.is_some() && self.password.is_none()
    }
}

impl FromStr for ConnectionString {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut port = DEFAULT_PORT;
        let mut device_id = None;
        let mut username = None;
        let mut password = None;
        let mut shared_access_key = None;

        for segment in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedSegment(segment.to_string()))?;
            let value = value.trim().to_string();

            match key.trim().to_ascii_lowercase().as_str() {
                "hostname" => host_name = Some(value),
                "deviceid" => device_id = Some(value),
                "port" => {
                    port = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidPort(value.clone()))?
                }
                "username" => username = Some(value),
                "password" | "sharedaccesssignature" => password = Some(value),
                "sharedaccesskey" => shared_access_key = Some(value),
                _ => {}
            }
        }

        let connection = ConnectionString {
            host_name: host_name
                .filter(|h| !h.is_empty())
                .ok_or(ConfigError::MissingField("HostName"))?,
            port,
            device_id: device_id
                .filter(|d| !d.is_empty())
                .ok_or(ConfigError::MissingField("DeviceId"))?,
            username,
            password,
            shared_access_key,
        };

        if connection.lacks_signature() {
            event!(
                Level::WARN,
                device_id = %connection.device_id,
                "SharedAccessKey is not used to sign in; add SharedAccessSignature or Password, or the broker will likely refuse the connection"
            );
        }

        Ok(connection)
    }
}
