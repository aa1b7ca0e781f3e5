use std::io;

use thiserror::Error;

use crate::packet::ConnackReturnCode;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Broker closed the connection")]
    ConnectionClosed,
    #[error("Broker refused the connection: {0:?}")]
    ConnectionRefused(ConnackReturnCode),
    #[error("Received packet exceeds maximum size")]
    PacketTooLarge,
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Failures surfaced through the [`Transport`](crate::transport::Transport) seam.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport event loop has stopped")]
    Closed,
    #[error("connection lost before the broker acknowledged the message")]
    ConnectionLost,
    #[error(transparent)]
    Mqtt(#[from] MqttError),
}

/// An inbound control message that could not be understood.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid message format: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config ({context}): {detail}")]
    File {
        context: &'static str,
        detail: String,
    },
    #[error("no connection string configured (set AzureIotHubConnectionString or --connection-string)")]
    MissingConnectionString,
    #[error("connection string is missing `{0}`")]
    MissingField(&'static str),
    #[error("malformed connection string segment `{0}`")]
    MalformedSegment(String),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect: {0}")]
    Connect(#[from] MqttError),
    #[error("failed to publish telemetry: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to serialize telemetry: {0}")]
    Serialize(#[from] serde_json::Error),
}
