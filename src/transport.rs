//! The seam between the device logic and whatever carries its messages.
//!
//! The producer loop only sends events; the command dispatcher only
//! completes what the transport delivered on its inbound channel.

use std::future::Future;

use crate::error::TransportError;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const UTF8_ENCODING: &str = "utf-8";

/// A device-to-cloud message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
}

impl OutboundMessage {
    pub fn json(body: Vec<u8>) -> Self {
        OutboundMessage {
            body,
            content_type: JSON_CONTENT_TYPE.to_string(),
            content_encoding: UTF8_ENCODING.to_string(),
        }
    }
}

/// A cloud-to-device message. `packet_id` is set when the delivery has to be
/// completed before the service stops redelivering it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub packet_id: Option<u16>,
}

pub trait Transport: Send + Sync {
    /// Resolves once the service has accepted the message.
    fn send_event(
        &self,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Acknowledges an inbound message so it is not redelivered.
    fn complete(
        &self,
        message: &InboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
