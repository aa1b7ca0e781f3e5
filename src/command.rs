//! Cloud-to-device control messages.
//!
//! Messages are handled one at a time in delivery order. Every message is
//! completed, whatever its content, so the service never redelivers it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::event;
use tracing::Level;

use crate::error::DecodeError;
use crate::pause::PauseState;
use crate::transport::{InboundMessage, Transport};

pub const PAUSE_COMMAND: &str = "pause";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    #[serde(alias = "Command")]
    pub command: String,
    /// Milliseconds.
    #[serde(alias = "Duration")]
    pub duration: i64,
}

impl ControlCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// What a single message did to the pause state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Paused { duration_ms: i64 },
    Ignored { command: String },
    Invalid,
}

pub async fn handle_message<T: Transport>(
    transport: &T,
    pause: &PauseState,
    message: &InboundMessage,
) -> CommandOutcome {
    event!(
        Level::INFO,
        topic = %message.topic,
        "Received message: {}",
        String::from_utf8_lossy(&message.body)
    );

    let outcome = match ControlCommand::parse(&message.body) {
        Ok(command) if command.command == PAUSE_COMMAND => {
            pause.request(command.duration);
            event!(
                Level::INFO,
                "Received pause command with duration: {} seconds.",
                command.duration / 1000
            );
            CommandOutcome::Paused {
                duration_ms: command.duration,
            }
        }
        Ok(command) => {
            event!(Level::DEBUG, command = %command.command, "Ignoring unknown command");
            CommandOutcome::Ignored {
                command: command.command,
            }
        }
        Err(e) => {
            event!(Level::WARN, "Invalid message format: {}", e);
            CommandOutcome::Invalid
        }
    };

    if let Err(e) = transport.complete(message).await {
        event!(Level::ERROR, "Failed to complete message: {}", e);
    }

    outcome
}

/// Drains the transport's inbound channel until it closes or `cancel` fires.
pub async fn dispatch<T: Transport>(
    transport: T,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    pause: Arc<PauseState>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => {
                    event!(Level::DEBUG, "Inbound channel closed");
                    break;
                }
            },
        };

        handle_message(&transport, &pause, &message).await;
    }
}

/// Waits for a spawned [`dispatch`] task. Returns `false`, after logging it,
/// if the task panicked or was aborted.
pub async fn join(dispatcher: task::JoinHandle<()>) -> bool {
    match dispatcher.await {
        Ok(()) => true,
        Err(e) => {
            event!(Level::ERROR, "Command dispatcher failed: {}", e);
            false
        }
    }
}
