use std::time::Duration;

use chrono::{Local, Utc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::event;
use tracing::Level;

use crate::error::DeviceError;
use crate::pause::PauseState;
use crate::telemetry::{TelemetrySample, TriangleWave};
use crate::transport::{OutboundMessage, Transport};

pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(1000);

/// Publishes one sample per cycle until `cancel` fires or a publish fails.
///
/// The pause state is checked once per cycle, before the sample is built, so
/// a pause requested after that point applies to the following cycle.
/// Returns the number of samples published.
pub async fn run<T: Transport>(
    transport: &T,
    pause: &PauseState,
    cancel: &CancellationToken,
) -> Result<u64, DeviceError> {
    let mut wave = TriangleWave::new();
    let mut published = 0u64;

    loop {
        if let Some(duration) = pause.pending() {
            event!(
                Level::INFO,
                "Pausing telemetry for {} seconds...",
                duration.as_secs()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(published),
                _ = time::sleep(duration) => {}
            }
            pause.clear();
            event!(Level::INFO, "Resuming telemetry...");
        }

        let sample = TelemetrySample::new(wave.current(), Utc::now());
        let body = sample.to_json()?;

        transport.send_event(OutboundMessage::json(body)).await?;
        published += 1;

        event!(
            Level::INFO,
            "Temperature: {}°C, Sent at: {}",
            sample.temperature,
            sample.timestamp.with_timezone(&Local).format("%-I:%M:%S %p")
        );

        wave.advance();

        tokio::select! {
            _ = cancel.cancelled() => return Ok(published),
            _ = time::sleep(PUBLISH_INTERVAL) => {}
        }
    }
}
