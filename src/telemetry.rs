//! Periodic temperature telemetry.

use crate::device::Device;
use crate::error::Result;
use crate::session::ConnectionState;
use crate::transport::Message;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

pub const TEMPERATURE_MIN: i32 = 20;
pub const TEMPERATURE_MAX: i32 = 90;

/// A single telemetry reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub temperature: i32,
}

impl TelemetryMessage {
    /// Random reading in `[TEMPERATURE_MIN, TEMPERATURE_MAX]`.
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            temperature: rng.random_range(TEMPERATURE_MIN..=TEMPERATURE_MAX),
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::json(serde_json::to_vec(self)?))
    }
}

/// Sends a reading every `period` while the device is connected.
///
/// Ticks are skipped while the device is reconnecting. The loop ends when the
/// session is no longer connected or when `cancel` fires; cancellation is only
/// observed between sends.
pub async fn run_telemetry(
    device: Device,
    period: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "Sending sample temperature telemetry every {}s",
        period.as_secs()
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match device.connection_state() {
            ConnectionState::Connecting => {
                debug!("Device is reconnecting, skipping telemetry tick");
            }
            ConnectionState::Connected => {
                if let Some(session) = device.session() {
                    let reading = TelemetryMessage::sample(&mut rand::rng());
                    match reading.to_message() {
                        Ok(message) => {
                            debug!("Sending temperature {}", reading.temperature);
                            match session.send_message(message).await {
                                Ok(()) => info!("Sent message"),
                                Err(e) => warn!("Telemetry send failed: {}", e),
                            }
                        }
                        Err(e) => warn!("Could not encode telemetry: {}", e),
                    }
                }
            }
            state => {
                info!("Session is {:?}, stopping telemetry", state);
                break;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(period) => {}
        }
    }

    debug!("Telemetry loop exited");
    Ok(())
}
