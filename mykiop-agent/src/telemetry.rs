//! Display and telemetry fan-out
//!
//! After every confirmed change to the remote aggregate the new totals are
//! pushed to MQTT: one topic per counter for dashboards and a `display`
//! topic the LCD driver renders. Failures are logged and never reach the
//! counting logic.

use crate::remote::RemoteAggregate;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, QoS};
use serde::Serialize;
use tracing::{debug, warn};

/// Width of the 16x2 character display
pub const DISPLAY_COLUMNS: usize = 16;

/// Receiver of committed totals
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish(&self, totals: &RemoteAggregate);
}

/// Two display lines for the character LCD
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayFrame {
    pub line1: String,
    pub line2: String,
}

impl DisplayFrame {
    pub fn for_totals(enter_count: u64, offender_count: u64) -> Self {
        Self {
            line1: fit_line(&format!("Entered: {}", enter_count)),
            line2: fit_line(&format!("Offenders: {}", offender_count)),
        }
    }
}

fn fit_line(text: &str) -> String {
    let mut line: String = text.chars().take(DISPLAY_COLUMNS).collect();
    let width = line.chars().count();
    line.extend(std::iter::repeat(' ').take(DISPLAY_COLUMNS - width));
    line
}

/// Publishes totals under `{prefix}/{device_id}/...`
#[derive(Clone)]
pub struct MqttTelemetry {
    client: AsyncClient,
    prefix: String,
    device_id: String,
}

impl MqttTelemetry {
    pub fn new(client: AsyncClient, prefix: &str, device_id: &str) -> Self {
        Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
        }
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.device_id, leaf)
    }

    /// Queue one message without waiting on the client's request channel;
    /// while the broker is away the channel fills up and frames are dropped.
    fn send(&self, leaf: &str, payload: String) {
        let topic = self.topic(leaf);
        match self.client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => {}
            Err(ClientError::TryRequest(_)) => {
                debug!("MQTT request queue full, dropping {}", topic);
            }
            Err(e) => warn!("Failed to publish {}: {}", topic, e),
        }
    }
}

#[async_trait]
impl TelemetrySink for MqttTelemetry {
    async fn publish(&self, totals: &RemoteAggregate) {
        self.send("enter_count", totals.enter_count.to_string());
        self.send("offenders", totals.offender_count.to_string());
        self.send("myki_taps", totals.myki_taps.to_string());

        let frame = DisplayFrame::for_totals(totals.enter_count, totals.offender_count);
        match serde_json::to_string(&frame) {
            Ok(payload) => self.send("display", payload),
            Err(e) => warn!("Failed to serialize display frame: {}", e),
        }

        debug!(
            "Telemetry published - Entered: {}, Offenders: {}",
            totals.enter_count, totals.offender_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lines_are_padded_to_lcd_width() {
        let frame = DisplayFrame::for_totals(15, 3);
        assert_eq!(frame.line1, "Entered: 15     ");
        assert_eq!(frame.line2, "Offenders: 3    ");
    }

    #[test]
    fn display_lines_are_truncated_to_lcd_width() {
        let frame = DisplayFrame::for_totals(1, 123_456_789);
        assert_eq!(frame.line2.chars().count(), DISPLAY_COLUMNS);
        assert_eq!(frame.line2, "Offenders: 12345");
    }

    #[test]
    fn topics_are_scoped_by_device() {
        let options = rumqttc::MqttOptions::new("test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 10);
        let telemetry = MqttTelemetry::new(client, "bus_data/", "630");
        assert_eq!(telemetry.topic("enter_count"), "bus_data/630/enter_count");
    }

    #[tokio::test]
    async fn publish_does_not_wait_for_the_broker() {
        let options = rumqttc::MqttOptions::new("test", "127.0.0.1", 1);
        // Event loop kept alive but never polled: the request channel fills
        let (client, _eventloop) = AsyncClient::new(options, 10);
        let telemetry = MqttTelemetry::new(client, "bus_data", "630");
        let totals = RemoteAggregate {
            enter_count: 5,
            myki_taps: 4,
            offender_count: 1,
            last_updated: None,
        };

        for _ in 0..5 {
            tokio::time::timeout(std::time::Duration::from_secs(3), telemetry.publish(&totals))
                .await
                .expect("publish blocked on a full request channel");
        }
    }
}
