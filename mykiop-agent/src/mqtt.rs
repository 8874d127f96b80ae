//! MQTT connection shared by sensor ingress and telemetry
//!
//! The BLE bridge publishes raw door controller notifications on the sensor
//! topic. The event loop task parses them and forwards valid events to the
//! coordinator; anything else is logged and dropped.

use crate::config::AgentConfig;
use crate::coordinator::Command;
use crate::error::SensorError;
use crate::sensor::SensorEvent;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Build the client and its event loop from config
pub fn connect(config: &AgentConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        config.client_id(),
        &config.mqtt.broker_host,
        config.mqtt.broker_port,
    );
    options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs));
    options.set_clean_session(true);

    AsyncClient::new(options, 10)
}

/// Decode a publish if it belongs to the sensor topic
pub fn decode_sensor_publish(
    topic: &str,
    payload: &[u8],
    sensor_topic: &str,
) -> Option<Result<SensorEvent, SensorError>> {
    if topic != sensor_topic {
        return None;
    }
    Some(SensorEvent::from_bytes(payload))
}

/// Drive the MQTT event loop, (re)subscribing on every connection and
/// forwarding sensor events to the coordinator.
pub fn spawn_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    sensor_topic: String,
    commands: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("MQTT connected, subscribing to {}", sensor_topic);
                    if let Err(e) = client.try_subscribe(&sensor_topic, QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", sensor_topic, e);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    match decode_sensor_publish(&publish.topic, &publish.payload, &sensor_topic) {
                        Some(Ok(event)) => {
                            debug!("Notification received: {:?}", event);
                            if commands.send(Command::Sensor(event)).await.is_err() {
                                info!("Coordinator gone, stopping MQTT loop");
                                break;
                            }
                        }
                        Some(Err(e)) => warn!("Ignoring sensor notification: {}", e),
                        None => debug!("Ignoring message on {}", publish.topic),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    })
}
