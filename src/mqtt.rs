//! MQTT command mirror
//!
//! Mirrors appliance commands and detection signals from the event bus to an
//! MQTT broker for home-automation integrations. Relay ids are capabilities
//! and are never published; consumers see user, room and appliance ids only.

use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::bus::{HubEvent, SharedBus};
use crate::config::MqttConfig;

pub struct MqttBridge {
    config: MqttConfig,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl MqttBridge {
    pub fn new(config: MqttConfig, bus: SharedBus) -> Self {
        Self {
            config,
            bus,
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect and start forwarding bus events
    pub async fn start(&self) -> Result<()> {
        let mut options = MqttOptions::new("luminous-hub", &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        tracing::info!(
            "MQTT connecting to {}:{}...",
            self.config.host,
            self.config.port
        );

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("MQTT event loop shutting down");
                        break;
                    }
                    result = eventloop.poll() => {
                        match result {
                            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                                tracing::info!("MQTT connected (code: {:?})", ack.code);
                            }
                            Ok(Event::Incoming(Incoming::Disconnect)) => {
                                tracing::warn!("MQTT disconnected");
                            }
                            Err(e) => {
                                tracing::error!("MQTT error: {}", e);
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        let mut rx = self.bus.subscribe();
        let prefix = self.config.topic_prefix.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("MQTT bus forwarder shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(event) => {
                                let Some((topic, payload)) = topic_and_payload(&prefix, &event) else {
                                    continue;
                                };
                                if let Err(e) = client
                                    .publish(&topic, QoS::AtLeastOnce, false, payload.to_string())
                                    .await
                                {
                                    tracing::warn!("MQTT publish to {} failed: {}", topic, e);
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                tracing::warn!("MQTT forwarder lagged, {} events skipped", skipped);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Topic and JSON payload for events that are mirrored
fn topic_and_payload(prefix: &str, event: &HubEvent) -> Option<(String, Value)> {
    match event {
        HubEvent::ApplianceStateChanged {
            user_id,
            room_id,
            appliance_id,
            state,
        } => Some((
            format!("{}/commands", prefix),
            json!({
                "user_id": user_id,
                "room_id": room_id,
                "appliance_id": appliance_id,
                "state": u8::from(*state),
            }),
        )),
        HubEvent::DetectionSignal {
            user_id,
            room_id,
            state,
            affected,
        } => Some((
            format!("{}/detections", prefix),
            json!({
                "user_id": user_id,
                "room_id": room_id.as_deref().unwrap_or("all"),
                "state": u8::from(*state),
                "affected": affected,
            }),
        )),
        _ => None,
    }
}
