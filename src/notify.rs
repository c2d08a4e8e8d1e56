//! Detection notifications
//!
//! Watches the bus for detection signals that switch appliances on and hands
//! a [`Notification`] to the configured dispatcher. Delivery is
//! fire-and-forget: a failed dispatch is logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{HubEvent, SharedBus};

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub user_id: String,
    pub subject: String,
    pub body: String,
    pub detected_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Default dispatcher: writes the alert to the log
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()> {
        tracing::info!(
            "Alert for user {}: {} ({})",
            notification.user_id,
            notification.subject,
            notification.detected_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }
}

/// Build the alert for a detection event, if it warrants one
fn notification_for(event: &HubEvent) -> Option<Notification> {
    let HubEvent::DetectionSignal {
        user_id,
        room_id,
        state: true,
        affected,
    } = event
    else {
        return None;
    };

    let (subject, body) = match room_id {
        Some(room_id) => (
            "Motion detected".to_string(),
            format!(
                "Motion was detected in room {}. {} unlocked appliance(s) switched on.",
                room_id, affected
            ),
        ),
        None => (
            "Human detected at home".to_string(),
            format!(
                "A human was detected at home. {} unlocked appliance(s) switched on.",
                affected
            ),
        ),
    };
    Some(Notification {
        user_id: user_id.clone(),
        subject,
        body,
        detected_at: Utc::now(),
    })
}

/// Spawn the notifier loop; it exits when `shutdown` is cancelled
pub fn spawn_notifier(
    bus: SharedBus,
    dispatcher: Arc<dyn NotificationDispatcher>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Notifier shutting down");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(notification) = notification_for(&event) else {
                                continue;
                            };
                            let user_id = notification.user_id.clone();
                            if let Err(e) = dispatcher.dispatch(notification).await {
                                tracing::warn!("Notification for user {} failed: {}", user_id, e);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Notifier lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelDispatcher(mpsc::Sender<Notification>);

    #[async_trait]
    impl NotificationDispatcher for ChannelDispatcher {
        async fn dispatch(&self, notification: Notification) -> anyhow::Result<()> {
            self.0.send(notification).await?;
            Ok(())
        }
    }

    #[test]
    fn only_positive_detections_notify() {
        let off = HubEvent::DetectionSignal {
            user_id: "u1".to_string(),
            room_id: None,
            state: false,
            affected: 2,
        };
        assert!(notification_for(&off).is_none());

        let on = HubEvent::DetectionSignal {
            user_id: "u1".to_string(),
            room_id: Some("kitchen".to_string()),
            state: true,
            affected: 2,
        };
        let n = notification_for(&on).unwrap();
        assert_eq!(n.subject, "Motion detected");
        assert!(n.body.contains("kitchen"));
    }

    #[tokio::test]
    async fn notifier_dispatches_and_stops() {
        let bus = create_bus();
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let handle = spawn_notifier(bus.clone(), Arc::new(ChannelDispatcher(tx)), shutdown.clone());

        bus.publish(HubEvent::DetectionSignal {
            user_id: "u1".to_string(),
            room_id: None,
            state: true,
            affected: 1,
        });

        let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.user_id, "u1");
        assert_eq!(n.subject, "Human detected at home");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
