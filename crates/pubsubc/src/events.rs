use pubsub_common::{EventPayload, InboundEvent};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Logs every event received on `events_rx` until the sender side is gone.
pub async fn log_events(mut events_rx: broadcast::Receiver<InboundEvent>) {
    loop {
        match events_rx.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event logger lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("event channel closed");
                break;
            }
        }
    }
}

fn log_event(event: &InboundEvent) {
    match &event.payload {
        EventPayload::RewardRedeemed(redeemed) => {
            let redemption = &redeemed.redemption;
            info!(
                topic = %event.topic,
                user = %redemption.user.login,
                reward = %redemption.reward.title,
                cost = redemption.reward.cost,
                redeemed_at = %redemption.redeemed_at,
                input = redemption.user_input.as_deref().unwrap_or(""),
                "reward redeemed"
            );
        }
        EventPayload::Raw(data) => {
            debug!(topic = %event.topic, event_type = %event.event_type, data = %data, "event");
        }
    }
}
