use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use afters_common::PulseDelta;

use super::broadcaster::PulseSubscriber;

/// Forwards deltas into a broadcast channel for transports (SSE, WebSocket)
/// to fan out to their own clients.
pub struct ChannelSubscriber {
    tx: broadcast::Sender<PulseDelta>,
}

impl ChannelSubscriber {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<PulseDelta>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// A receiver for another transport client.
    pub fn subscribe(&self) -> broadcast::Receiver<PulseDelta> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl PulseSubscriber for ChannelSubscriber {
    async fn deliver(&self, delta: &PulseDelta) -> anyhow::Result<()> {
        match self.tx.send(delta.clone()) {
            Ok(receivers) => debug!(venue_id = %delta.venue_id, receivers, "Pulse forwarded to channel"),
            // No connected clients is not a delivery failure.
            Err(_) => debug!(venue_id = %delta.venue_id, "No channel receivers for pulse"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afters_common::VenueScore;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn forwards_to_every_receiver() {
        let (sub, mut rx1) = ChannelSubscriber::new(16);
        let mut rx2 = sub.subscribe();
        let delta = PulseDelta::from(&VenueScore::empty(Uuid::new_v4(), Utc::now()));

        sub.deliver(&delta).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), delta);
        assert_eq!(rx2.recv().await.unwrap(), delta);
    }

    #[tokio::test]
    async fn no_receivers_is_not_an_error() {
        let (sub, rx) = ChannelSubscriber::new(4);
        drop(rx);
        let delta = PulseDelta::from(&VenueScore::empty(Uuid::new_v4(), Utc::now()));
        assert!(sub.deliver(&delta).await.is_ok());
    }
}
