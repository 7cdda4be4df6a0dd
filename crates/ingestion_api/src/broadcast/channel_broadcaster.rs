use common::domain::{BroadcastMessage, BroadcastPublisher};
use tokio::sync::broadcast;
use tracing::debug;

/// In-process fan-out to every connected dashboard observer
///
/// Each observer holds its own receiver. A slow observer that falls more than
/// `capacity` messages behind loses the oldest ones; nothing is replayed.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl BroadcastPublisher for ChannelBroadcaster {
    fn publish(&self, message: BroadcastMessage) {
        match self.sender.send(message) {
            Ok(observers) => debug!(observers, "broadcast telemetry update"),
            Err(_) => debug!("no dashboard observers connected; dropping broadcast"),
        }
    }
}
