use tokio::sync::broadcast;

use super::models::UsageChanged;

/// key: usage-notifier -> publish/subscribe for counter changes
#[derive(Clone)]
pub struct UsageNotifier {
    sender: broadcast::Sender<UsageChanged>,
}

impl UsageNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fire and forget; nobody listening is not an error.
    pub fn publish(&self, change: UsageChanged) {
        let _ = self.sender.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UsageChanged> {
        self.sender.subscribe()
    }
}

impl Default for UsageNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}
