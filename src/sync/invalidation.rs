use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

/// Table-keyed cache invalidation.
///
/// Every mounted live query listens here and re-fetches when a table it
/// depends on is invalidated.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<String>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of listeners that will see the invalidation.
    pub fn invalidate(&self, table: &str) -> usize {
        let listeners = self.sender.send(table.to_string()).unwrap_or(0);
        debug!("Invalidated {} ({} listeners)", table, listeners);
        listeners
    }

    /// Receive the name of every invalidated table.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalidate_reaches_every_listener() {
        let bus = InvalidationBus::new();
        assert_eq!(bus.invalidate("prompt_usage"), 0);

        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();
        assert_eq!(bus.invalidate("user_subscriptions"), 2);
        assert_eq!(first.recv().await.unwrap(), "user_subscriptions");
        assert_eq!(second.recv().await.unwrap(), "user_subscriptions");
    }
}
