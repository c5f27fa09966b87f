//! Wake-ups for long-polling fetches.

use tokio::sync::watch;

/// Broadcasts "task versions may have moved" to every waiting fetch.
///
/// Waiters re-read their own scope's version when woken, so one channel serves
/// every scope.
#[derive(Clone)]
pub struct VersionNotifier {
    tx: watch::Sender<u64>,
}

impl VersionNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Subscribe before reading versions so no wake-up is missed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for VersionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscriber_wakes_on_notify() {
        let notifier = VersionNotifier::new();
        let mut rx = notifier.subscribe();

        let waiter = tokio::spawn(async move { rx.changed().await.is_ok() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify();

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_fine() {
        let notifier = VersionNotifier::new();
        notifier.notify();
        let rx = notifier.subscribe();
        assert_eq!(*rx.borrow(), 1);
    }
}
