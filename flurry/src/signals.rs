//! One-shot phase signals.
//!
//! A `Broadcaster` tells any number of `Watcher` instances that something has
//! happened, typically that they should stop. The signal fires once and stays
//! fired. Dropping the `Broadcaster` without signaling counts as a signal so
//! that a crashed owner never leaves watchers hanging.

use tokio::sync::watch;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

/// Sends the signal to every `Watcher` derived from the same pair.
#[derive(Debug)]
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal. Does not wait for watchers to observe it.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }
}

/// Waits for the signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the signal. Returns immediately if it has already fired.
    pub async fn recv(mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Check for the signal without blocking.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn every_watcher_sees_the_signal() {
        let (watcher, broadcaster) = signal();
        let other = watcher.clone();
        assert!(!watcher.try_recv());

        let waiting = tokio::spawn(other.recv());
        broadcaster.signal();

        assert!(watcher.try_recv());
        waiting.await.expect("watcher task panicked");
        watcher.recv().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_broadcaster_counts_as_signal() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        assert!(watcher.try_recv());
        tokio::time::timeout(Duration::from_secs(1), watcher.recv())
            .await
            .expect("recv should return once the broadcaster is gone");
    }
}
