//! Module to control shutdown of the emitter.
//!
//! The mechanism has two halves, a [`Broadcaster`] and any number of
//! [`Watcher`] instances. The signal is one-time: once the [`Broadcaster`]
//! signals, or is dropped, every [`Watcher`] past and future observes it.

use tokio::sync::watch;

/// Construct a [`Watcher`] and [`Broadcaster`] pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

/// Mechanism to notify all [`Watcher`] instances that shutdown has begun.
#[derive(Debug)]
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal through to all [`Watcher`] instances.
    pub fn signal(self) {
        // An error here means there are no watchers left, which is fine.
        let _ = self.sender.send(true);
    }
}

/// Waits for the [`Broadcaster`] to signal. Clone freely.
#[derive(Debug, Clone)]
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the shutdown signal. Returns immediately if it has already
    /// been sent.
    pub async fn recv(mut self) {
        // The sender being dropped counts as a signal.
        let _ = self.receiver.wait_for(|signalled| *signalled).await;
    }
}
