//! Cooperative shutdown: a broadcast stop signal for background loops.
//!
//! Every long-running loop in the stack holds a [`StopListener`] and checks
//! it at loop heads and suspension points. Dropping the [`StopSignal`] also
//! stops all listeners, so an owner going away cannot strand its workers.

use tokio::sync::watch;

/// Owning side of the stop signal.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    /// Create a new, un-stopped signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Create a listener for this signal.
    #[must_use]
    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Broadcast stop to every listener, including ones created later.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Listening side of the stop signal.
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// Whether stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        // A closed channel means the owner is gone; treat that as stopped.
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait until stop is requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // An Err means the sender was dropped, which also counts as stopped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// A listener that is already stopped, for tests and defaults.
    #[must_use]
    pub fn already_stopped() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_observe_stop() {
        let signal = StopSignal::new();
        let listener = signal.listener();
        assert!(!listener.is_stopped());

        signal.stop();
        assert!(listener.is_stopped());
        listener.stopped().await;
    }

    #[tokio::test]
    async fn dropping_the_signal_stops_listeners() {
        let signal = StopSignal::new();
        let listener = signal.listener();
        drop(signal);
        assert!(listener.is_stopped());
        listener.stopped().await;
    }

    #[tokio::test]
    async fn stopped_wakes_a_waiting_task() {
        let signal = StopSignal::new();
        let listener = signal.listener();
        let waiter = tokio::spawn(async move { listener.stopped().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }
}
