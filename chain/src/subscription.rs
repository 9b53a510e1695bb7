//! Cancelable event subscriptions.

use tokio::sync::{mpsc, oneshot};

/// A stream of on-chain events plus the means to cancel it.
///
/// The producer side watches the paired cancel receiver and stops delivering
/// once it resolves. Dropping the subscription cancels it as well.
pub struct Subscription<T> {
    events: mpsc::Receiver<T>,
    cancel: Option<oneshot::Sender<()>>,
}

impl<T> Subscription<T> {
    pub fn new(events: mpsc::Receiver<T>, cancel: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel: Some(cancel),
        }
    }

    /// A subscription together with the producer's ends: the event sender and
    /// the cancellation receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Sender<T>, oneshot::Receiver<()>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (Self::new(event_rx, cancel_tx), event_tx, cancel_rx)
    }

    /// Next event, or `None` once the producer closed the stream.
    pub async fn recv(&mut self) -> Option<T> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.events.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
