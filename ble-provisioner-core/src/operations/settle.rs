use crate::lock;
use std::sync::Mutex;
use tokio::sync::{Notify, oneshot};

/// Single-resolution slot shared by the triggers of one exchange.
///
/// The notification listener, the deadline timer and link loss all resolve
/// through the same `resolve`; the first call delivers its value and every
/// later call is a no-op returning `false`.
pub struct Settle<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
    done: Notify,
}

impl<T> Settle<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
                done: Notify::new(),
            },
            rx,
        )
    }

    pub fn resolve(&self, value: T) -> bool {
        match lock(&self.tx).take() {
            // The receiver may already be gone if the session stopped waiting.
            Some(tx) => {
                let _ = tx.send(value);
                self.done.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        lock(&self.tx).is_none()
    }

    /// Completes once some trigger has resolved the slot, without taking the value.
    pub async fn settled(&self) {
        if self.is_settled() {
            return;
        }
        // `notify_one` leaves a permit, so a resolve racing this line is not lost.
        self.done.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_resolution_wins() {
        let (settle, rx) = Settle::new();
        assert!(!settle.is_settled());

        assert!(settle.resolve("event"));
        assert!(!settle.resolve("timer"));
        assert!(settle.is_settled());

        assert_eq!(rx.await.unwrap(), "event");
    }

    #[tokio::test(start_paused = true)]
    async fn settled_wakes_a_waiter_as_soon_as_resolved() {
        let (settle, _rx) = Settle::new();
        let settle = std::sync::Arc::new(settle);

        let resolver = settle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            resolver.resolve(7);
        });

        let started = tokio::time::Instant::now();
        settle.settled().await;
        let waited = started.elapsed();
        assert!(waited >= std::time::Duration::from_millis(30));
        assert!(waited < std::time::Duration::from_millis(100));

        // Already settled: returns right away.
        settle.settled().await;
    }

    #[test]
    fn resolving_after_receiver_dropped_still_settles() {
        let (settle, rx) = Settle::new();
        drop(rx);

        assert!(settle.resolve(1));
        assert!(!settle.resolve(2));
    }
}
