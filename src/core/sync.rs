/*!
 * Sync Primitives
 * Level-triggered wake event for producer/consumer loops
 */

use tokio::sync::watch;

/// Manual-reset event.
///
/// `wait` completes whenever the event is in the set state, no matter how
/// long ago `set` was called. Consumers call `reset` after draining so the
/// next `wait` blocks until a producer signals again. This is the wake
/// primitive for the output drain loop: readers `set` after every enqueued
/// line, the drain loop `reset`s before re-emitting.
pub struct ResetEvent {
    tx: watch::Sender<bool>,
}

impl ResetEvent {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Put the event into the set state, waking all current waiters.
    pub fn set(&self) {
        let _ = self.tx.send(true);
    }

    /// Return the event to the unset state.
    pub fn reset(&self) {
        let _ = self.tx.send(false);
    }

    /// Wait until the event is set. Returns immediately if already set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for ResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_when_already_set() {
        let event = ResetEvent::new();
        event.set();
        event.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_set() {
        let event = Arc::new(ResetEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            tokio::spawn(async move { event.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        event.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn reset_blocks_next_wait() {
        let event = ResetEvent::new();
        event.set();
        event.wait().await;
        event.reset();

        let blocked = tokio::time::timeout(Duration::from_millis(50), event.wait()).await;
        assert!(blocked.is_err());
    }
}
