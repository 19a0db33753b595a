//! Cancellation signal shared by long-running operations.
//!
//! A `watch::Receiver<bool>` where `true` means "stop". The CLI flips it on
//! SIGINT/SIGTERM; tests flip it directly.

use tokio::sync::watch;

/// Sender half: `cancel.send_replace(true)` requests cancellation.
pub type CancelSender = watch::Sender<bool>;
/// Receiver half handed to operations.
pub type CancelReceiver = watch::Receiver<bool>;

/// New cancellation pair, initially not cancelled.
pub fn channel() -> (CancelSender, CancelReceiver) {
    watch::channel(false)
}

pub fn is_cancelled(rx: &CancelReceiver) -> bool {
    *rx.borrow()
}

/// Resolve once cancellation is requested.
///
/// Never resolves if the sender is dropped without cancelling.
pub async fn cancelled(rx: &mut CancelReceiver) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_on_true() {
        let (tx, mut rx) = channel();
        assert!(!is_cancelled(&rx));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(true);
            // keep the sender alive until the receiver has seen it
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        tokio::time::timeout(Duration::from_secs(2), cancelled(&mut rx))
            .await
            .unwrap();
        assert!(is_cancelled(&rx));
    }

    #[tokio::test]
    async fn test_dropped_sender_never_cancels() {
        let (tx, mut rx) = channel();
        drop(tx);
        let res = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx)).await;
        assert!(res.is_err());
    }
}
