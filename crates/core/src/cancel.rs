//! Session-scoped cooperative cancellation
//!
//! One `CancellationSource` per session. Cancellation is idempotent and
//! fans out to every task holding a token; tasks observe it either by
//! polling `is_cancelled` or by awaiting `cancelled()` inside a select.

use tokio::sync::watch;

/// Owning side of the cancellation signal
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a token observing this source
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        // send_replace never fails even with no receivers
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the cancellation signal
#[derive(Debug, Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires. Also resolves if the owning source
    /// is dropped, since the session is gone either way.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_observed() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        source.cancel();
        assert!(token.is_cancelled());
        // Awaiting after the fact returns immediately
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let source = CancellationSource::new();
        source.cancel();
        source.cancel();
        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_source_releases_waiters() {
        let source = CancellationSource::new();
        let token = source.token();
        drop(source);
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .unwrap();
    }
}
