//! Sentinel coordinator.
//!
//! Mints synthetic markers, injects them into the applier's input
//! channel and waits for the applier to observe them after a durable
//! commit. A fulfilled wait proves every source commit up to the
//! captured LSN has reached the destination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::util::postgres_now;

use super::message::Message;
use super::{Error, Lsn};

#[derive(Debug, Default)]
struct Pending {
    tx: Option<oneshot::Sender<()>>,
    rx: Option<oneshot::Receiver<()>>,
}

#[derive(Debug)]
struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    injector: Mutex<Option<mpsc::Sender<Message>>>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct SentinelCoordinator {
    inner: Arc<Inner>,
}

impl SentinelCoordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                injector: Mutex::new(None),
                cancel,
            }),
        }
    }

    /// Attach the applier-input channel. Called when streaming starts.
    pub(crate) fn install(&self, tx: mpsc::Sender<Message>) {
        *self.inner.injector.lock() = Some(tx);
    }

    /// Detach the applier-input channel, dropping our sender so the
    /// channel can close.
    pub(crate) fn uninstall(&self) {
        *self.inner.injector.lock() = None;
    }

    /// Mint a sentinel and inject it into the stream. Returns its id.
    pub async fn initiate(&self, applied: Lsn) -> Result<u64, Error> {
        let injector = self
            .inner
            .injector
            .lock()
            .clone()
            .ok_or(Error::NotStreaming)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            Pending {
                tx: Some(tx),
                rx: Some(rx),
            },
        );

        let message = Message::sentinel(id, applied, postgres_now());

        select! {
            _ = self.inner.cancel.cancelled() => {
                self.inner.pending.lock().remove(&id);
                return Err(Error::Cancelled);
            }

            sent = injector.send(message) => {
                if sent.is_err() {
                    self.inner.pending.lock().remove(&id);
                    return Err(Error::Cancelled);
                }
            }
        }

        debug!("sentinel {} injected at {}", id, applied);

        Ok(id)
    }

    /// Wait for the applier to confirm the sentinel.
    pub async fn wait(&self, id: u64, timeout: Duration) -> Result<(), Error> {
        let rx = self
            .inner
            .pending
            .lock()
            .get_mut(&id)
            .and_then(|pending| pending.rx.take())
            .ok_or(Error::UnknownSentinel(id))?;

        let result = tokio::time::timeout(timeout, rx).await;
        self.inner.pending.lock().remove(&id);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Fulfill the sentinel. Called by the applier after the commit
    /// containing it. Double-confirm and unknown ids are no-ops.
    pub fn confirm(&self, id: u64) {
        if let Some(pending) = self.inner.pending.lock().get_mut(&id) {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Drop all pending entries, waking their waiters with an error.
    pub(crate) fn drop_pending(&self) {
        self.inner.pending.lock().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn coordinator() -> (SentinelCoordinator, mpsc::Receiver<Message>) {
        let coordinator = SentinelCoordinator::new(CancellationToken::new());
        let (tx, rx) = mpsc::channel(16);
        coordinator.install(tx);
        (coordinator, rx)
    }

    #[tokio::test]
    async fn test_not_streaming() {
        let coordinator = SentinelCoordinator::new(CancellationToken::new());
        let result = coordinator.initiate(Lsn(1)).await;
        assert!(matches!(result, Err(Error::NotStreaming)));
    }

    #[tokio::test]
    async fn test_confirm_then_wait() {
        let (coordinator, mut rx) = coordinator();

        let id = coordinator.initiate(Lsn(100)).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().body,
            super::super::message::MessageBody::Sentinel { id: got } if got == id
        ));

        coordinator.confirm(id);
        coordinator.confirm(id); // no-op

        coordinator.wait(id, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_timeout() {
        let (coordinator, _rx) = coordinator();

        let id = coordinator.initiate(Lsn(1)).await.unwrap();
        let result = coordinator.wait(id, Duration::ZERO).await;
        assert!(matches!(result, Err(Error::Timeout)));

        // Entry removed on timeout.
        let result = coordinator.wait(id, Duration::ZERO).await;
        assert!(matches!(result, Err(Error::UnknownSentinel(_))));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (coordinator, _rx) = coordinator();
        let result = coordinator.wait(42, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::UnknownSentinel(42))));
    }

    #[tokio::test]
    async fn test_ids_monotonic() {
        let (coordinator, _rx) = coordinator();
        let one = coordinator.initiate(Lsn(1)).await.unwrap();
        let two = coordinator.initiate(Lsn(2)).await.unwrap();
        assert!(two > one);
    }
}
