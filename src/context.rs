//! Per-call context: request metadata plus a cancellation chain
//!
//! A context derived with [`CallContext::with_cancel`] observes its own
//! cancellation and that of every ancestor, so cancelling an inbound call
//! reaches everything the director derived from it.

use futures::future::select_all;
use tokio::sync::watch;
use tonic::metadata::MetadataMap;

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    metadata: MetadataMap,
    signals: Vec<watch::Receiver<bool>>,
}

/// Cancels the context it was created with. Dropping the handle cancels too.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl CallContext {
    /// Root context for an inbound call
    pub fn new(metadata: MetadataMap) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            metadata,
            signals: vec![rx],
        };
        (ctx, CancelHandle { tx })
    }

    /// A context that is never cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context cancelled by `handle` or by any ancestor.
    ///
    /// Metadata is not inherited; use [`CallContext::with_metadata`].
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(rx);
        let ctx = Self {
            metadata: MetadataMap::new(),
            signals,
        };
        (ctx, CancelHandle { tx })
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once this context or one of its ancestors is cancelled
    pub async fn cancelled(&self) {
        if self.signals.is_empty() {
            return std::future::pending().await;
        }

        let waits = self.signals.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                // A sender dropped without cancelling never fires
                let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if closed {
                    std::future::pending::<()>().await;
                }
            })
        });
        select_all(waits).await;
    }
}
