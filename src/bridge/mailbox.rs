use super::error::BridgeError;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Unbounded FIFO hand-off between the transport side and one internal consumer.
///
/// Producers enqueue without waiting. A single consumer dequeues; closing the
/// mailbox wakes that consumer with `None` and discards whatever is still
/// queued.
#[derive(Debug)]
pub struct Mailbox<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    closed: CancellationToken,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Queue `item`. Hands the item back if the mailbox is closed.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        if self.closed.is_cancelled() {
            return Err(item);
        }
        self.tx.send(item).map_err(|rejected| rejected.0)
    }

    /// Wait for the next item. Returns `None` once the mailbox is closed.
    pub async fn dequeue(&self) -> Option<T> {
        let mut rx = tokio::select! {
            biased;
            () = self.closed.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Per-bridge holder of the mailbox allocated by `connect()`.
///
/// Empty while the bridge is not connected, so every operation that needs the
/// mailbox fails fast with [`BridgeError::NotConnected`].
#[derive(Debug)]
pub struct MailboxSlot<T> {
    bridge: &'static str,
    current: RwLock<Option<Arc<Mailbox<T>>>>,
}

impl<T> MailboxSlot<T> {
    pub fn new(bridge: &'static str) -> Self {
        Self {
            bridge,
            current: RwLock::new(None),
        }
    }

    /// Allocate a fresh mailbox, replacing (and closing) any previous one.
    pub fn install(&self) -> Arc<Mailbox<T>> {
        let mailbox = Arc::new(Mailbox::new());
        if let Some(previous) = self.current.write().replace(Arc::clone(&mailbox)) {
            previous.close();
        }
        mailbox
    }

    /// Detach and close the current mailbox.
    pub fn tear_down(&self) {
        if let Some(mailbox) = self.current.write().take() {
            mailbox.close();
        }
    }

    pub fn get(&self) -> Result<Arc<Mailbox<T>>, BridgeError> {
        self.current
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(BridgeError::NotConnected {
                bridge: self.bridge,
            })
    }

    /// Enqueue onto the current mailbox.
    pub fn enqueue(&self, item: T) -> Result<(), BridgeError> {
        self.get()?.enqueue(item).map_err(|_| BridgeError::NotConnected {
            bridge: self.bridge,
        })
    }

    /// Dequeue from the current mailbox; `Ok(None)` when it closes while waiting.
    pub async fn dequeue(&self) -> Result<Option<T>, BridgeError> {
        let mailbox = self.get()?;
        Ok(mailbox.dequeue().await)
    }
}
