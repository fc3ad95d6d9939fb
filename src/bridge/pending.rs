//! Pending-exchange table: correlation key -> single-assignment reply slot.
//!
//! The table lock is never held across an `.await`. Fulfilment sends the value
//! while still holding the lock, and timeout eviction checks the slot's channel
//! after removing its entry, so a waiter always observes exactly one of
//! {delivery, timeout} for a given key.

use super::error::{BridgeError, WaitError};
use crate::protocol::CorrelationKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

struct PendingEntry<T> {
    generation: u64,
    tx: oneshot::Sender<T>,
}

type SlotMap<T> = Mutex<HashMap<CorrelationKey, PendingEntry<T>>>;

/// Correlation key -> waiting reply slot.
pub struct PendingExchanges<T> {
    slots: Arc<SlotMap<T>>,
    next_generation: AtomicU64,
}

impl<T> Default for PendingExchanges<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PendingExchanges<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingExchanges")
            .field("pending", &self.len())
            .finish()
    }
}

impl<T> PendingExchanges<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register a slot for `key`. A key can only be pending once.
    pub fn register(&self, key: CorrelationKey) -> Result<PendingSlot<T>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut slots = self.slots.lock();
        if slots.contains_key(&key) {
            return Err(BridgeError::DuplicateKey { key });
        }
        slots.insert(key.clone(), PendingEntry { generation, tx });

        Ok(PendingSlot {
            key,
            generation,
            rx: Some(rx),
            slots: Arc::downgrade(&self.slots),
        })
    }

    /// Deliver `value` to the waiter registered under `key`.
    ///
    /// Returns `false` without side effects when the key is not pending
    /// (timed out, already fulfilled, never registered, or the waiter went
    /// away). That is the orphan path; it never blocks and never panics.
    pub fn fulfil(&self, key: &CorrelationKey, value: T) -> bool {
        self.try_fulfil(key, value).is_ok()
    }

    /// Like [`fulfil`](Self::fulfil), but hands an undelivered value back.
    pub fn try_fulfil(&self, key: &CorrelationKey, value: T) -> Result<(), T> {
        let mut slots = self.slots.lock();
        match slots.remove(key) {
            Some(entry) => entry.tx.send(value),
            None => Err(value),
        }
    }

    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending slot. Waiters return [`WaitError::Expired`] at once.
    pub fn expire_all(&self) -> usize {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        drained.len()
    }
}

/// Receiving half of one pending exchange.
///
/// Owned by the transport handler that registered it. Dropping the slot
/// without waiting (for example when the HTTP client hangs up) evicts the key.
pub struct PendingSlot<T> {
    key: CorrelationKey,
    generation: u64,
    rx: Option<oneshot::Receiver<T>>,
    slots: Weak<SlotMap<T>>,
}

impl<T> std::fmt::Debug for PendingSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSlot")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<T> PendingSlot<T> {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Wait for the reply for at most `timeout`.
    ///
    /// On timeout the key is evicted before returning, so a later `fulfil`
    /// is a no-op. If the fulfilment won the race the delivered value is
    /// returned instead of a timeout.
    pub async fn wait(mut self, timeout: Duration) -> Result<T, WaitError> {
        let Some(mut rx) = self.rx.take() else {
            return Err(WaitError::Expired);
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WaitError::Expired),
            Err(_) => {
                if self.evict() {
                    Err(WaitError::TimedOut)
                } else {
                    rx.try_recv().map_err(|_| WaitError::TimedOut)
                }
            }
        }
    }

    /// Remove this slot's entry if it is still the registered one.
    fn evict(&self) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let mut slots = slots.lock();
        if slots
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            slots.remove(&self.key);
            true
        } else {
            false
        }
    }
}

impl<T> Drop for PendingSlot<T> {
    fn drop(&mut self) {
        self.evict();
    }
}
