//! Listener lists keyed by event, delivering into bounded subscriptions.

use tokio::sync::mpsc;

/// A stream of events delivered by the client.
///
/// Backed by a bounded channel: if the consumer falls behind, new events are
/// dropped (and logged) rather than stalling the event loop.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Create a connected listener/subscription pair.
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<T>, Subscription<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Subscription { rx })
    }

    /// Wait for the next event. Returns `None` once the client has shut down.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next event if one is already buffered.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

struct Listener<K, V> {
    filter: Option<K>,
    tx: mpsc::Sender<V>,
}

pub(crate) struct EventEmitter<K, V> {
    listeners: Vec<Listener<K, V>>,
    dropped: u64,
}

impl<K, V> Default for EventEmitter<K, V> {
    fn default() -> Self {
        EventEmitter {
            listeners: Vec::new(),
            dropped: 0,
        }
    }
}

impl<K: PartialEq + std::fmt::Debug, V: Clone> EventEmitter<K, V> {
    /// Register a listener for every event (`filter == None`) or one key.
    pub(crate) fn on(&mut self, filter: Option<K>, tx: mpsc::Sender<V>) {
        self.listeners.push(Listener { filter, tx });
    }

    pub(crate) fn emit(&mut self, key: &K, value: V) {
        let mut dropped = 0u64;
        self.listeners.retain(|listener| {
            if listener.filter.as_ref().is_some_and(|f| f != key) {
                return !listener.tx.is_closed();
            }
            match listener.tx.try_send(value.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        if dropped > 0 {
            self.dropped += dropped;
            tracing::warn!(
                event = ?key,
                total_dropped = self.dropped,
                "subscription full, dropping event"
            );
        }
    }

    pub(crate) fn clear(&mut self) {
        self.listeners.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}
