//! Keyed, cancellable timers that fire back into the event loop.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::event_loop::Input;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    /// Next reconnect attempt while disconnected or suspended.
    ConnectionRetry,
    /// Bound on a connection attempt.
    ConnectionOpen,
    /// Server silence check while connected.
    Liveness,
    /// Wait for CLOSED after sending CLOSE.
    CloseAck,
    /// Proactive token renewal ahead of expiry.
    TokenRenewal,
    Ping(String),
    ChannelAttach(String),
    ChannelDetach(String),
    ChannelRetry(String),
    NackGrace(u64),
}

struct Entry {
    generation: u64,
    abort: Option<AbortHandle>,
}

/// Each scheduled timer carries a generation; a fire whose generation no
/// longer matches (cancelled or rescheduled meanwhile) is stale.
pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<Input>,
    active: HashMap<TimerKey, Entry>,
    next_generation: u64,
}

impl Timers {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Input>) -> Self {
        Timers {
            tx,
            active: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Schedule `key` to fire after `after`, replacing any pending timer with
    /// the same key.
    pub(crate) fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let input = Input::Timer {
            key: key.clone(),
            generation,
        };
        let abort = if after.is_zero() {
            // Delivered on the next loop iteration, after the current input.
            let _ = self.tx.send(input);
            None
        } else {
            let tx = self.tx.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(input);
            });
            Some(handle.abort_handle())
        };
        self.active.insert(key, Entry { generation, abort });
    }

    pub(crate) fn cancel(&mut self, key: &TimerKey) {
        if let Some(entry) = self.active.remove(key)
            && let Some(abort) = entry.abort
        {
            abort.abort();
        }
    }

    pub(crate) fn cancel_where(&mut self, mut predicate: impl FnMut(&TimerKey) -> bool) {
        let keys: Vec<TimerKey> = self.active.keys().filter(|k| predicate(k)).cloned().collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, key: &TimerKey) -> bool {
        self.active.contains_key(key)
    }

    /// Consume a fired timer. Returns `false` for stale fires.
    pub(crate) fn take_fired(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.active.get(key) {
            Some(entry) if entry.generation == generation => {
                self.active.remove(key);
                true
            }
            _ => {
                tracing::trace!(?key, generation, "Ignoring stale timer");
                false
            }
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, entry) in self.active.drain() {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fired(input: Input) -> (TimerKey, u64) {
        match input {
            Input::Timer { key, generation } => (key, generation),
            _ => panic!("expected a timer input"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKey::Liveness, Duration::from_secs(5));
        assert!(timers.is_active(&TimerKey::Liveness));

        let (key, generation) = fired(rx.recv().await.unwrap());
        assert_eq!(key, TimerKey::Liveness);
        assert!(timers.take_fired(&key, generation));
        assert!(!timers.is_active(&TimerKey::Liveness));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_makes_earlier_fire_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKey::ConnectionRetry, Duration::ZERO);
        timers.schedule(TimerKey::ConnectionRetry, Duration::from_secs(1));

        let (key, stale) = fired(rx.recv().await.unwrap());
        assert!(!timers.take_fired(&key, stale));
        let (key, current) = fired(rx.recv().await.unwrap());
        assert!(timers.take_fired(&key, current));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_where_removes_matching_keys() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKey::ChannelRetry("a".into()), Duration::from_secs(1));
        timers.schedule(TimerKey::ChannelRetry("b".into()), Duration::from_secs(1));
        timers.schedule(TimerKey::Liveness, Duration::from_secs(1));
        timers.cancel_where(|k| matches!(k, TimerKey::ChannelRetry(_)));
        assert!(!timers.is_active(&TimerKey::ChannelRetry("a".into())));
        assert!(timers.is_active(&TimerKey::Liveness));
        timers.cancel_all();
        assert!(!timers.is_active(&TimerKey::Liveness));
    }
}
