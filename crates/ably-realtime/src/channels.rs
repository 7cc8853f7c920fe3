//! The client's channel registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};

use crate::channel::{Channel, ChannelSnapshot};
use crate::deferred::Deferred;
use crate::event_loop::{Command, dispatch};
use crate::options::ChannelOptions;

/// Channel handles by name, shared with the [`Connection`](crate::Connection)
/// for building recovery keys.
pub(crate) type Registry = Arc<Mutex<HashMap<String, Channel>>>;

/// Get-or-create access to channels. Every `get` of the same name returns a
/// handle to the same channel until it is released.
#[derive(Clone)]
pub struct Channels {
    cmd_tx: mpsc::UnboundedSender<Command>,
    registry: Registry,
    capacity: usize,
}

impl Channels {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<Command>, registry: Registry, capacity: usize) -> Self {
        Channels {
            cmd_tx,
            registry,
            capacity,
        }
    }

    pub fn get(&self, name: &str) -> Channel {
        self.get_or_create(name, None)
    }

    /// Like [`get`](Self::get), replacing the options of an existing channel.
    pub fn get_with_options(&self, name: &str, options: ChannelOptions) -> Channel {
        self.get_or_create(name, Some(options))
    }

    fn get_or_create(&self, name: &str, options: Option<ChannelOptions>) -> Channel {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = registry.get(name) {
            if let Some(options) = options {
                channel.set_options(options);
            }
            return channel.clone();
        }
        // Sent under the lock so a concurrent release cannot overtake it.
        let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::default());
        dispatch(&self.cmd_tx, Command::CreateChannel {
            name: name.to_string(),
            options: options.unwrap_or_default(),
            snapshot_tx,
        });
        let channel = Channel::new(self.cmd_tx.clone(), name.to_string(), snapshot_rx, self.capacity);
        registry.insert(name.to_string(), channel.clone());
        channel
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Names of all channels, sorted.
    pub fn names(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }

    /// Detach and forget a channel. Pending operations on it are rejected
    /// and existing handles stop receiving events.
    pub fn release(&self, name: &str) -> Deferred<()> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.remove(name);
        let (resolver, deferred) = Deferred::pair();
        dispatch(&self.cmd_tx, Command::ReleaseChannel {
            name: name.to_string(),
            resolver,
        });
        deferred
    }
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channels").field("names", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (Channels, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Channels::new(tx, Registry::default(), 8), rx)
    }

    #[test]
    fn get_creates_once() {
        let (channels, mut rx) = channels();
        let a = channels.get("room");
        let b = channels.get("room");
        assert_eq!(a.name(), b.name());
        assert!(matches!(rx.try_recv(), Ok(Command::CreateChannel { .. })));
        assert!(rx.try_recv().is_err());
        assert!(channels.exists("room"));
        assert!(!channels.exists("other"));
    }

    #[test]
    fn get_with_options_updates_existing() {
        let (channels, mut rx) = channels();
        channels.get("room");
        let options = ChannelOptions::default().with_param("rewind", "1");
        channels.get_with_options("room", options.clone());
        assert!(matches!(rx.try_recv(), Ok(Command::CreateChannel { .. })));
        match rx.try_recv() {
            Ok(Command::SetChannelOptions { name, options: sent }) => {
                assert_eq!(name, "room");
                assert_eq!(sent, options);
            }
            _ => panic!("expected SetChannelOptions"),
        }
    }

    #[test]
    fn release_removes_and_names_are_sorted() {
        let (channels, _rx) = channels();
        channels.get("b");
        channels.get("a");
        channels.get("c");
        assert_eq!(channels.names(), vec!["a", "b", "c"]);
        drop(channels.release("b"));
        assert_eq!(channels.names(), vec!["a", "c"]);
    }
}
