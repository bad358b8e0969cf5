//! Process-wide set of open connections.
//!
//! Connections register on open and deregister on close. [`ClientSet`] is
//! the shared implementation; it is the only state touched by more than one
//! connection, so it sits behind a mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::writer::WriterHandle;

/// Identifies one connection for the lifetime of the process.
pub type ConnectionId = u64;

/// Registry of open connections.
pub trait BroadcastSet: Send + Sync + 'static {
    fn add_client(&self, id: ConnectionId, writer: WriterHandle);
    fn remove_client(&self, id: ConnectionId);
}

/// Mutex-guarded map of open connections to their writers.
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: Mutex<HashMap<ConnectionId, WriterHandle>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Queue `text` to every registered connection without waiting.
    ///
    /// Returns how many connections accepted it; the rest are full or closing.
    pub fn broadcast(&self, text: &str) -> usize {
        let writers: Vec<WriterHandle> = self.lock().values().cloned().collect();
        writers
            .iter()
            .filter(|writer| writer.try_send(text.to_string()).is_ok())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, WriterHandle>> {
        // a panic while holding the lock cannot leave the map half-updated
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BroadcastSet for ClientSet {
    fn add_client(&self, id: ConnectionId, writer: WriterHandle) {
        self.lock().insert(id, writer);
        tracing::debug!("Client {} added, {} connected", id, self.len());
    }

    fn remove_client(&self, id: ConnectionId) {
        self.lock().remove(&id);
        tracing::debug!("Client {} removed, {} connected", id, self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{WriterConfig, WriterHandle};

    #[test]
    fn test_add_and_remove() {
        let set = ClientSet::new();
        let (writer, _rx) = WriterHandle::channel(WriterConfig::default());

        set.add_client(1, writer.clone());
        set.add_client(2, writer);
        assert_eq!(set.len(), 2);
        assert!(set.contains(1));

        set.remove_client(1);
        set.remove_client(1);
        assert_eq!(set.len(), 1);
        assert!(!set.contains(1));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let set = ClientSet::new();
        let (a, mut a_rx) = WriterHandle::channel(WriterConfig::default());
        let (b, mut b_rx) = WriterHandle::channel(WriterConfig::default());
        set.add_client(1, a);
        set.add_client(2, b);

        assert_eq!(set.broadcast(r#"{"reload":true}"#), 2);
        assert_eq!(a_rx.recv().await.unwrap(), r#"{"reload":true}"#);
        assert_eq!(b_rx.recv().await.unwrap(), r#"{"reload":true}"#);
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_clients() {
        let set = ClientSet::new();
        let (open, _open_rx) = WriterHandle::channel(WriterConfig::default());
        let (closed, closed_rx) = WriterHandle::channel(WriterConfig::default());
        drop(closed_rx);
        set.add_client(1, open);
        set.add_client(2, closed);

        assert_eq!(set.broadcast("{}"), 1);
    }
}
