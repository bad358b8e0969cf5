//! Per-connection registry of in-flight fetch operations.
//!
//! The registry maps a [`FetchKey`] to the connection's side of one
//! operation. Every entry leaves the registry exactly once: through its
//! terminal event ([`FetchRegistry::remove_current`]), through expiry
//! ([`FetchRegistry::sweep`]), through connection close
//! ([`FetchRegistry::cancel_all`]), or by being replaced on a key collision.
//! All but the first also cancel the operation.
//!
//! Each entry carries a generation number, assigned by the registry, so
//! that events from an operation that was already removed (or replaced under
//! the same key) can be told apart and dropped.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use metrilyx_dataserver::clock::Timestamp;
//! use metrilyx_dataserver::fetch::{channel, FetchEntry, FetchKey, FetchRegistry};
//! use metrilyx_dataserver::protocol::RequestMeta;
//!
//! let mut registry = FetchRegistry::new();
//! let (handle, reporter) = channel();
//! let (_events, cancel) = handle.into_parts();
//!
//! let key = FetchKey::new("g1", Timestamp::from_secs(0));
//! let generation = registry.next_generation();
//! registry.insert(key.clone(), FetchEntry::new(generation, RequestMeta::default(), cancel));
//!
//! let expired = registry.sweep(Timestamp::from_secs(901), Duration::from_secs(900));
//! assert_eq!(expired, vec![key]);
//! assert!(reporter.is_cancelled());
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::operation::{CancelHandle, FetchKey};
use crate::clock::Timestamp;
use crate::protocol::RequestMeta;

/// The connection's side of one in-flight operation.
#[derive(Debug)]
pub struct FetchEntry {
    generation: u64,
    meta: RequestMeta,
    cancel: CancelHandle,
    /// Task relaying this operation's events onto the connection.
    forwarder: Option<JoinHandle<()>>,
}

impl FetchEntry {
    pub fn new(generation: u64, meta: RequestMeta, cancel: CancelHandle) -> Self {
        Self {
            generation,
            meta,
            cancel,
            forwarder: None,
        }
    }

    /// Attach the relay task; it is aborted if the entry is cancelled.
    pub fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    /// Request cancellation and stop relaying events.
    pub fn cancel(self) {
        self.cancel.cancel();
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
    }
}

/// Registry of in-flight operations for one connection.
#[derive(Debug, Default)]
pub struct FetchRegistry {
    entries: HashMap<FetchKey, FetchEntry>,
    next_generation: u64,
}

impl FetchRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a generation number for an entry about to be inserted.
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Insert an entry, replacing and cancelling any entry under the same key.
    ///
    /// Returns `true` if an entry was replaced.
    pub fn insert(&mut self, key: FetchKey, entry: FetchEntry) -> bool {
        match self.entries.insert(key.clone(), entry) {
            Some(previous) => {
                tracing::warn!("Fetcher in progress, replacing: {}", key);
                previous.cancel();
                true
            }
            None => false,
        }
    }

    /// Get an entry by key.
    pub fn get(&self, key: &FetchKey) -> Option<&FetchEntry> {
        self.entries.get(key)
    }

    /// Check whether `key` is registered under `generation`.
    pub fn is_current(&self, key: &FetchKey, generation: u64) -> bool {
        self.entries
            .get(key)
            .map_or(false, |entry| entry.generation == generation)
    }

    pub fn contains(&self, key: &FetchKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry without cancelling it. Removing twice is a no-op.
    pub fn remove(&mut self, key: &FetchKey) -> Option<FetchEntry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            tracing::info!("Active fetchers: {}", self.entries.len());
        }
        removed
    }

    /// Remove an entry only if it is still the one registered under `generation`.
    pub fn remove_current(&mut self, key: &FetchKey, generation: u64) -> Option<FetchEntry> {
        if self.is_current(key, generation) {
            self.remove(key)
        } else {
            None
        }
    }

    /// Cancel and remove every entry submitted before `now - ttl`.
    ///
    /// Returns the expired keys.
    pub fn sweep(&mut self, now: Timestamp, ttl: Duration) -> Vec<FetchKey> {
        let cutoff = now.saturating_sub(ttl);
        let expired: Vec<FetchKey> = self
            .entries
            .keys()
            .filter(|key| key.submitted_at() < cutoff)
            .cloned()
            .collect();

        for key in &expired {
            if let Some(entry) = self.remove(key) {
                entry.cancel();
                tracing::info!("Expired fetcher: {}", key);
            }
        }
        expired
    }

    /// Cancel and remove every entry. Returns how many there were.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.cancel();
        }
        count
    }

    /// Keys of all in-flight operations.
    pub fn keys(&self) -> impl Iterator<Item = &FetchKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::operation::{channel, FetchReporter};

    fn entry(registry: &mut FetchRegistry, id: &str) -> (FetchEntry, FetchReporter) {
        let (handle, reporter) = channel();
        let (_events, cancel) = handle.into_parts();
        let meta = RequestMeta {
            id: id.to_string(),
            ..Default::default()
        };
        (FetchEntry::new(registry.next_generation(), meta, cancel), reporter)
    }

    fn key(id: &str, secs: u64) -> FetchKey {
        FetchKey::new(id, Timestamp::from_secs(secs))
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = FetchRegistry::new();
        let (e, reporter) = entry(&mut registry, "g1");

        assert!(!registry.insert(key("g1", 10), e));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&key("g1", 10)));
        assert_eq!(registry.get(&key("g1", 10)).unwrap().meta().id, "g1");

        let removed = registry.remove(&key("g1", 10));
        assert!(removed.is_some());
        assert!(registry.is_empty());
        // plain removal does not cancel
        assert!(!reporter.is_cancelled());

        assert!(registry.remove(&key("g1", 10)).is_none());
    }

    #[test]
    fn test_generations_are_unique() {
        let mut registry = FetchRegistry::new();
        let a = registry.next_generation();
        let b = registry.next_generation();
        assert_ne!(a, b);
    }

    #[test]
    fn test_collision_replaces_and_cancels_previous() {
        let mut registry = FetchRegistry::new();
        let (first, first_reporter) = entry(&mut registry, "g1");
        let (second, second_reporter) = entry(&mut registry, "g1");
        let second_generation = second.generation();

        registry.insert(key("g1", 10), first);
        assert!(registry.insert(key("g1", 10), second));

        assert_eq!(registry.len(), 1);
        assert!(registry.is_current(&key("g1", 10), second_generation));
        assert!(first_reporter.is_cancelled());
        assert!(!second_reporter.is_cancelled());
    }

    #[test]
    fn test_remove_current_ignores_stale_generation() {
        let mut registry = FetchRegistry::new();
        let (first, _r1) = entry(&mut registry, "g1");
        let stale = first.generation();
        let (second, _r2) = entry(&mut registry, "g1");
        let current = second.generation();

        registry.insert(key("g1", 10), first);
        registry.insert(key("g1", 10), second);

        assert!(registry.remove_current(&key("g1", 10), stale).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_current(&key("g1", 10), current).is_some());
        assert!(registry.remove_current(&key("g1", 10), current).is_none());
    }

    #[test]
    fn test_sweep_boundary() {
        let ttl = Duration::from_secs(900);
        let mut registry = FetchRegistry::new();
        let (e, reporter) = entry(&mut registry, "g1");
        registry.insert(key("g1", 0), e);

        assert!(registry.sweep(Timestamp::from_secs(800), ttl).is_empty());
        assert!(registry.sweep(Timestamp::from_secs(900), ttl).is_empty());
        assert!(!reporter.is_cancelled());

        let expired = registry.sweep(Timestamp::from_secs(901), ttl);
        assert_eq!(expired, vec![key("g1", 0)]);
        assert!(registry.is_empty());
        assert!(reporter.is_cancelled());
    }

    #[test]
    fn test_sweep_only_expired_entries() {
        let ttl = Duration::from_secs(900);
        let mut registry = FetchRegistry::new();
        let (old, old_reporter) = entry(&mut registry, "old");
        let (fresh, fresh_reporter) = entry(&mut registry, "fresh");
        registry.insert(key("old", 100), old);
        registry.insert(
            FetchKey::new("fresh", Timestamp::from_micros(100_000_001)),
            fresh,
        );

        // cutoff is exactly t=100s
        let expired = registry.sweep(Timestamp::from_secs(1000), ttl);
        assert!(expired.is_empty());

        let expired = registry.sweep(Timestamp::from_micros(1_000_000_001), ttl);
        assert_eq!(expired, vec![key("old", 100)]);
        assert!(old_reporter.is_cancelled());
        assert!(!fresh_reporter.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let mut registry = FetchRegistry::new();
        let mut reporters = Vec::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let (e, r) = entry(&mut registry, id);
            registry.insert(key(id, i as u64), e);
            reporters.push(r);
        }

        assert_eq!(registry.cancel_all(), 3);
        assert!(registry.is_empty());
        assert!(reporters.iter().all(|r| r.is_cancelled()));

        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn test_keys() {
        let mut registry = FetchRegistry::new();
        let (e, _r) = entry(&mut registry, "g1");
        registry.insert(key("g1", 5), e);

        let keys: Vec<_> = registry.keys().cloned().collect();
        assert_eq!(keys, vec![key("g1", 5)]);
    }
}
