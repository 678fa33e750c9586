//! Per-connection metadata side table.
//!
//! Stages hold no connection-specific state themselves; anything a stage
//! needs to remember between its open and close handlers lives here,
//! keyed by connection id. Entries must be removed on close so a closed
//! connection leaves nothing behind.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::ConnectionId;

/// A typed side table keyed by connection identity.
///
/// Safe for concurrent use across distinct connections; the pipeline
/// guarantees at most one in-flight lifecycle event per connection id,
/// so no two tasks touch the same key at once.
pub struct MetadataMap<T> {
    inner: Mutex<HashMap<ConnectionId, T>>,
}

impl<T> MetadataMap<T> {
    /// An empty side table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Store a value for the connection, replacing any previous entry.
    pub fn insert(&self, id: ConnectionId, value: T) -> Option<T> {
        self.lock().insert(id, value)
    }

    /// Remove and return the connection's entry, if any.
    pub fn take(&self, id: ConnectionId) -> Option<T> {
        self.lock().remove(&id)
    }

    /// Whether the connection has an entry.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of live entries (test and diagnostics helper).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> MetadataMap<T> {
    /// Clone the connection's entry without removing it.
    pub fn get(&self, id: ConnectionId) -> Option<T> {
        self.lock().get(&id).cloned()
    }
}

impl<T> Default for MetadataMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_take_roundtrip() {
        let map = MetadataMap::new();
        let id = ConnectionId::new();

        assert!(map.insert(id, 7u32).is_none());
        assert_eq!(map.get(id), Some(7));
        assert_eq!(map.take(id), Some(7));
        assert!(map.take(id).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn entries_are_keyed_per_connection() {
        let map = MetadataMap::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        map.insert(a, "a".to_owned());
        map.insert(b, "b".to_owned());
        assert_eq!(map.get(a).as_deref(), Some("a"));
        assert_eq!(map.get(b).as_deref(), Some("b"));
        assert_eq!(map.len(), 2);
    }
}
