use std::num::NonZeroUsize;

use lru::LruCache;

/// Keys of open connections which are currently not referenced by anybody.
///
/// The list is bounded, inserting into a full list evicts the least recently used key, whose
/// connection should then be closed.
#[derive(Debug)]
pub struct IdleList {
    /// `None` if the capacity is zero, in which case nothing is ever retained.
    keys: Option<LruCache<String, ()>>,
}

impl IdleList {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    /// Marks `key` as idle, and returns the key that was evicted to make room for it.
    ///
    /// With a capacity of zero, `key` itself is returned right away.
    pub fn insert(&mut self, key: String) -> Option<String> {
        let Some(keys) = self.keys.as_mut() else {
            return Some(key);
        };
        match keys.push(key, ()) {
            // `push` also returns the old value when re-inserting an existing key.
            Some((evicted, ())) if !keys.contains(&evicted) => Some(evicted),
            _ => None,
        }
    }

    /// Removes `key`, because it is in use again or is being closed.
    pub fn remove(&mut self, key: &str) -> bool {
        self.keys
            .as_mut()
            .is_some_and(|keys| keys.pop(key).is_some())
    }

    pub fn clear(&mut self) {
        if let Some(keys) = self.keys.as_mut() {
            keys.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, |keys| keys.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
