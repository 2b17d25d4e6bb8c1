//! Maps shared between the probes and the driver

use std::collections::HashMap;

use tracing::trace;

use crate::memory::layout::limits::CONNECT_STASH_CAPACITY;

/// Single-entry store keyed by a constant key.
///
/// The only way to change the record as a whole is [`GuessMap::update`],
/// which replaces it atomically with respect to readers of the map.
#[derive(Debug, Clone, Default)]
pub struct GuessMap<T> {
    entry: Option<T>,
}

impl<T: Copy> GuessMap<T> {
    pub fn new() -> Self {
        Self { entry: None }
    }

    pub fn with_value(value: T) -> Self {
        Self { entry: Some(value) }
    }

    pub fn lookup(&self) -> Option<T> {
        self.entry
    }

    /// In-place access to the live record, for single-field flags
    pub fn lookup_mut(&mut self) -> Option<&mut T> {
        self.entry.as_mut()
    }

    pub fn update(&mut self, value: T) {
        self.entry = Some(value);
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// Bounded pid/tgid keyed stash, matching entry and return probes
#[derive(Debug, Clone)]
pub struct ConnectStash {
    entries: HashMap<u64, u64>,
    capacity: usize,
}

impl ConnectStash {
    pub fn new() -> Self {
        Self::with_capacity(CONNECT_STASH_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Store `sock` for `pid_tgid`. Returns false when the stash is full.
    pub fn insert(&mut self, pid_tgid: u64, sock: u64) -> bool {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&pid_tgid) {
            trace!("connect stash full, dropping entry for {:#x}", pid_tgid);
            return false;
        }
        self.entries.insert(pid_tgid, sock);
        true
    }

    /// Remove and return the stashed pointer for `pid_tgid`
    pub fn take(&mut self, pid_tgid: u64) -> Option<u64> {
        self.entries.remove(&pid_tgid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ConnectStash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_map_replace() {
        let mut map = GuessMap::new();
        assert_eq!(map.lookup(), None::<u32>);
        map.update(1);
        map.update(2);
        assert_eq!(map.lookup(), Some(2));
        if let Some(value) = map.lookup_mut() {
            *value = 3;
        }
        assert_eq!(map.lookup(), Some(3));
        map.clear();
        assert_eq!(map.lookup(), None);
    }

    #[test]
    fn test_stash_take_removes() {
        let mut stash = ConnectStash::new();
        assert!(stash.insert(42, 0xdead));
        assert_eq!(stash.take(42), Some(0xdead));
        assert_eq!(stash.take(42), None);
        assert!(stash.is_empty());
    }

    #[test]
    fn test_stash_capacity() {
        let mut stash = ConnectStash::with_capacity(2);
        assert!(stash.insert(1, 10));
        assert!(stash.insert(2, 20));
        assert!(!stash.insert(3, 30));
        // Overwriting an existing key is allowed when full
        assert!(stash.insert(2, 21));
        assert_eq!(stash.len(), 2);
        assert_eq!(stash.take(2), Some(21));
    }
}
