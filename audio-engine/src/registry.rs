//! Lifetime-aware registry the audio callback discovers live streams from.
//!
//! Entries hold a `Weak` to the stream's shared state; the weak reference is
//! both the lifetime token and the only access path, so the callback can
//! never reach freed storage. The callback validates each entry again by
//! upgrading it in the same pass that takes the in-use count.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::stream::{StreamShared, StreamToken};

// Dead entries are swept on this many mutating operations.
const CLEANUP_INTERVAL: u32 = 100;

#[derive(Clone)]
pub(crate) struct StreamEntry {
    pub token: StreamToken,
    pub shared: Weak<StreamShared>,
}

impl StreamEntry {
    fn is_valid(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

pub(crate) struct StreamRegistry {
    entries: RwLock<Vec<StreamEntry>>,
    mutations: AtomicU32,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            mutations: AtomicU32::new(0),
        }
    }

    /// Registers a stream; a re-add of an existing token replaces its weak
    /// reference, so the registry never holds duplicate tokens.
    pub fn add(&self, token: StreamToken, shared: Weak<StreamShared>) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.token == token) {
            Some(entry) => entry.shared = shared,
            None => entries.push(StreamEntry { token, shared }),
        }
        self.maybe_cleanup(&mut entries);
    }

    pub fn remove(&self, token: StreamToken) {
        let mut entries = self.entries.write();
        entries.retain(|e| e.token != token);
        self.maybe_cleanup(&mut entries);
    }

    /// Snapshot of entries that were still alive at the time of the call.
    /// Callers re-validate by upgrading; streams added afterwards appear in
    /// the next snapshot.
    pub fn get_valid_streams(&self) -> Arc<Vec<StreamEntry>> {
        let entries = self.entries.read();
        Arc::new(entries.iter().filter(|e| e.is_valid()).cloned().collect())
    }

    pub fn valid_count(&self) -> usize {
        self.entries.read().iter().filter(|e| e.is_valid()).count()
    }

    pub fn cleanup(&self) {
        self.entries.write().retain(|e| e.is_valid());
    }

    fn maybe_cleanup(&self, entries: &mut Vec<StreamEntry>) {
        if self.mutations.fetch_add(1, Ordering::Relaxed) % CLEANUP_INTERVAL == CLEANUP_INTERVAL - 1 {
            entries.retain(|e| e.is_valid());
        }
    }
}
