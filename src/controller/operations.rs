//! In-flight operation tracking.
//!
//! Guarantees at most one concurrent provision or delete per object key, and
//! lets shutdown (and the tests) wait for all in-flight work to drain.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;

/// The kind of work being performed on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Provision,
    Delete,
}

/// Set of active `(operation, object key)` pairs.
#[derive(Default)]
pub struct OperationRegistry {
    active: DashMap<(Operation, String), ()>,
    quiesced: Notify,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the key. Returns false if an operation with this key is already
    /// in flight, in which case the caller must skip the work.
    pub fn start(&self, operation: Operation, key: &str) -> bool {
        match self.active.entry((operation, key.to_string())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(());
                true
            }
        }
    }

    /// Release the key. Must be paired with a successful [`start`].
    ///
    /// [`start`]: OperationRegistry::start
    pub fn finish(&self, operation: Operation, key: &str) {
        self.active.remove(&(operation, key.to_string()));
        if self.active.is_empty() {
            self.quiesced.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Block until no operation is in flight.
    pub async fn wait(&self) {
        loop {
            let notified = self.quiesced.notified();
            if self.active.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
