//! append/remove-under-lock registry shared by the endpoint and acceptor
//! (§5 "Shared state": "the registry lists inside the Endpoint and Acceptor
//! are append/remove under their own lock; iteration for shutdown snapshots
//! first")
//!
//! generic over what it tracks (`Connection` or `Acceptor`) so both owners
//! and a tracked `Connection` itself (for `list_connections`, §6) can share
//! one implementation instead of three ad hoc `Mutex<Vec<Weak<_>>>` copies.

use std::sync::{Arc, Mutex, Weak};

pub(crate) struct Registry<T> {
    items: Mutex<Vec<Weak<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Registry<T> {
    /// register `item`, opportunistically dropping entries whose owner is
    /// already gone rather than growing unbounded between snapshots
    pub(crate) fn push(&self, item: &Arc<T>) {
        let mut guard = self.items.lock().unwrap();
        guard.retain(|weak| weak.upgrade().is_some());
        guard.push(Arc::downgrade(item));
    }

    /// remove `item`'s entry explicitly, so it stops appearing in
    /// [`Registry::snapshot`] as soon as its owner calls this rather than
    /// only once every `Arc<T>` handle the application is holding has been
    /// dropped (I6: "exits the registry when its reader loop returns")
    pub(crate) fn remove(&self, item: &Arc<T>) {
        let mut guard = self.items.lock().unwrap();
        guard.retain(|weak| match weak.upgrade() {
            Some(strong) => !Arc::ptr_eq(&strong, item),
            None => false,
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
