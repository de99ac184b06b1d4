//! Set of objects currently being accessed through a loader
//!
//! Each entry counts the operations inside a loader callback for that
//! object. The placement group uses the set to wait for in-flight access to
//! finish before tearing down.

use crate::object_context::ObjectContextRef;
use parking_lot::Mutex;
use shardio_common::ObjectId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<ObjectId, (ObjectContextRef, usize)>>,
    drained: Notify,
}

/// Objects with at least one operation inside a loader callback
#[derive(Clone, Default)]
pub struct AccessingSet {
    shared: Arc<Shared>,
}

impl AccessingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more accessor of `obc` until the guard drops
    pub fn enter(&self, obc: &ObjectContextRef) -> AccessingGuard {
        let oid = obc.get_oid().clone();
        self.shared
            .entries
            .lock()
            .entry(oid.clone())
            .or_insert_with(|| (Arc::clone(obc), 0))
            .1 += 1;
        AccessingGuard {
            shared: Arc::clone(&self.shared),
            oid,
        }
    }

    /// Number of objects being accessed
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.shared.entries.lock().contains_key(oid)
    }

    /// Accessor count of `oid`
    #[must_use]
    pub fn accessors(&self, oid: &ObjectId) -> usize {
        self.shared
            .entries
            .lock()
            .get(oid)
            .map_or(0, |(_, count)| *count)
    }

    /// Wait until no object is being accessed
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// One accessor of one object; leaves the set on drop
#[must_use = "access ends when the guard is dropped"]
pub struct AccessingGuard {
    shared: Arc<Shared>,
    oid: ObjectId,
}

impl Drop for AccessingGuard {
    fn drop(&mut self) {
        let mut entries = self.shared.entries.lock();
        let last = match entries.get_mut(&self.oid) {
            Some((_, count)) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if last {
            entries.remove(&self.oid);
            if entries.is_empty() {
                self.shared.drained.notify_waiters();
            }
        }
    }
}
