//! Object context registry
//!
//! Bounded cache of object contexts shared by every placement group on a
//! shard. Entries are ordered by a logical clock; once the cache grows past
//! its target size the least recently used slots are dropped.
//!
//! Dropping a slot only drops the cache's own reference. A context still
//! held by an in-flight operation (or by a clone's head link) stays
//! reachable through a weak index, so a second lookup finds the same
//! context instead of creating a duplicate. The context is freed once both
//! the slot and every holder are gone.

use crate::object_context::{ObjectContext, ObjectContextRef};
use parking_lot::Mutex;
use shardio_common::config::OBC_LRU_SIZE;
use shardio_common::{Config, ConfigObserver, ConfigProxy, ObjectId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Registry statistics for monitoring
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Lookups that found an existing context
    pub hits: AtomicU64,
    /// Lookups that created a new context
    pub misses: AtomicU64,
    /// Cache slots dropped to respect the target size
    pub evictions: AtomicU64,
}

impl RegistryStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

struct Slot {
    obc: ObjectContextRef,
    last_access: u64,
}

#[derive(Default)]
struct RegistryInner {
    /// Cache slots holding a strong reference
    slots: HashMap<ObjectId, Slot>,
    /// last_access -> id, oldest first
    order: BTreeMap<u64, ObjectId>,
    /// Every context created and not yet freed
    index: HashMap<ObjectId, Weak<ObjectContext>>,
    /// Logical clock for LRU ordering
    clock: u64,
    target_size: usize,
}

impl RegistryInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, oid: &ObjectId) -> Option<ObjectContextRef> {
        let now = self.tick();
        let slot = self.slots.get_mut(oid)?;
        self.order.remove(&slot.last_access);
        slot.last_access = now;
        self.order.insert(now, oid.clone());
        Some(Arc::clone(&slot.obc))
    }

    fn insert_slot(&mut self, oid: ObjectId, obc: ObjectContextRef) {
        let now = self.tick();
        self.order.insert(now, oid.clone());
        self.slots.insert(
            oid,
            Slot {
                obc,
                last_access: now,
            },
        );
    }

    /// Drop the oldest slots until at most `target_size` remain; returns
    /// how many were dropped
    fn trim(&mut self) -> u64 {
        let mut evicted = 0;
        while self.slots.len() > self.target_size {
            let Some((_, oid)) = self.order.pop_first() else {
                break;
            };
            if self.slots.remove(&oid).is_some() {
                evicted += 1;
            }
            if self
                .index
                .get(&oid)
                .is_some_and(|weak| weak.strong_count() == 0)
            {
                self.index.remove(&oid);
            }
        }
        // Contexts freed by their last holder since the previous sweep
        if self.index.len() > 2 * self.slots.len() + 64 {
            self.index.retain(|_, weak| weak.strong_count() > 0);
        }
        evicted
    }

    fn remove(&mut self, oid: &ObjectId) {
        if let Some(slot) = self.slots.remove(oid) {
            self.order.remove(&slot.last_access);
        }
        self.index.remove(oid);
    }
}

/// Cache of object contexts for one shard
pub struct ObjectContextRegistry {
    inner: Mutex<RegistryInner>,
    stats: RegistryStats,
}

impl ObjectContextRegistry {
    /// Create a registry sized by `crimson_osd_obc_lru_size` that follows
    /// later changes of that option
    pub fn new(conf: &ConfigProxy) -> Arc<Self> {
        let registry = Arc::new(Self::with_target_size(
            conf.get().obc.crimson_osd_obc_lru_size,
        ));
        conf.add_observer(Arc::downgrade(&registry) as Weak<dyn ConfigObserver>);
        registry
    }

    /// Create a registry with a fixed target size and no config tracking
    #[must_use]
    pub fn with_target_size(target_size: u64) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                target_size: clamp_size(target_size),
                ..RegistryInner::default()
            }),
            stats: RegistryStats::default(),
        }
    }

    /// Return the context for `oid`, creating an empty one if none exists.
    ///
    /// `existed` is false for exactly one caller per created context: the
    /// caller that must load it.
    pub fn get_or_create(&self, oid: ObjectId) -> (ObjectContextRef, bool) {
        let mut inner = self.inner.lock();

        if let Some(obc) = inner.touch(&oid) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return (obc, true);
        }

        if let Some(obc) = inner.index.get(&oid).and_then(Weak::upgrade) {
            // Evicted from the cache but still in use somewhere
            inner.insert_slot(oid, Arc::clone(&obc));
            let evicted = inner.trim();
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return (obc, true);
        }

        let obc = ObjectContext::new(oid.clone());
        inner.index.insert(oid.clone(), Arc::downgrade(&obc));
        inner.insert_slot(oid, Arc::clone(&obc));
        let evicted = inner.trim();
        self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        (obc, false)
    }

    /// Find a live context without creating one or touching its recency
    #[must_use]
    pub fn lookup(&self, oid: &ObjectId) -> Option<ObjectContextRef> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(oid)
            .map(|slot| Arc::clone(&slot.obc))
            .or_else(|| inner.index.get(oid).and_then(Weak::upgrade))
    }

    /// Whether `oid` currently occupies a cache slot
    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.inner.lock().slots.contains_key(oid)
    }

    /// Forget `obc` if it is still the context registered for its id.
    ///
    /// Used to drop a placeholder whose load failed, so the next caller
    /// loads afresh.
    pub fn invalidate(&self, obc: &ObjectContextRef) -> bool {
        let mut inner = self.inner.lock();
        let oid = obc.get_oid();
        let registered = inner
            .slots
            .get(oid)
            .map(|slot| Arc::clone(&slot.obc))
            .or_else(|| inner.index.get(oid).and_then(Weak::upgrade));
        match registered {
            Some(current) if Arc::ptr_eq(&current, obc) => {
                inner.remove(oid);
                debug!("invalidated {}", oid);
                true
            }
            _ => false,
        }
    }

    /// Adjust the number of cache slots, dropping the oldest as needed.
    /// A size of zero empties the cache.
    pub fn set_target_size(&self, target_size: u64) {
        let mut inner = self.inner.lock();
        inner.target_size = clamp_size(target_size);
        let evicted = inner.trim();
        self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        info!(
            "object context registry target size {} ({} cached, {} evicted)",
            inner.target_size,
            inner.slots.len(),
            evicted
        );
    }

    #[must_use]
    pub fn target_size(&self) -> usize {
        self.inner.lock().target_size
    }

    /// Number of occupied cache slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of contexts alive, cached or not
    #[must_use]
    pub fn live(&self) -> usize {
        self.inner
            .lock()
            .index
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Drop every cache slot
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.order.clear();
        inner.index.retain(|_, weak| weak.strong_count() > 0);
    }

    #[must_use]
    pub const fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

impl ConfigObserver for ObjectContextRegistry {
    fn tracked_keys(&self) -> &'static [&'static str] {
        &[OBC_LRU_SIZE]
    }

    fn handle_conf_change(&self, conf: &Config, _changed: &BTreeSet<&'static str>) {
        self.set_target_size(conf.obc.crimson_osd_obc_lru_size);
    }
}

impl Drop for ObjectContextRegistry {
    fn drop(&mut self) {
        // Release every slot so nothing outlives the shard
        let inner = self.inner.get_mut();
        inner.target_size = 0;
        inner.trim();
    }
}

fn clamp_size(size: u64) -> usize {
    usize::try_from(size).unwrap_or(usize::MAX)
}
