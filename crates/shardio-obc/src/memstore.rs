//! In-memory metadata backend
//!
//! Keeps object info and snapsets in a map. Used by tests and the bench
//! tool; supports an artificial load latency and injected load failures so
//! that the loader's suspension and error paths can be exercised.

use crate::backend::{LoadedMetadata, PgBackend};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shardio_common::{
    Error, Eversion, ObjectId, ObjectInfo, ObjectState, Result, SnapSet, SnapSetContext,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
struct MemObject {
    oi: ObjectInfo,
    /// Heads only; `None` on a head means its snapset is unreadable
    snapset: Option<SnapSet>,
}

/// In-memory [`PgBackend`]
#[derive(Default)]
pub struct MemBackend {
    objects: RwLock<BTreeMap<ObjectId, MemObject>>,
    latency: RwLock<Duration>,
    /// Remaining injected failures per object
    failures: Mutex<HashMap<ObjectId, usize>>,
    loads: Mutex<HashMap<ObjectId, u64>>,
    total_loads: AtomicU64,
    next_version: AtomicU64,
}

impl MemBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend whose loads take `latency`
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        let backend = Self::new();
        *backend.latency.write() = latency;
        backend
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    fn next_version(&self) -> Eversion {
        Eversion::new(1, self.next_version.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn object_info(&self, oid: &ObjectId, size: u64) -> ObjectInfo {
        let version = self.next_version();
        ObjectInfo {
            soid: oid.clone(),
            size,
            version,
            prior_version: Eversion::default(),
            user_version: version.version,
        }
    }

    /// Store a head object with its snapset
    pub fn put_head(&self, oid: &ObjectId, size: u64, snapset: SnapSet) {
        assert!(oid.is_head(), "{oid} is not a head");
        let oi = self.object_info(oid, size);
        self.objects.write().insert(
            oid.clone(),
            MemObject {
                oi,
                snapset: Some(snapset),
            },
        );
    }

    /// Store a clone object
    pub fn put_clone(&self, oid: &ObjectId, size: u64) {
        assert!(!oid.is_head() && !oid.is_snapdir(), "{oid} is not a clone");
        let oi = self.object_info(oid, size);
        self.objects
            .write()
            .insert(oid.clone(), MemObject { oi, snapset: None });
    }

    /// Store a head whose snapset cannot be read
    pub fn put_corrupted_head(&self, oid: &ObjectId, size: u64) {
        assert!(oid.is_head(), "{oid} is not a head");
        let oi = self.object_info(oid, size);
        self.objects
            .write()
            .insert(oid.clone(), MemObject { oi, snapset: None });
    }

    pub fn remove(&self, oid: &ObjectId) -> bool {
        self.objects.write().remove(oid).is_some()
    }

    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.objects.read().contains_key(oid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `count` loads of `oid` fail with a backend error
    pub fn fail_next(&self, oid: &ObjectId, count: usize) {
        self.failures.lock().insert(oid.clone(), count);
    }

    /// Number of metadata loads issued for `oid`
    #[must_use]
    pub fn load_count(&self, oid: &ObjectId) -> u64 {
        self.loads.lock().get(oid).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_loads(&self) -> u64 {
        self.total_loads.load(Ordering::Relaxed)
    }

    fn take_failure(&self, oid: &ObjectId) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(oid) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                if *remaining == 0 {
                    failures.remove(oid);
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PgBackend for MemBackend {
    async fn load_metadata(&self, oid: &ObjectId) -> Result<LoadedMetadata> {
        *self.loads.lock().entry(oid.clone()).or_insert(0) += 1;
        self.total_loads.fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.take_failure(oid) {
            return Err(Error::backend(format!("injected load failure for {oid}")));
        }

        let object = self.objects.read().get(oid).cloned();
        trace!("load_metadata {} found={}", oid, object.is_some());

        if oid.is_head() {
            let Some(object) = object else {
                return Ok(LoadedMetadata::for_head(
                    ObjectState::absent(oid.clone()),
                    Arc::new(SnapSetContext::empty(oid.clone())),
                ));
            };
            let os = ObjectState::new(object.oi, true);
            return Ok(match object.snapset {
                Some(snapset) => LoadedMetadata::for_head(
                    os,
                    Arc::new(SnapSetContext::new(oid.clone(), snapset, true)),
                ),
                None => LoadedMetadata { os, ssc: None },
            });
        }

        object
            .map(|object| LoadedMetadata::for_clone(ObjectState::new(object.oi, true)))
            .ok_or_else(|| Error::not_found(oid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardio_common::{IntervalSet, SnapId};

    fn head() -> ObjectId {
        ObjectId::head_of(1, "obj")
    }

    #[tokio::test]
    async fn test_load_head() {
        let backend = MemBackend::new();
        let mut snapset = SnapSet::new(SnapId::new(4));
        snapset
            .add_clone(SnapId::new(4), 100, IntervalSet::new(), vec![SnapId::new(4)])
            .unwrap();
        backend.put_head(&head(), 4096, snapset);

        let md = backend.load_metadata(&head()).await.unwrap();
        assert!(md.os.exists);
        assert_eq!(md.os.oi.size, 4096);
        let ssc = md.ssc.unwrap();
        assert_eq!(ssc.snapset.clones, vec![SnapId::new(4)]);
        assert_eq!(backend.load_count(&head()), 1);
    }

    #[tokio::test]
    async fn test_absent_head_loads_as_nonexistent() {
        let backend = MemBackend::new();
        let md = backend.load_metadata(&head()).await.unwrap();
        assert!(!md.os.exists);
        assert!(md.ssc.unwrap().snapset.clones.is_empty());
    }

    #[tokio::test]
    async fn test_absent_clone_is_not_found() {
        let backend = MemBackend::new();
        let err = backend
            .load_metadata(&head().with_snap(SnapId::new(4)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_corrupted_head_has_no_snapset() {
        let backend = MemBackend::new();
        backend.put_corrupted_head(&head(), 10);
        let md = backend.load_metadata(&head()).await.unwrap();
        assert!(md.os.exists);
        assert!(md.ssc.is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemBackend::new();
        backend.put_head(&head(), 1, SnapSet::default());
        backend.fail_next(&head(), 2);

        assert!(matches!(
            backend.load_metadata(&head()).await,
            Err(Error::Backend(_))
        ));
        assert!(backend.load_metadata(&head()).await.is_err());
        assert!(backend.load_metadata(&head()).await.is_ok());
        assert_eq!(backend.load_count(&head()), 3);
        assert_eq!(backend.total_loads(), 3);
    }

    #[test]
    fn test_versions_increase() {
        let backend = MemBackend::new();
        let a = backend.object_info(&head(), 1).version;
        let b = backend.object_info(&head(), 1).version;
        assert!(b > a);
    }
}
