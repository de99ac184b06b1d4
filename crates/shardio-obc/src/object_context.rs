//! Object contexts
//!
//! An [`ObjectContext`] is the in-memory record of one head or clone: its
//! object state, the snapset context (heads only), a reference to the head
//! (clones only) and the per-object lock. Contexts are created empty by the
//! registry and populated by the loader while it holds the lock promoted to
//! exclusive.
//!
//! A clone keeps its head alive through a strong reference. Heads never
//! point at their clones, so no reference cycle can form.

use crate::lock::{LockMode, LockState, ObcLock};
use parking_lot::RwLock;
use shardio_common::{Error, ObjectId, ObjectState, Result, SnapSet, SnapSetContextRef};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub type ObjectContextRef = Arc<ObjectContext>;

struct ObcInner {
    obs: ObjectState,
    ssc: Option<SnapSetContextRef>,
    head: Option<ObjectContextRef>,
    loaded: bool,
}

pub struct ObjectContext {
    oid: ObjectId,
    inner: RwLock<ObcInner>,
    lock: ObcLock,
}

impl ObjectContext {
    /// Create an empty, unpopulated context
    #[must_use]
    pub fn new(oid: ObjectId) -> ObjectContextRef {
        Arc::new(Self {
            inner: RwLock::new(ObcInner {
                obs: ObjectState::absent(oid.clone()),
                ssc: None,
                head: None,
                loaded: false,
            }),
            oid,
            lock: ObcLock::new(),
        })
    }

    #[must_use]
    pub const fn get_oid(&self) -> &ObjectId {
        &self.oid
    }

    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.oid.is_head()
    }

    /// Whether metadata has been installed by a load
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner.read().loaded
    }

    #[must_use]
    pub fn obs(&self) -> ObjectState {
        self.inner.read().obs.clone()
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.inner.read().obs.exists
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.read().obs.oi.size
    }

    /// Snapset context of a loaded head
    #[must_use]
    pub fn ssc(&self) -> Option<SnapSetContextRef> {
        self.inner.read().ssc.clone()
    }

    /// Read-only view of a loaded head's snapset
    pub fn snapset(&self) -> Result<SnapSet> {
        self.inner
            .read()
            .ssc
            .as_ref()
            .map(|ssc| ssc.snapset.clone())
            .ok_or_else(|| Error::corrupted(format!("{} has no snapset context", self.oid)))
    }

    /// Head context of a clone
    #[must_use]
    pub fn head_obc(&self) -> Option<ObjectContextRef> {
        self.inner.read().head.clone()
    }

    /// Link a clone to its head
    pub fn set_head_obc(&self, head: ObjectContextRef) {
        assert!(!self.is_head(), "{} is a head and has no head", self.oid);
        assert!(head.is_head(), "{} is not a head", head.oid);
        self.inner.write().head = Some(head);
    }

    pub fn set_head_state(&self, obs: ObjectState, ssc: SnapSetContextRef) {
        let mut inner = self.inner.write();
        inner.obs = obs;
        inner.ssc = Some(ssc);
        inner.loaded = true;
    }

    pub fn set_clone_state(&self, obs: ObjectState) {
        let mut inner = self.inner.write();
        inner.obs = obs;
        inner.loaded = true;
    }

    #[must_use]
    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    /// Number of lock requests queued on this context
    #[must_use]
    pub fn lock_waiters(&self) -> usize {
        self.lock.waiters()
    }

    /// Lock this context in `mode`, giving up with whatever `abort`
    /// resolves to if it fires first
    pub async fn lock<A>(self: &Arc<Self>, mode: LockMode, abort: A) -> Result<ObcLockGuard>
    where
        A: Future<Output = Error>,
    {
        self.lock.lock(mode, abort).await?;
        Ok(ObcLockGuard {
            obc: Arc::clone(self),
            mode,
        })
    }
}

impl fmt::Debug for ObjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ObjectContext")
            .field("oid", &self.oid)
            .field("exists", &inner.obs.exists)
            .field("loaded", &inner.loaded)
            .field("lock", &self.lock.state())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ObjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obc({})", self.oid)
    }
}

/// A held object context lock; released on drop
#[must_use = "the lock is released when the guard is dropped"]
pub struct ObcLockGuard {
    obc: ObjectContextRef,
    mode: LockMode,
}

impl ObcLockGuard {
    #[must_use]
    pub const fn obc(&self) -> &ObjectContextRef {
        &self.obc
    }

    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Temporarily hold the lock as `Excl`; the returned guard demotes it
    /// back to this guard's mode when dropped
    pub async fn promote<A>(&self, abort: A) -> Result<PromotedGuard<'_>>
    where
        A: Future<Output = Error>,
    {
        self.obc.lock.promote(self.mode, abort).await?;
        Ok(PromotedGuard { guard: self })
    }
}

impl Drop for ObcLockGuard {
    fn drop(&mut self) {
        self.obc.lock.unlock(self.mode);
    }
}

/// An object context lock temporarily promoted to `Excl`
#[must_use = "the promotion ends when the guard is dropped"]
pub struct PromotedGuard<'a> {
    guard: &'a ObcLockGuard,
}

impl Drop for PromotedGuard<'_> {
    fn drop(&mut self) {
        self.guard.obc.lock.demote(self.guard.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardio_common::{ObjectInfo, SnapId, SnapSetContext};
    use std::future::pending;

    fn never() -> impl Future<Output = Error> {
        pending()
    }

    #[test]
    fn test_new_context_is_empty() {
        let obc = ObjectContext::new(ObjectId::head_of(1, "obj"));
        assert!(obc.is_head());
        assert!(!obc.is_loaded());
        assert!(!obc.exists());
        assert!(obc.ssc().is_none());
        assert!(matches!(obc.snapset(), Err(Error::ObjectCorrupted(_))));
        assert_eq!(obc.lock_state(), LockState::None);
    }

    #[test]
    fn test_set_head_state() {
        let oid = ObjectId::head_of(1, "obj");
        let obc = ObjectContext::new(oid.clone());
        let mut oi = ObjectInfo::new(oid.clone());
        oi.size = 4096;
        obc.set_head_state(
            ObjectState::new(oi, true),
            Arc::new(SnapSetContext::empty(oid)),
        );
        assert!(obc.is_loaded());
        assert!(obc.exists());
        assert_eq!(obc.size(), 4096);
        assert!(obc.snapset().unwrap().clones.is_empty());
    }

    #[test]
    fn test_clone_keeps_head_alive() {
        let head_oid = ObjectId::head_of(1, "obj");
        let head = ObjectContext::new(head_oid.clone());
        let clone = ObjectContext::new(head_oid.with_snap(SnapId::new(4)));

        clone.set_head_obc(Arc::clone(&head));
        let weak = Arc::downgrade(&head);
        drop(head);
        assert!(weak.upgrade().is_some());

        drop(clone);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    #[should_panic(expected = "is a head")]
    fn test_head_cannot_have_head() {
        let head = ObjectContext::new(ObjectId::head_of(1, "obj"));
        head.set_head_obc(Arc::clone(&head));
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let obc = ObjectContext::new(ObjectId::head_of(1, "obj"));
        let guard = obc.lock(LockMode::Write, never()).await.unwrap();
        assert_eq!(obc.lock_state(), LockState::Write);
        assert_eq!(guard.mode(), LockMode::Write);
        drop(guard);
        assert_eq!(obc.lock_state(), LockState::None);
    }

    #[tokio::test]
    async fn test_promoted_guard_demotes() {
        let obc = ObjectContext::new(ObjectId::head_of(1, "obj"));
        let guard = obc.lock(LockMode::Read, never()).await.unwrap();
        {
            let _promoted = guard.promote(never()).await.unwrap();
            assert_eq!(obc.lock_state(), LockState::Excl);
        }
        assert_eq!(obc.lock_state(), LockState::Read(1));
    }
}
