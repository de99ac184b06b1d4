//! Object context loader
//!
//! The loader is how an operation gets hold of an object: it finds or
//! creates the object context in the registry, takes the lock the
//! operation needs, loads metadata on a cache miss and then runs the
//! operation's callback. The lock is released when the callback's future
//! completes, successfully or not.
//!
//! Clones are always reached through their head. The head is read-locked
//! first and its snapset decides which clone object serves the request, so
//! a clone operation cannot race a snapshot trim of its head.
//!
//! Exactly one caller loads a given object: the one for which
//! `get_or_create` reported a miss. It takes its lock and promotes it to
//! `Excl` before the first suspension point, so every other caller queues
//! behind the load and finds a populated context once it gets the lock.

use crate::accessing::AccessingSet;
use crate::backend::PgBackend;
use crate::interrupt::{InterruptCondition, stopped};
use crate::lock::LockMode;
use crate::object_context::{ObcLockGuard, ObjectContext, ObjectContextRef};
use crate::registry::ObjectContextRegistry;
use shardio_common::{Error, ObjectId, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The parts of an operation the loader looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpInfo {
    pub may_read: bool,
    pub may_write: bool,
    /// Must be ordered against reads of the same object
    pub rwordered: bool,
}

impl OpInfo {
    /// Plain read
    #[must_use]
    pub const fn read() -> Self {
        Self {
            may_read: true,
            may_write: false,
            rwordered: false,
        }
    }

    /// Blind write
    #[must_use]
    pub const fn write() -> Self {
        Self {
            may_read: false,
            may_write: true,
            rwordered: true,
        }
    }

    /// Write that depends on what it reads
    #[must_use]
    pub const fn read_modify_write() -> Self {
        Self {
            may_read: true,
            may_write: true,
            rwordered: true,
        }
    }
}

/// Loader of one placement group
pub struct ObjectContextLoader {
    registry: Arc<ObjectContextRegistry>,
    backend: Arc<dyn PgBackend>,
    interrupt: InterruptCondition,
    stopping: watch::Sender<bool>,
    accessing: AccessingSet,
}

impl ObjectContextLoader {
    #[must_use]
    pub fn new(
        registry: Arc<ObjectContextRegistry>,
        backend: Arc<dyn PgBackend>,
        interrupt: InterruptCondition,
    ) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            registry,
            backend,
            interrupt,
            stopping,
            accessing: AccessingSet::new(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ObjectContextRegistry> {
        &self.registry
    }

    /// Heads with an operation currently inside a callback
    #[must_use]
    pub const fn accessing(&self) -> &AccessingSet {
        &self.accessing
    }

    /// Refuse new work and fail every wait in progress with
    /// `SystemShutdown`. Callbacks already running are left to finish.
    pub fn stop(&self) {
        self.stopping.send_replace(true);
        info!(
            "object context loader stopping, {} objects being accessed",
            self.accessing.len()
        );
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Normalize an id: the snapdir stands for its head
    #[must_use]
    pub fn get_oid(oid: &ObjectId) -> ObjectId {
        if oid.is_snapdir() {
            oid.head()
        } else {
            oid.clone()
        }
    }

    /// Lock strength an operation needs
    ///
    /// # Panics
    ///
    /// If the operation neither reads nor is ordered against reads.
    #[must_use]
    pub fn get_lock_type(op_info: OpInfo) -> LockMode {
        if op_info.rwordered && op_info.may_read {
            LockMode::Excl
        } else if op_info.rwordered {
            LockMode::Write
        } else {
            assert!(
                op_info.may_read,
                "operation neither reads nor is rw-ordered: {op_info:?}"
            );
            LockMode::Read
        }
    }

    /// Run `f` on the context of `oid`, loaded and locked as `op_info`
    /// requires
    pub async fn with_locked_obc<T, F, Fut>(
        &self,
        oid: &ObjectId,
        op_info: OpInfo,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ObjectContextRef) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_entry()?;
        let oid = Self::get_oid(oid);
        let mode = Self::get_lock_type(op_info);
        debug!("with_locked_obc {} {}", oid, mode);
        if oid.is_head() {
            self.with_head_obc(&oid, mode, f).await
        } else {
            self.with_clone_obc(&oid, mode, f).await
        }
    }

    /// Run `f` on the head `oid` locked in `mode`
    ///
    /// # Panics
    ///
    /// If `oid` is not a head.
    pub async fn with_head_obc<T, F, Fut>(&self, oid: &ObjectId, mode: LockMode, f: F) -> Result<T>
    where
        F: FnOnce(ObjectContextRef) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        assert!(oid.is_head(), "{oid} is not a head");
        self.check_entry()?;
        loop {
            let (obc, existed) = self.registry.get_or_create(oid.clone());
            let _accessing = self.accessing.enter(&obc);
            let guard = obc.lock(mode, self.abort_signal()).await?;
            if !self.ensure_loaded(&guard, existed).await? {
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }
            return f(obc).await;
        }
    }

    async fn with_clone_obc<T, F, Fut>(&self, oid: &ObjectId, mode: LockMode, f: F) -> Result<T>
    where
        F: FnOnce(ObjectContextRef) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        assert!(!oid.is_head(), "{oid} is a head");
        self.with_head_obc(&oid.head(), LockMode::Read, |head| async move {
            if !head.exists() {
                error!("clone {} requested but its head does not exist", oid);
                return Err(Error::corrupted(format!(
                    "clone {oid} has no head {}",
                    head.get_oid()
                )));
            }
            let snapset = head.snapset()?;
            let Some(resolved) = self.backend.resolve_oid(&snapset, oid) else {
                error!("{} not found in snapset {}", oid, snapset);
                return Err(Error::not_found(oid));
            };
            if resolved.is_head() {
                // Read at a snap newer than the last write: the head serves it
                if mode != LockMode::Read {
                    return Err(Error::invalid_argument(format!(
                        "{oid} resolves to the head and snapshots are read-only"
                    )));
                }
                return f(head).await;
            }
            self.with_resolved_clone(&resolved, mode, head, f).await
        })
        .await
    }

    async fn with_resolved_clone<T, F, Fut>(
        &self,
        oid: &ObjectId,
        mode: LockMode,
        head: ObjectContextRef,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ObjectContextRef) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let (obc, existed) = self.registry.get_or_create(oid.clone());
            let guard = obc.lock(mode, self.abort_signal()).await?;
            obc.set_head_obc(Arc::clone(&head));
            if !self.ensure_loaded(&guard, existed).await? {
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }
            return f(obc).await;
        }
    }

    /// Run `f` on a context that was loaded earlier, locking it again in
    /// `mode`. A clone's head is read-locked first.
    pub async fn with_locked_existing_obc<T, F, Fut>(
        &self,
        obc: &ObjectContextRef,
        mode: LockMode,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ObjectContextRef) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_entry()?;
        if !obc.is_loaded() {
            return Err(Error::invalid_argument(format!("{obc} has not been loaded")));
        }
        if obc.is_head() {
            let _accessing = self.accessing.enter(obc);
            let _guard = obc.lock(mode, self.abort_signal()).await?;
            return f(Arc::clone(obc)).await;
        }

        let head = obc
            .head_obc()
            .ok_or_else(|| Error::internal(format!("{obc} is not linked to its head")))?;
        let _accessing = self.accessing.enter(&head);
        let _head_guard = head.lock(LockMode::Read, self.abort_signal()).await?;
        let _guard = obc.lock(mode, self.abort_signal()).await?;
        f(Arc::clone(obc)).await
    }

    /// Load metadata into a freshly created context
    pub async fn load_obc(&self, obc: &ObjectContextRef) -> Result<ObjectContextRef> {
        self.fetch_into(obc).await?;
        Ok(Arc::clone(obc))
    }

    /// Re-read the metadata of a head in place. The caller must hold its
    /// lock.
    ///
    /// # Panics
    ///
    /// If `obc` is not a head.
    pub async fn reload_obc(&self, obc: &ObjectContext) -> Result<()> {
        assert!(obc.is_head(), "{obc} is not a head");
        self.fetch_into(obc).await
    }

    /// Make sure the locked context is populated.
    ///
    /// Returns false when the context was found unpopulated: its loader
    /// failed and dropped it from the registry, so the caller has to start
    /// over with a fresh one.
    async fn ensure_loaded(&self, guard: &ObcLockGuard, existed: bool) -> Result<bool> {
        let obc = guard.obc();
        if existed {
            if obc.is_loaded() {
                debug!("{} cache hit", obc.get_oid());
                return Ok(true);
            }
            debug!("{} found unpopulated, retrying", obc.get_oid());
            return Ok(false);
        }

        debug!("{} cache miss, loading", obc.get_oid());
        let _promoted = guard.promote(self.abort_signal()).await?;
        match self.load_obc(obc).await {
            Ok(_) => Ok(true),
            Err(err) => {
                debug!("{} load failed: {}", obc.get_oid(), err);
                self.registry.invalidate(obc);
                Err(err)
            }
        }
    }

    async fn fetch_into(&self, obc: &ObjectContext) -> Result<()> {
        let oid = obc.get_oid();
        let md = tokio::select! {
            biased;
            err = self.abort_signal() => return Err(err),
            md = self.backend.load_metadata(oid) => md?,
        };

        if md.os.oi.soid.is_head() {
            let Some(ssc) = md.ssc else {
                error!("head {} loaded without a snapset context", oid);
                return Err(Error::corrupted(format!("head {oid} has no snapset context")));
            };
            if let Err(err) = ssc.snapset.validate() {
                error!("head {} has a malformed snapset: {}", oid, err);
                return Err(err);
            }
            obc.set_head_state(md.os, ssc);
        } else {
            obc.set_clone_state(md.os);
        }
        debug!("loaded {} exists={}", oid, obc.exists());
        Ok(())
    }

    fn check_entry(&self) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::SystemShutdown);
        }
        self.interrupt.check()
    }

    /// Resolves when the loader stops or the placement group interrupts
    fn abort_signal(&self) -> impl Future<Output = Error> + use<> {
        let stopping = self.stopping.subscribe();
        let interrupt = self.interrupt.clone();
        async move {
            tokio::select! {
                err = stopped(stopping) => err,
                err = interrupt.interrupted() => err,
            }
        }
    }
}
