//! Per-object reader/writer lock
//!
//! Three modes: any number of `Read` holders, or a single `Write` holder,
//! or a single `Excl` holder. Requests are served in FIFO order; a request
//! that would be compatible with the current holders still queues when
//! somebody is already waiting, so a stream of readers cannot starve a
//! writer.
//!
//! A holder may promote its lock to `Excl`. The promotion request jumps to
//! the front of the queue, and is demoted back to the held mode when the
//! caller is done. Only one holder of a given object may be promoting at a
//! time; the loader guarantees this by promoting only on a cache miss.
//!
//! Waiting is cancellable: every wait races an abort future, and a wait
//! abandoned for any reason (abort, or the waiting future being dropped)
//! leaves no trace in the queue.

use parking_lot::Mutex;
use shardio_common::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;
use tracing::trace;

/// Strength of a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared with other readers
    Read,
    /// Mutating access that tolerates pipelined ordering; excludes all
    /// other holders
    Write,
    /// Fully exclusive access
    Excl,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Excl => write!(f, "excl"),
        }
    }
}

/// Observable state of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    None,
    Read(usize),
    Write,
    Excl,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Acquire(LockMode),
    /// Upgrade of a lock held in the given mode
    Promote(LockMode),
}

struct Waiter {
    id: u64,
    request: Request,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    readers: usize,
    /// `Write` or `Excl` when held exclusively
    exclusive: Option<LockMode>,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl Inner {
    fn state(&self) -> LockState {
        match self.exclusive {
            Some(LockMode::Excl) => LockState::Excl,
            Some(_) => LockState::Write,
            None if self.readers > 0 => LockState::Read(self.readers),
            None => LockState::None,
        }
    }

    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.exclusive.is_none(),
            LockMode::Write | LockMode::Excl => self.exclusive.is_none() && self.readers == 0,
        }
    }

    fn can_grant(&self, request: Request) -> bool {
        match request {
            Request::Acquire(mode) => self.compatible(mode),
            // The promoting reader is the last one left
            Request::Promote(LockMode::Read) => self.readers == 1 && self.exclusive.is_none(),
            Request::Promote(_) => true,
        }
    }

    fn grant(&mut self, request: Request) {
        match request {
            Request::Acquire(LockMode::Read) => self.readers += 1,
            Request::Acquire(mode) => self.exclusive = Some(mode),
            Request::Promote(LockMode::Read) => {
                self.readers -= 1;
                self.exclusive = Some(LockMode::Excl);
            }
            Request::Promote(_) => self.exclusive = Some(LockMode::Excl),
        }
    }

    fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => {
                assert!(self.readers > 0, "read unlock without readers");
                self.readers -= 1;
            }
            LockMode::Write | LockMode::Excl => {
                assert_eq!(self.exclusive, Some(mode), "{mode} unlock of {:?}", self.state());
                self.exclusive = None;
            }
        }
    }

    fn demote(&mut self, held: LockMode) {
        assert_eq!(self.exclusive, Some(LockMode::Excl), "demote without promotion");
        match held {
            LockMode::Read => {
                self.exclusive = None;
                self.readers += 1;
            }
            LockMode::Write => self.exclusive = Some(LockMode::Write),
            LockMode::Excl => {}
        }
    }

    /// Undo a grant whose waiter went away
    fn revoke(&mut self, request: Request) {
        match request {
            Request::Acquire(mode) => self.release(mode),
            Request::Promote(held) => self.demote(held),
        }
    }

    /// Hand the lock to queued waiters, in order, for as long as the
    /// queue head is compatible
    fn wake(&mut self) {
        while let Some(front) = self.waiters.front() {
            if !self.can_grant(front.request) {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.grant(waiter.request);
            trace!(request = ?waiter.request, state = ?self.state(), "lock handed to waiter");
            // A dropped receiver is revoked by its own cancel guard
            let _ = waiter.tx.send(());
        }
    }

    fn enqueue(&mut self, request: Request, front: bool) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { id, request, tx };
        if front {
            self.waiters.push_front(waiter);
        } else {
            self.waiters.push_back(waiter);
        }
        (id, rx)
    }
}

/// Reader/writer lock of one object context
#[derive(Default)]
pub struct ObcLock {
    inner: Mutex<Inner>,
}

/// Removes an abandoned waiter from the queue, or gives back a grant that
/// raced the abandonment
struct PendingWait<'a> {
    lock: &'a ObcLock,
    id: u64,
    request: Request,
    done: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut inner = self.lock.inner.lock();
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == self.id) {
            inner.waiters.remove(pos);
        } else {
            inner.revoke(self.request);
        }
        // The departed waiter may have been blocking the queue head
        inner.wake();
    }
}

impl ObcLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        self.inner.lock().state()
    }

    /// Number of queued requests
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Take the lock without waiting, if nobody is ahead and the current
    /// holders are compatible
    #[must_use]
    pub fn try_lock(&self, mode: LockMode) -> bool {
        let mut inner = self.inner.lock();
        if inner.waiters.is_empty() && inner.compatible(mode) {
            inner.grant(Request::Acquire(mode));
            true
        } else {
            false
        }
    }

    /// Take the lock in `mode`, waiting behind earlier requests.
    ///
    /// Fails with the error `abort` resolves to if it fires before the
    /// lock is granted.
    pub async fn lock<A>(&self, mode: LockMode, abort: A) -> Result<()>
    where
        A: Future<Output = Error>,
    {
        let request = Request::Acquire(mode);
        let (id, rx) = {
            let mut inner = self.inner.lock();
            if inner.waiters.is_empty() && inner.compatible(mode) {
                inner.grant(request);
                trace!(%mode, state = ?inner.state(), "lock granted");
                return Ok(());
            }
            trace!(%mode, state = ?inner.state(), "lock contended, queueing");
            inner.enqueue(request, false)
        };
        self.wait(id, request, rx, abort).await
    }

    /// Upgrade a lock held in `held` mode to `Excl`.
    ///
    /// From `Read` this waits for the other readers to leave; from `Write`
    /// it is immediate; from `Excl` it does nothing. Must be paired with
    /// [`ObcLock::demote`].
    pub async fn promote<A>(&self, held: LockMode, abort: A) -> Result<()>
    where
        A: Future<Output = Error>,
    {
        let request = Request::Promote(held);
        let (id, rx) = {
            let mut inner = self.inner.lock();
            if inner.can_grant(request) {
                inner.grant(request);
                trace!(%held, "lock promoted to excl");
                return Ok(());
            }
            trace!(%held, state = ?inner.state(), "promotion waiting for readers");
            inner.enqueue(request, true)
        };
        self.wait(id, request, rx, abort).await
    }

    /// Return a promoted lock to the mode it was held in before
    pub fn demote(&self, held: LockMode) {
        let mut inner = self.inner.lock();
        inner.demote(held);
        trace!(%held, state = ?inner.state(), "lock demoted");
        inner.wake();
    }

    pub fn unlock(&self, mode: LockMode) {
        let mut inner = self.inner.lock();
        inner.release(mode);
        trace!(%mode, state = ?inner.state(), "lock released");
        inner.wake();
    }

    async fn wait<A>(
        &self,
        id: u64,
        request: Request,
        rx: oneshot::Receiver<()>,
        abort: A,
    ) -> Result<()>
    where
        A: Future<Output = Error>,
    {
        let mut pending = PendingWait {
            lock: self,
            id,
            request,
            done: false,
        };
        tokio::select! {
            biased;
            granted = rx => match granted {
                Ok(()) => {
                    pending.done = true;
                    Ok(())
                }
                Err(_) => Err(Error::internal("lock waiter dropped without grant")),
            },
            err = abort => Err(err),
        }
    }
}
