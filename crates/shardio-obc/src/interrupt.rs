//! Interruption of suspended waits
//!
//! The placement group owning a loader can interrupt every wait the loader
//! is suspended in (lock queues, metadata loads), for example when peering
//! starts a new interval. The PG keeps the [`Interrupter`]; the loader
//! keeps the matching [`InterruptCondition`].

use shardio_common::{Error, InterruptReason, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Sending half, owned by the placement group
#[derive(Clone)]
pub struct Interrupter {
    tx: Arc<watch::Sender<Option<InterruptReason>>>,
}

/// Receiving half, checked at every suspension point
#[derive(Clone)]
pub struct InterruptCondition {
    rx: watch::Receiver<Option<InterruptReason>>,
}

impl Interrupter {
    #[must_use]
    pub fn channel() -> (Self, InterruptCondition) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, InterruptCondition { rx })
    }

    /// Interrupt every current and future wait
    pub fn interrupt(&self, reason: InterruptReason) {
        self.tx.send_replace(Some(reason));
    }

    /// Clear the interruption, e.g. once the new interval is active
    pub fn reset(&self) {
        self.tx.send_replace(None);
    }
}

impl InterruptCondition {
    /// A condition that never fires
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    /// Fail if currently interrupted
    pub fn check(&self) -> Result<()> {
        match *self.rx.borrow() {
            Some(reason) => Err(Error::Interrupted(reason)),
            None => Ok(()),
        }
    }

    /// Resolve once interrupted; never resolves if the interrupter is gone
    pub async fn interrupted(mut self) -> Error {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return Error::Interrupted(reason);
            }
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Resolve with `SystemShutdown` once `stopping` turns true
pub(crate) async fn stopped(mut stopping: watch::Receiver<bool>) -> Error {
    loop {
        if *stopping.borrow_and_update() {
            return Error::SystemShutdown;
        }
        if stopping.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_check_reflects_state() {
        let (interrupter, cond) = Interrupter::channel();
        assert!(cond.check().is_ok());

        interrupter.interrupt(InterruptReason::IntervalChanged { epoch: 3 });
        assert!(matches!(
            cond.check(),
            Err(Error::Interrupted(InterruptReason::IntervalChanged { epoch: 3 }))
        ));

        interrupter.reset();
        assert!(cond.check().is_ok());
    }

    #[tokio::test]
    async fn test_interrupted_wakes_waiter() {
        let (interrupter, cond) = Interrupter::channel();
        let waiter = tokio::spawn(cond.interrupted());
        tokio::task::yield_now().await;

        interrupter.interrupt(InterruptReason::PgStopping);
        let err = waiter.await.unwrap();
        assert!(matches!(err, Error::Interrupted(InterruptReason::PgStopping)));
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let cond = InterruptCondition::never();
        let res = tokio::time::timeout(Duration::from_millis(20), cond.interrupted()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_stopped() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(stopped(rx));
        tx.send_replace(true);
        assert!(waiter.await.unwrap().is_shutdown());
    }
}
