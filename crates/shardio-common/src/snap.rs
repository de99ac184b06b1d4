//! Snapshot sets
//!
//! Every head object carries a [`SnapSet`] describing the clones that were
//! taken of it: which snapshot ids exist as clones, how large each clone
//! is, and which byte ranges each clone shares with the next newer one.

use crate::error::{Error, Result};
use crate::interval::IntervalSet;
use crate::types::{ObjectId, SnapId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Per-head record of its clones
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapSet {
    /// Most recent snapshot sequence seen by the head
    pub seq: SnapId,
    /// Clone snapshot ids, oldest first
    pub clones: Vec<SnapId>,
    /// Bytes each clone shares with the next newer clone, or the head for the newest
    pub clone_overlap: BTreeMap<SnapId, IntervalSet>,
    pub clone_size: BTreeMap<SnapId, u64>,
    /// Snapshots each clone stands for, newest first
    pub clone_snaps: BTreeMap<SnapId, Vec<SnapId>>,
}

impl SnapSet {
    #[must_use]
    pub fn new(seq: SnapId) -> Self {
        Self {
            seq,
            ..Self::default()
        }
    }

    /// Append a clone newer than every existing one
    pub fn add_clone(
        &mut self,
        clone: SnapId,
        size: u64,
        overlap: IntervalSet,
        snaps: Vec<SnapId>,
    ) -> Result<()> {
        if self.clones.last().is_some_and(|last| *last >= clone) {
            return Err(Error::invalid_argument(format!(
                "clone {clone} is not newer than {:?}",
                self.clones.last()
            )));
        }
        self.clones.push(clone);
        self.clone_size.insert(clone, size);
        self.clone_overlap.insert(clone, overlap);
        self.clone_snaps.insert(clone, snaps);
        if clone > self.seq {
            self.seq = clone;
        }
        Ok(())
    }

    /// Check the structural invariants: clones ascending, size and overlap
    /// recorded for every clone
    pub fn validate(&self) -> Result<()> {
        if !self.clones.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::corrupted(format!(
                "snapset clones out of order: {:?}",
                self.clones
            )));
        }
        for clone in &self.clones {
            if !self.clone_size.contains_key(clone) || !self.clone_overlap.contains_key(clone) {
                return Err(Error::corrupted(format!(
                    "snapset missing size or overlap for clone {clone}"
                )));
            }
        }
        Ok(())
    }

    /// Recorded size of a clone; unknown clones read as empty
    #[must_use]
    pub fn clone_size_of(&self, clone: SnapId) -> u64 {
        self.clone_size.get(&clone).copied().unwrap_or(0)
    }

    /// Recorded overlap of a clone with its successor; unknown clones
    /// overlap nothing
    #[must_use]
    pub fn clone_overlap_of(&self, clone: SnapId) -> IntervalSet {
        self.clone_overlap.get(&clone).cloned().unwrap_or_default()
    }

    /// Position of a clone in `clones`
    #[must_use]
    pub fn clone_index(&self, clone: SnapId) -> Option<usize> {
        self.clones.iter().position(|c| *c == clone)
    }

    /// Bytes held only by `clone`: its size minus whatever it shares with
    /// the next newer clone
    #[must_use]
    pub fn clone_bytes(&self, clone: SnapId) -> u64 {
        let size = self.clone_size_of(clone);
        let mut shared = IntervalSet::from_range(0, size);
        shared.intersection_of(&self.clone_overlap_of(clone));
        size - shared.size()
    }

    /// Map a snapshot read to the object that actually holds its data.
    ///
    /// A snap newer than `seq` was taken after the last write, so the
    /// head serves it. Otherwise the data lives in the oldest clone at or
    /// after the snap, provided that clone covers the snap.
    #[must_use]
    pub fn resolve_oid(&self, oid: &ObjectId) -> Option<ObjectId> {
        if oid.snap > self.seq {
            return Some(oid.head());
        }
        let idx = self.clones.partition_point(|c| *c < oid.snap);
        let clone = *self.clones.get(idx)?;
        let covers = self
            .clone_snaps
            .get(&clone)
            .is_some_and(|snaps| snaps.contains(&oid.snap));
        covers.then(|| oid.with_snap(clone))
    }
}

impl fmt::Display for SnapSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=[", self.seq)?;
        for (i, clone) in self.clones.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{clone}")?;
        }
        write!(f, "]")
    }
}

/// Snapshot set of one head, shared between the head's object context and
/// anything consulting it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapSetContext {
    pub oid: ObjectId,
    pub snapset: SnapSet,
    pub exists: bool,
}

pub type SnapSetContextRef = Arc<SnapSetContext>;

impl SnapSetContext {
    #[must_use]
    pub fn new(oid: ObjectId, snapset: SnapSet, exists: bool) -> Self {
        Self {
            oid,
            snapset,
            exists,
        }
    }

    /// Context for a head with no snapshot history yet
    #[must_use]
    pub fn empty(oid: ObjectId) -> Self {
        Self::new(oid, SnapSet::default(), false)
    }
}
