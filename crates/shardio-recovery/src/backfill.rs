//! Backfill intervals
//!
//! Backfill walks the object namespace in order. A [`BackfillInterval`]
//! holds one scanned window of it: the objects found in `[begin, end)` and
//! their versions.

use shardio_common::{Eversion, ObjectId};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillInterval {
    /// Log version the scan is current as of
    pub version: Eversion,
    pub begin: ObjectId,
    pub end: ObjectId,
    pub objects: BTreeMap<ObjectId, Eversion>,
    /// Whether `objects` has been filled by a scan
    pub populated: bool,
}

impl Default for BackfillInterval {
    fn default() -> Self {
        Self::new(ObjectId::min())
    }
}

impl BackfillInterval {
    #[must_use]
    pub fn new(begin: ObjectId) -> Self {
        Self::with_end(begin, ObjectId::min())
    }

    #[must_use]
    pub const fn with_end(begin: ObjectId, end: ObjectId) -> Self {
        Self {
            version: Eversion::new(0, 0),
            begin,
            end,
            objects: BTreeMap::new(),
            populated: false,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Clear, then start an empty interval at `start`
    pub fn reset(&mut self, start: ObjectId) {
        self.clear();
        self.begin = start.clone();
        self.end = start;
    }

    /// Drop every object at or before `bound`
    pub fn trim_to(&mut self, bound: &ObjectId) {
        self.objects.retain(|oid, _| oid > bound);
    }

    /// Move `begin` up to the first remaining object
    pub fn trim(&mut self) {
        self.begin = match self.objects.keys().next() {
            Some(first) => first.clone(),
            None => self.end.clone(),
        };
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether the interval reaches the end of the namespace
    #[must_use]
    pub const fn extends_to_end(&self) -> bool {
        self.end.is_max()
    }

    /// Drop the first object and move `begin` past it
    pub fn pop_front(&mut self) -> Option<(ObjectId, Eversion)> {
        let first = self.objects.pop_first()?;
        self.trim();
        Some(first)
    }
}

impl fmt::Display for BackfillInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackfillInfo(populated: {} {}-{} {} objects",
            self.populated,
            self.begin,
            self.end,
            self.objects.len()
        )?;
        if !self.objects.is_empty() {
            write!(f, " {{")?;
            for (i, (oid, version)) in self.objects.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{oid}={version}")?;
            }
            write!(f, "}}")?;
        }
        write!(f, ")")
    }
}
