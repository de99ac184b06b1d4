//! Core type definitions for ShardIO
//!
//! Identifiers and metadata records for objects stored in a placement
//! group: snapshot ids, object identifiers (heads and clones), versions,
//! and the per-object state cached by the object context layer.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Snapshot identifier
///
/// Two values at the top of the range are reserved: [`SnapId::NOSNAP`]
/// names the live head of an object and [`SnapId::SNAPDIR`] is the
/// snap-dir pseudo object that always stands in for the head.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, From, Into,
)]
pub struct SnapId(u64);

impl SnapId {
    /// The head (non-snapshot) version of an object
    pub const NOSNAP: Self = Self(u64::MAX - 1);
    /// The snap-dir pseudo identifier
    pub const SNAPDIR: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_head(self) -> bool {
        self.0 == Self::NOSNAP.0
    }

    #[must_use]
    pub const fn is_snapdir(self) -> bool {
        self.0 == Self::SNAPDIR.0
    }
}

impl fmt::Debug for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapId({self})")
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "head")
        } else if self.is_snapdir() {
            write!(f, "snapdir")
        } else {
            write!(f, "{:x}", self.0)
        }
    }
}

/// Object identifier within a pool
///
/// Names a head object, one of its clones (by snapshot id), or the
/// snap-dir pseudo object. The total order matches the order backfill
/// walks a placement group in, so it can be compared against a
/// `last_backfill` boundary.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub pool: i64,
    pub namespace: String,
    pub name: String,
    /// Locator key; objects with an empty key sort by name
    pub key: String,
    pub hash: u32,
    pub snap: SnapId,
    /// Sorts after every other identifier
    pub max: bool,
}

impl ObjectId {
    /// Create a fully specified identifier
    #[must_use]
    pub fn new(
        pool: i64,
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        hash: u32,
        snap: SnapId,
    ) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            name: name.into(),
            key: key.into(),
            hash,
            snap,
            max: false,
        }
    }

    /// Create the head identifier of `name` in the default namespace,
    /// hashing the name for placement
    #[must_use]
    pub fn head_of(pool: i64, name: impl Into<String>) -> Self {
        let name = name.into();
        let hash = crc32c::crc32c(name.as_bytes());
        Self::new(pool, "", name, "", hash, SnapId::NOSNAP)
    }

    /// The smallest identifier
    #[must_use]
    pub fn min() -> Self {
        Self::new(i64::MIN, "", "", "", 0, SnapId::new(0))
    }

    /// The largest identifier (an open backfill boundary)
    #[must_use]
    pub fn max() -> Self {
        Self {
            max: true,
            ..Self::min()
        }
    }

    #[must_use]
    pub const fn is_max(&self) -> bool {
        self.max
    }

    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.snap.is_head()
    }

    #[must_use]
    pub const fn is_snapdir(&self) -> bool {
        self.snap.is_snapdir()
    }

    /// Identifier of this object's head
    #[must_use]
    pub fn head(&self) -> Self {
        self.with_snap(SnapId::NOSNAP)
    }

    /// Identifier of this object's snap-dir
    #[must_use]
    pub fn snapdir(&self) -> Self {
        self.with_snap(SnapId::SNAPDIR)
    }

    /// Sibling identifier at another snapshot
    #[must_use]
    pub fn with_snap(&self, snap: SnapId) -> Self {
        Self {
            snap,
            ..self.clone()
        }
    }

    /// Placement key with the hash bits reversed, so that objects sort by
    /// the low-order hash bits first (the order PG splitting respects)
    #[must_use]
    pub const fn bitwise_key(&self) -> u32 {
        self.hash.reverse_bits()
    }

    /// Locator key used for ordering
    #[must_use]
    pub fn effective_key(&self) -> &str {
        if self.key.is_empty() {
            &self.name
        } else {
            &self.key
        }
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.max
            .cmp(&other.max)
            .then_with(|| self.pool.cmp(&other.pool))
            .then_with(|| self.bitwise_key().cmp(&other.bitwise_key()))
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| {
                if self.key.is_empty() && other.key.is_empty() {
                    Ordering::Equal
                } else {
                    self.effective_key().cmp(other.effective_key())
                }
            })
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.snap.cmp(&other.snap))
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max {
            return write!(f, "MAX");
        }
        write!(
            f,
            "{}:{:08x}:{}:{}:{}:{}",
            self.pool, self.bitwise_key(), self.namespace, self.key, self.name, self.snap
        )
    }
}

/// Version of an object within a placement group log
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Eversion {
    pub epoch: u32,
    pub version: u64,
}

impl Eversion {
    #[must_use]
    pub const fn new(epoch: u32, version: u64) -> Self {
        Self { epoch, version }
    }
}

impl fmt::Display for Eversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.version)
    }
}

/// Persisted per-object metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub soid: ObjectId,
    pub size: u64,
    pub version: Eversion,
    pub prior_version: Eversion,
    pub user_version: u64,
}

impl ObjectInfo {
    /// Blank metadata for an object that has never been written
    #[must_use]
    pub fn new(soid: ObjectId) -> Self {
        Self {
            soid,
            size: 0,
            version: Eversion::default(),
            prior_version: Eversion::default(),
            user_version: 0,
        }
    }
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(v{} uv{} s {})",
            self.soid, self.version, self.user_version, self.size
        )
    }
}

/// Object metadata plus whether the object currently exists
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectState {
    pub oi: ObjectInfo,
    pub exists: bool,
}

impl ObjectState {
    #[must_use]
    pub const fn new(oi: ObjectInfo, exists: bool) -> Self {
        Self { oi, exists }
    }

    /// State of an object the backend has no record of
    #[must_use]
    pub fn absent(soid: ObjectId) -> Self {
        Self::new(ObjectInfo::new(soid), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_id_reserved() {
        assert!(SnapId::NOSNAP.is_head());
        assert!(SnapId::SNAPDIR.is_snapdir());
        assert!(SnapId::new(10) < SnapId::NOSNAP);
        assert_eq!(SnapId::NOSNAP.to_string(), "head");
        assert_eq!(SnapId::new(0x30).to_string(), "30");
    }

    #[test]
    fn test_head_and_clone_ids() {
        let head = ObjectId::head_of(1, "rbd_data.1");
        assert!(head.is_head());

        let clone = head.with_snap(SnapId::new(4));
        assert!(!clone.is_head());
        assert_eq!(clone.head(), head);
        assert!(head.snapdir().is_snapdir());
    }

    #[test]
    fn test_clones_sort_before_head() {
        let head = ObjectId::head_of(1, "obj");
        let c10 = head.with_snap(SnapId::new(10));
        let c20 = head.with_snap(SnapId::new(20));
        assert!(c10 < c20);
        assert!(c20 < head);
        assert!(head < head.snapdir());
    }

    #[test]
    fn test_min_max_bounds() {
        let head = ObjectId::head_of(3, "obj");
        assert!(ObjectId::min() < head);
        assert!(head < ObjectId::max());
        assert!(ObjectId::max().is_max());
        assert_eq!(ObjectId::max().to_string(), "MAX");
    }

    #[test]
    fn test_order_uses_reversed_hash() {
        // 0x1 reversed is 0x8000_0000, 0x2 reversed is 0x4000_0000
        let a = ObjectId::new(1, "", "a", "", 0x1, SnapId::NOSNAP);
        let b = ObjectId::new(1, "", "b", "", 0x2, SnapId::NOSNAP);
        assert!(b < a);
    }

    #[test]
    fn test_eversion_order() {
        assert!(Eversion::new(1, 10) < Eversion::new(2, 1));
        assert!(Eversion::new(2, 1) < Eversion::new(2, 2));
        assert_eq!(Eversion::new(3, 7).to_string(), "3'7");
    }
}
