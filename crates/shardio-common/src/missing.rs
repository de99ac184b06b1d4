//! Missing sets
//!
//! Per-PG record of the objects a replica does not yet have at the
//! required version. For each missing object it keeps the byte regions
//! still known to be clean, so recovery can skip data the replica already
//! holds.

use crate::interval::IntervalSet;
use crate::types::{Eversion, ObjectId};
use std::collections::BTreeMap;

/// Regions of an object that are unchanged since the version the replica
/// has
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanRegions {
    pub clean_offsets: IntervalSet,
    pub clean_omap: bool,
    /// The object did not exist at the replica's version
    pub new_object: bool,
}

impl Default for CleanRegions {
    fn default() -> Self {
        Self {
            clean_offsets: IntervalSet::from_range(0, u64::MAX),
            clean_omap: true,
            new_object: false,
        }
    }
}

impl CleanRegions {
    /// Nothing can be assumed clean
    #[must_use]
    pub fn fully_dirty() -> Self {
        let mut regions = Self::default();
        regions.mark_fully_dirty();
        regions
    }

    pub fn mark_fully_dirty(&mut self) {
        self.clean_offsets.clear();
        self.clean_omap = false;
    }

    pub fn mark_data_region_dirty(&mut self, offset: u64, len: u64) {
        self.clean_offsets.erase(offset, len);
    }

    pub fn mark_omap_dirty(&mut self) {
        self.clean_omap = false;
    }

    pub fn mark_object_new(&mut self) {
        self.new_object = true;
    }

    #[must_use]
    pub fn is_clean_region(&self, offset: u64, len: u64) -> bool {
        self.clean_offsets.contains(offset, len)
    }

    /// Everything not known clean
    #[must_use]
    pub fn dirty_regions(&self) -> IntervalSet {
        let mut dirty = IntervalSet::from_range(0, u64::MAX);
        dirty.subtract(&self.clean_offsets);
        dirty
    }
}

/// One entry of a missing set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingItem {
    /// Version the replica must reach
    pub need: Eversion,
    /// Version the replica currently has
    pub have: Eversion,
    pub clean_regions: CleanRegions,
}

/// Objects missing on one replica, ordered like the PG
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MissingSet {
    items: BTreeMap<ObjectId, MissingItem>,
}

impl MissingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `oid` as missing, replacing any previous entry
    pub fn add(&mut self, oid: ObjectId, need: Eversion, have: Eversion, clean_regions: CleanRegions) {
        self.items.insert(
            oid,
            MissingItem {
                need,
                have,
                clean_regions,
            },
        );
    }

    /// Forget `oid`, returning its entry if it was missing
    pub fn rm(&mut self, oid: &ObjectId) -> Option<MissingItem> {
        self.items.remove(oid)
    }

    #[must_use]
    pub fn is_missing(&self, oid: &ObjectId) -> bool {
        self.items.contains_key(oid)
    }

    #[must_use]
    pub fn item(&self, oid: &ObjectId) -> Option<&MissingItem> {
        self.items.get(oid)
    }

    #[must_use]
    pub const fn get_items(&self) -> &BTreeMap<ObjectId, MissingItem> {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_regions_default_is_clean() {
        let regions = CleanRegions::default();
        assert!(regions.is_clean_region(0, 4096));
        assert!(regions.dirty_regions().is_empty());
    }

    #[test]
    fn test_dirty_regions() {
        let mut regions = CleanRegions::default();
        regions.mark_data_region_dirty(100, 50);
        regions.mark_data_region_dirty(4096, 4096);

        let dirty = regions.dirty_regions();
        assert_eq!(dirty.iter().collect::<Vec<_>>(), vec![(100, 50), (4096, 4096)]);
        assert!(!regions.is_clean_region(120, 10));
        assert!(regions.is_clean_region(0, 100));
    }

    #[test]
    fn test_fully_dirty() {
        let regions = CleanRegions::fully_dirty();
        assert!(!regions.clean_omap);
        assert_eq!(regions.dirty_regions().size(), u64::MAX);
    }

    #[test]
    fn test_missing_set_add_rm() {
        let mut missing = MissingSet::new();
        let oid = ObjectId::head_of(1, "obj");
        missing.add(
            oid.clone(),
            Eversion::new(5, 10),
            Eversion::new(5, 8),
            CleanRegions::default(),
        );
        assert!(missing.is_missing(&oid));
        assert_eq!(missing.item(&oid).unwrap().need, Eversion::new(5, 10));
        assert_eq!(missing.len(), 1);

        assert!(missing.rm(&oid).is_some());
        assert!(missing.is_empty());
    }
}
