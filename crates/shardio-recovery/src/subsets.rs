//! Recovery subsets
//!
//! For an object being recovered, split its byte range into the part that
//! has to be pushed over the network and the parts that can be cloned from
//! an older clone the recovering replica already holds.
//!
//! A donor clone qualifies when the replica is not missing it and backfill
//! has already passed it. Only the overlap chain between the target and
//! the donor can be cloned; the chain is intersected clone by clone, so the
//! cloneable range only shrinks as the walk moves away from the target.
//! Overlaps that fragment into more than `osd_recover_clone_overlap_limit`
//! intervals are not worth cloning and are pushed instead.

use serde::{Deserialize, Serialize};
use shardio_common::{Error, IntervalSet, MissingSet, ObjectId, RecoveryConfig, Result, SnapSet};
use std::collections::BTreeMap;
use tracing::debug;

use crate::recovery_info::ObjectRecoveryInfo;

/// How to recover the bytes of one object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySubsets {
    /// Ranges that must be pushed
    pub data_subset: IntervalSet,
    /// Ranges to clone locally, by donor clone
    pub clone_subsets: BTreeMap<ObjectId, IntervalSet>,
}

impl RecoverySubsets {
    /// Total bytes recovered locally instead of pushed
    #[must_use]
    pub fn cloned_bytes(&self) -> u64 {
        self.clone_subsets.values().map(IntervalSet::size).sum()
    }

    /// Total bytes to push
    #[must_use]
    pub fn pushed_bytes(&self) -> u64 {
        self.data_subset.size()
    }
}

fn usable_donor(clone: &ObjectId, missing: &MissingSet, last_backfill: &ObjectId) -> bool {
    !missing.is_missing(clone) && clone < last_backfill
}

fn too_fragmented(cloning: &IntervalSet, config: &RecoveryConfig) -> bool {
    let limit = usize::try_from(config.osd_recover_clone_overlap_limit).unwrap_or(usize::MAX);
    cloning.num_intervals() > limit
}

/// Compute the subsets for recovering clone `soid`
pub fn calc_clone_subsets(
    snapset: &SnapSet,
    soid: &ObjectId,
    missing: &MissingSet,
    last_backfill: &ObjectId,
    config: &RecoveryConfig,
) -> RecoverySubsets {
    debug!(
        "calc_clone_subsets {} clone_overlap {:?}",
        soid, snapset.clone_overlap
    );
    let mut subsets = RecoverySubsets::default();

    let size = snapset.clone_size_of(soid.snap);
    if size > 0 {
        subsets.data_subset.insert(0, size);
    }
    if !config.osd_recover_clone_overlap {
        debug!("calc_clone_subsets {} clone overlap recovery disabled", soid);
        return subsets;
    }

    let index = snapset
        .clones
        .iter()
        .position(|snap| *snap == soid.snap)
        .unwrap_or(snapset.clones.len());

    let mut cloning = IntervalSet::new();

    // Older clones
    let mut prev = IntervalSet::new();
    if size > 0 {
        prev.insert(0, size);
    }
    for &snap in snapset.clones[..index].iter().rev() {
        let clone = soid.with_snap(snap);
        prev.intersection_of(&snapset.clone_overlap_of(snap));
        if usable_donor(&clone, missing, last_backfill) {
            debug!("calc_clone_subsets {} has prev {} overlap {}", soid, clone, prev);
            cloning.union_of(&prev);
            subsets.clone_subsets.insert(clone, prev.clone());
            break;
        }
        debug!(
            "calc_clone_subsets {} does not have prev {} overlap {}",
            soid, clone, prev
        );
    }

    // Newer clones. A donor found here is credited with `prev`, the range
    // shared with the older side, not with `next`.
    let mut next = IntervalSet::new();
    if size > 0 {
        next.insert(0, size);
    }
    for pair in snapset.clones.windows(2).skip(index) {
        let (older, snap) = (pair[0], pair[1]);
        let clone = soid.with_snap(snap);
        next.intersection_of(&snapset.clone_overlap_of(older));
        if usable_donor(&clone, missing, last_backfill) {
            debug!("calc_clone_subsets {} has next {} overlap {}", soid, clone, prev);
            cloning.union_of(&prev);
            subsets.clone_subsets.insert(clone, prev.clone());
            break;
        }
        debug!(
            "calc_clone_subsets {} does not have next {} overlap {}",
            soid, clone, next
        );
    }

    if too_fragmented(&cloning, config) {
        debug!("calc_clone_subsets {} skipping clone, too many holes", soid);
        subsets.clone_subsets.clear();
        cloning.clear();
    }

    subsets.data_subset.subtract(&cloning);
    debug!(
        "calc_clone_subsets {} data_subset {} clone_subsets {:?}",
        soid, subsets.data_subset, subsets.clone_subsets
    );
    subsets
}

/// Compute the subsets for recovering `head`, `size` bytes long.
///
/// Only the dirty regions recorded for the head in `missing` are
/// recovered. Fails with `InvalidArgument` if `head` is not missing.
pub fn calc_head_subsets(
    size: u64,
    snapset: &SnapSet,
    head: &ObjectId,
    missing: &MissingSet,
    last_backfill: &ObjectId,
    config: &RecoveryConfig,
) -> Result<RecoverySubsets> {
    debug!(
        "calc_head_subsets {} clone_overlap {:?}",
        head, snapset.clone_overlap
    );
    let item = missing
        .item(head)
        .ok_or_else(|| Error::invalid_argument(format!("{head} is not in the missing set")))?;

    let mut subsets = RecoverySubsets::default();
    if size > 0 {
        subsets.data_subset.insert(0, size);
    }
    subsets
        .data_subset
        .intersection_of(&item.clean_regions.dirty_regions());
    debug!("calc_head_subsets {} data_subset {}", head, subsets.data_subset);

    if !config.osd_recover_clone_overlap {
        debug!("calc_head_subsets {} clone overlap recovery disabled", head);
        return Ok(subsets);
    }

    let mut cloning = IntervalSet::new();
    let mut prev = IntervalSet::new();
    let mut donor = head.clone();
    if size > 0 {
        prev.insert(0, size);
    }
    for &snap in snapset.clones.iter().rev() {
        donor = head.with_snap(snap);
        prev.intersection_of(&snapset.clone_overlap_of(snap));
        if usable_donor(&donor, missing, last_backfill) {
            debug!("calc_head_subsets {} has prev {} overlap {}", head, donor, prev);
            cloning = prev;
            break;
        }
        debug!(
            "calc_head_subsets {} does not have prev {} overlap {}",
            head, donor, prev
        );
    }

    cloning.intersection_of(&subsets.data_subset);
    if cloning.is_empty() {
        debug!("calc_head_subsets {} nothing to clone", head);
        return Ok(subsets);
    }

    if too_fragmented(&cloning, config) {
        debug!("calc_head_subsets {} skipping clone, too many holes", head);
        return Ok(subsets);
    }

    subsets.data_subset.subtract(&cloning);
    subsets.clone_subsets.insert(donor, cloning);
    debug!(
        "calc_head_subsets {} data_subset {} clone_subsets {:?}",
        head, subsets.data_subset, subsets.clone_subsets
    );
    Ok(subsets)
}

/// Copy computed subsets into the recovery record of the object
pub fn set_subsets(subsets: &RecoverySubsets, recovery_info: &mut ObjectRecoveryInfo) {
    recovery_info.copy_subset = subsets.data_subset.clone();
    recovery_info.clone_subset = subsets.clone_subsets.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardio_common::{CleanRegions, Eversion, SnapId};

    fn head() -> ObjectId {
        ObjectId::head_of(1, "hobj_ms1")
    }

    fn clone(snap: u64) -> ObjectId {
        head().with_snap(SnapId::new(snap))
    }

    /// Clones 10, 20, 30 of 100 bytes; 10 shares all of its bytes with 20,
    /// 20 shares the first half with 30
    fn snapset() -> SnapSet {
        let mut ss = SnapSet::new(SnapId::new(30));
        for (snap, overlap) in [
            (10, IntervalSet::from_range(0, 100)),
            (20, IntervalSet::from_range(0, 50)),
            (30, IntervalSet::new()),
        ] {
            ss.add_clone(SnapId::new(snap), 100, overlap, vec![SnapId::new(snap)])
                .unwrap();
        }
        ss
    }

    fn missing(oids: &[ObjectId]) -> MissingSet {
        let mut missing = MissingSet::new();
        for oid in oids {
            missing.add(
                oid.clone(),
                Eversion::new(5, 10),
                Eversion::default(),
                CleanRegions::fully_dirty(),
            );
        }
        missing
    }

    fn range(start: u64, len: u64) -> IntervalSet {
        IntervalSet::from_range(start, len)
    }

    fn assert_well_formed(subsets: &RecoverySubsets, size: u64) {
        let mut claimed = IntervalSet::new();
        for set in subsets.clone_subsets.values() {
            claimed.union_of(set);
        }
        for set in std::iter::once(&subsets.data_subset).chain(subsets.clone_subsets.values()) {
            for (start, len) in set.iter() {
                assert!(start + len <= size, "{set} exceeds {size}");
            }
        }
        for (start, len) in subsets.data_subset.iter() {
            assert!(!claimed.intersects(start, len), "data overlaps clones");
        }
    }

    #[test]
    fn test_clone_from_older_clone() {
        let cfg = RecoveryConfig::default();
        // Backfill has passed clone 10 but not clone 30
        let subsets = calc_clone_subsets(
            &snapset(),
            &clone(20),
            &missing(&[clone(20)]),
            &clone(30),
            &cfg,
        );
        assert_eq!(
            subsets.clone_subsets,
            BTreeMap::from([(clone(10), range(0, 100))])
        );
        assert!(subsets.data_subset.is_empty());
        assert_well_formed(&subsets, 100);
    }

    #[test]
    fn test_older_clone_missing_pushes_everything() {
        let cfg = RecoveryConfig::default();
        let subsets = calc_clone_subsets(
            &snapset(),
            &clone(20),
            &missing(&[clone(10), clone(20)]),
            &clone(30),
            &cfg,
        );
        assert!(subsets.clone_subsets.is_empty());
        assert_eq!(subsets.data_subset, range(0, 100));
    }

    #[test]
    fn test_older_clone_past_backfill_is_not_a_donor() {
        let cfg = RecoveryConfig::default();
        // Backfill has not reached any clone yet
        let subsets = calc_clone_subsets(
            &snapset(),
            &clone(20),
            &missing(&[clone(20)]),
            &ObjectId::min(),
            &cfg,
        );
        assert!(subsets.clone_subsets.is_empty());
        assert_eq!(subsets.data_subset, range(0, 100));
    }

    #[test]
    fn test_newer_clone_donates_older_overlap() {
        let cfg = RecoveryConfig::default();
        let subsets = calc_clone_subsets(
            &snapset(),
            &clone(20),
            &missing(&[clone(10), clone(20)]),
            &ObjectId::max(),
            &cfg,
        );
        // No older donor: `prev` is the chain through clone 10, i.e. all
        // 100 bytes, and that is what clone 30 is credited with
        assert_eq!(
            subsets.clone_subsets,
            BTreeMap::from([(clone(30), range(0, 100))])
        );
        assert!(subsets.data_subset.is_empty());
        assert_well_formed(&subsets, 100);
    }

    #[test]
    fn test_overlap_chain_intersects() {
        let cfg = RecoveryConfig::default();
        let mut ss = SnapSet::new(SnapId::new(30));
        ss.add_clone(SnapId::new(10), 100, range(0, 40), vec![SnapId::new(10)])
            .unwrap();
        ss.add_clone(SnapId::new(20), 100, range(20, 80), vec![SnapId::new(20)])
            .unwrap();
        ss.add_clone(SnapId::new(30), 100, IntervalSet::new(), vec![SnapId::new(30)])
            .unwrap();

        // 20 is missing too, so the walk from 30 goes on to 10
        let subsets = calc_clone_subsets(
            &ss,
            &clone(30),
            &missing(&[clone(20), clone(30)]),
            &ObjectId::max(),
            &cfg,
        );
        assert_eq!(
            subsets.clone_subsets,
            BTreeMap::from([(clone(10), range(20, 20))])
        );
        let mut expected = range(0, 20);
        expected.insert(40, 60);
        assert_eq!(subsets.data_subset, expected);
        assert_well_formed(&subsets, 100);
    }

    #[test]
    fn test_overlap_recovery_disabled() {
        let cfg = RecoveryConfig {
            osd_recover_clone_overlap: false,
            ..RecoveryConfig::default()
        };
        let subsets = calc_clone_subsets(
            &snapset(),
            &clone(20),
            &missing(&[clone(20)]),
            &ObjectId::max(),
            &cfg,
        );
        assert!(subsets.clone_subsets.is_empty());
        assert_eq!(subsets.data_subset, range(0, 100));

        let subsets = calc_head_subsets(
            300,
            &snapset(),
            &head(),
            &missing(&[head()]),
            &ObjectId::max(),
            &cfg,
        )
        .unwrap();
        assert!(subsets.clone_subsets.is_empty());
        assert_eq!(subsets.data_subset, range(0, 300));
    }

    fn fragmented_snapset(fragments: u64) -> SnapSet {
        let mut overlap = IntervalSet::new();
        for i in 0..fragments {
            overlap.insert(i * 10, 5);
        }
        let mut ss = SnapSet::new(SnapId::new(20));
        ss.add_clone(SnapId::new(10), 200, overlap, vec![SnapId::new(10)])
            .unwrap();
        ss.add_clone(SnapId::new(20), 200, IntervalSet::new(), vec![SnapId::new(20)])
            .unwrap();
        ss
    }

    #[test]
    fn test_fragmentation_guard() {
        let cfg = RecoveryConfig::default();
        let subsets = calc_clone_subsets(
            &fragmented_snapset(12),
            &clone(20),
            &missing(&[clone(20)]),
            &ObjectId::max(),
            &cfg,
        );
        assert!(subsets.clone_subsets.is_empty());
        assert_eq!(subsets.data_subset, range(0, 200));

        // At the limit it is still cloned
        let subsets = calc_clone_subsets(
            &fragmented_snapset(10),
            &clone(20),
            &missing(&[clone(20)]),
            &ObjectId::max(),
            &cfg,
        );
        assert_eq!(subsets.clone_subsets[&clone(10)].num_intervals(), 10);
        assert_eq!(subsets.pushed_bytes() + subsets.cloned_bytes(), 200);
        assert_well_formed(&subsets, 200);
    }

    #[test]
    fn test_unknown_clone_has_no_size() {
        let cfg = RecoveryConfig::default();
        let subsets = calc_clone_subsets(
            &snapset(),
            &clone(25),
            &missing(&[clone(25)]),
            &ObjectId::max(),
            &cfg,
        );
        assert!(subsets.data_subset.is_empty());
        assert!(subsets.clone_subsets.values().all(IntervalSet::is_empty));
    }

    #[test]
    fn test_head_clones_from_newest_clone() {
        let cfg = RecoveryConfig::default();
        let mut ss = snapset();
        ss.clone_overlap.insert(SnapId::new(30), range(0, 60));

        let subsets = calc_head_subsets(
            100,
            &ss,
            &head(),
            &missing(&[head()]),
            &ObjectId::max(),
            &cfg,
        )
        .unwrap();
        assert_eq!(
            subsets.clone_subsets,
            BTreeMap::from([(clone(30), range(0, 60))])
        );
        assert_eq!(subsets.data_subset, range(60, 40));
        assert_well_formed(&subsets, 100);
    }

    #[test]
    fn test_head_only_recovers_dirty_regions() {
        let cfg = RecoveryConfig::default();
        let mut ss = snapset();
        ss.clone_overlap.insert(SnapId::new(30), range(0, 60));

        let mut clean = CleanRegions::default();
        clean.mark_data_region_dirty(40, 40);
        let mut missing = MissingSet::new();
        missing.add(head(), Eversion::new(5, 11), Eversion::new(5, 9), clean);

        let subsets =
            calc_head_subsets(100, &ss, &head(), &missing, &ObjectId::max(), &cfg).unwrap();
        assert_eq!(
            subsets.clone_subsets,
            BTreeMap::from([(clone(30), range(40, 20))])
        );
        assert_eq!(subsets.data_subset, range(60, 20));
    }

    #[test]
    fn test_head_nothing_to_clone() {
        let cfg = RecoveryConfig::default();
        // Clone 30 shares nothing with the head
        let subsets = calc_head_subsets(
            100,
            &snapset(),
            &head(),
            &missing(&[head()]),
            &ObjectId::max(),
            &cfg,
        )
        .unwrap();
        assert!(subsets.clone_subsets.is_empty());
        assert_eq!(subsets.data_subset, range(0, 100));
    }

    #[test]
    fn test_head_fragmentation_guard() {
        let cfg = RecoveryConfig {
            osd_recover_clone_overlap_limit: 3,
            ..RecoveryConfig::default()
        };
        let mut ss = fragmented_snapset(4);
        let overlap = ss.clone_overlap_of(SnapId::new(10));
        ss.clone_overlap.insert(SnapId::new(20), overlap);

        let subsets = calc_head_subsets(
            200,
            &ss,
            &head(),
            &missing(&[head()]),
            &ObjectId::max(),
            &cfg,
        )
        .unwrap();
        assert!(subsets.clone_subsets.is_empty());
        assert_eq!(subsets.data_subset, range(0, 200));
    }

    #[test]
    fn test_head_must_be_missing() {
        let cfg = RecoveryConfig::default();
        let err = calc_head_subsets(
            100,
            &snapset(),
            &head(),
            &MissingSet::new(),
            &ObjectId::max(),
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_set_subsets() {
        let cfg = RecoveryConfig::default();
        let subsets = calc_clone_subsets(
            &snapset(),
            &clone(20),
            &missing(&[clone(20)]),
            &ObjectId::max(),
            &cfg,
        );
        let mut info = ObjectRecoveryInfo::new(clone(20), Eversion::new(5, 10), 100);
        set_subsets(&subsets, &mut info);
        assert_eq!(info.copy_subset, subsets.data_subset);
        assert_eq!(info.clone_subset, subsets.clone_subsets);
    }

    #[test]
    fn test_subsets_serialize() {
        let subsets = RecoverySubsets {
            data_subset: range(0, 10),
            clone_subsets: BTreeMap::new(),
        };
        let json = serde_json::to_string(&subsets).unwrap();
        let back: RecoverySubsets = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subsets);
    }
}
